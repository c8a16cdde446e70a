//! xray-agent: control-plane agent for a local VLESS/REALITY proxy.
//!
//! The agent sits next to the proxy daemon and gives remote callers (a
//! Telegram bot backend, operator tooling, a test harness) a safe,
//! concurrent, auditable way to manage proxy users:
//!
//! - **Job queue & worker** — durable enqueue with idempotent
//!   deduplication, a `queued → running → done|error` state machine, and
//!   at-least-once execution against the proxy's gRPC control API.
//! - **Bulk restore** — bounded-concurrency re-add of many users with
//!   per-item outcome classification.
//! - **Guard loop** — periodic anti-sharing surveillance driven by the
//!   proxy's own access log (WARN → GRACE → BAN → THANKS).
//! - **Request governance** — Redis-scripted token buckets and atomic
//!   capacity reservation shared across all agent processes.
//!
//! Three binaries share this library: `xray-agent-api` (HTTP surface),
//! `xray-agent-worker` (queue worker) and `xray-agent-guard` (guard
//! loop). The proxy remains the source of truth for the user set; every
//! piece of agent state lives in Redis under a TTL.

pub mod config;
pub mod error;
pub mod guard;
pub mod handlers;
pub mod jobs;
pub mod limits;
pub mod links;
pub mod logwatch;
pub mod middleware;
pub mod notify;
pub mod observability;
pub mod restore;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod xray;
