//! Request governance: atomic capacity reservation and per-caller
//! token-bucket rate limiting, both scripted in the state store so they
//! hold across every agent process.

pub mod capacity;
pub mod rate;

pub use capacity::{CapacityLimiter, Reservation};
pub use rate::{resolve_group, token_fingerprint, RateDecision, RateLimiter};
