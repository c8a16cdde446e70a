//! Vendored, pre-generated protobuf message types for the Xray control
//! API, plus the gRPC method paths and typed-message type URLs the agent
//! calls them with.
//!
//! The structs below are prost-build output for the subset of
//! `xray-core`'s proto tree the agent actually uses (`common/serial`,
//! `common/protocol`, `proxy/vless`, `app/proxyman/command`,
//! `app/stats/command`). They are checked in rather than generated at
//! build time so the workspace builds without protoc or the upstream
//! proto tree.

pub mod command;
pub mod protocol;
pub mod serial;
pub mod stats;
pub mod vless;

/// Full gRPC method path for `HandlerService.AlterInbound`.
pub const ALTER_INBOUND_PATH: &str =
    "/xray.app.proxyman.command.HandlerService/AlterInbound";

/// Full gRPC method path for `HandlerService.GetInboundUsers`.
pub const GET_INBOUND_USERS_PATH: &str =
    "/xray.app.proxyman.command.HandlerService/GetInboundUsers";

/// Full gRPC method path for `HandlerService.GetInboundUsersCount`.
pub const GET_INBOUND_USERS_COUNT_PATH: &str =
    "/xray.app.proxyman.command.HandlerService/GetInboundUsersCount";

/// Full gRPC method path for `StatsService.GetSysStats`.
pub const GET_SYS_STATS_PATH: &str =
    "/xray.app.stats.command.StatsService/GetSysStats";

/// Type URL carried by [`serial::TypedMessage`] for a VLESS account.
pub const VLESS_ACCOUNT_TYPE: &str = "xray.proxy.vless.Account";

/// Type URL carried by [`serial::TypedMessage`] for an add-user operation.
pub const ADD_USER_OPERATION_TYPE: &str =
    "xray.app.proxyman.command.AddUserOperation";

/// Type URL carried by [`serial::TypedMessage`] for a remove-user operation.
pub const REMOVE_USER_OPERATION_TYPE: &str =
    "xray.app.proxyman.command.RemoveUserOperation";
