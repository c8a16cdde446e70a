//! Proxy RPC adapter.
//!
//! Everything the agent asks of the proxy's gRPC control service goes
//! through [`XrayApi`]: add/remove/list/count users on an inbound,
//! runtime statistics and a reachability probe. The trait exists so the
//! worker, the restore engine and the guard loop can be exercised
//! against a mock; [`XrayClient`] is the production implementation.
//!
//! Two proxy responses are semantic outcomes rather than faults and are
//! surfaced as sentinels instead of errors:
//!
//! - "already exists" on add (the status code when the proxy sets one,
//!   otherwise a narrow substring match) → [`AddOutcome::AlreadyExists`]
//! - "user ... not found" on remove → [`RemoveOutcome::NotFound`]

mod client;

use async_trait::async_trait;
use prost::Message;
use serde::Serialize;
use thiserror::Error;

pub use client::XrayClient;

use crate::error::{safe_detail, truncate_chars};

/// Everything needed to add one user to an inbound.
#[derive(Debug, Clone)]
pub struct UserSpec {
    pub uuid: String,
    pub email: String,
    pub inbound_tag: String,
    pub level: u32,
    pub flow: String,
}

/// Result of an add that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// The proxy already has this email on the inbound; idempotent success.
    AlreadyExists,
}

/// Result of a remove that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// The proxy has no such user; surfaced as a skipped success.
    NotFound,
}

/// One user as decoded from a listing. The UUID comes from the nested
/// account payload and is best-effort: a corrupted record yields `None`
/// without failing the listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundUser {
    pub email: String,
    pub uuid: Option<String>,
}

/// Container-friendly reachability report; never an error.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub api_addr: String,
    pub port_open: bool,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sys_stats: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Adapter-level failure. Detail strings are truncated and scrubbed at
/// construction so they are always safe to surface or store.
#[derive(Debug, Error)]
pub enum XrayError {
    #[error("invalid proxy address {0:?}, expected host:port")]
    Address(String),

    /// The control endpoint could not be reached or readied, after one
    /// teardown-and-rebuild retry.
    #[error("proxy control endpoint not ready: {0}")]
    Unavailable(String),

    #[error("{op} deadline of {timeout_sec}s exceeded")]
    Deadline { op: &'static str, timeout_sec: u64 },

    #[error("{op} failed (tag={tag}, user={email}): {code:?}: {detail}")]
    Rpc {
        op: &'static str,
        tag: String,
        /// Masked; never the full identifier.
        email: String,
        code: tonic::Code,
        detail: String,
    },
}

/// The proxy control API as the rest of the agent consumes it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait XrayApi: Send + Sync {
    /// Runtime statistics of the proxy process as a JSON map.
    async fn sys_stats(&self) -> Result<serde_json::Value, XrayError>;

    /// Add a user to an inbound.
    async fn add_user(&self, user: UserSpec) -> Result<AddOutcome, XrayError>;

    /// Remove a user, identified by email, from an inbound.
    async fn remove_user(&self, email: &str, tag: &str) -> Result<RemoveOutcome, XrayError>;

    /// List the users of an inbound.
    async fn list_users(&self, tag: &str) -> Result<Vec<InboundUser>, XrayError>;

    /// Count the users of an inbound, normalized to a strict integer.
    async fn count_users(&self, tag: &str) -> Result<i64, XrayError>;

    /// Probe the control endpoint: TCP port first, sys-stats if open.
    async fn runtime_status(&self) -> RuntimeStatus;
}

/// Status-code first, narrow substring fallback: the exact code differs
/// between proxy builds.
pub(crate) fn is_already_exists(status: &tonic::Status) -> bool {
    if status.code() == tonic::Code::AlreadyExists {
        return true;
    }
    let message = status.message().to_lowercase();
    (message.contains("already") && message.contains("exist")) || message.contains("duplicate")
}

pub(crate) fn is_user_not_found(status: &tonic::Status) -> bool {
    let message = status.message().to_lowercase();
    message.contains("not found") && message.contains("user")
}

/// Mask a user identifier for error contexts.
pub(crate) fn mask_email(email: &str) -> String {
    if email.chars().count() <= 2 {
        "***".to_string()
    } else {
        let head: String = email.chars().take(2).collect();
        format!("{head}***")
    }
}

pub(crate) fn rpc_error(
    op: &'static str,
    tag: &str,
    email: &str,
    status: &tonic::Status,
) -> XrayError {
    XrayError::Rpc {
        op,
        tag: tag.to_string(),
        email: mask_email(email),
        code: status.code(),
        detail: safe_detail(&truncate_chars(status.message(), crate::error::MAX_DETAIL_LEN)),
    }
}

/// Wrap a VLESS account in the self-describing typed envelope.
pub(crate) fn vless_account(uuid: &str, flow: &str) -> xray_proto::serial::TypedMessage {
    let account = xray_proto::vless::Account {
        id: uuid.to_string(),
        flow: flow.to_string(),
        encryption: "none".to_string(),
    };
    xray_proto::serial::TypedMessage {
        r#type: xray_proto::VLESS_ACCOUNT_TYPE.to_string(),
        value: account.encode_to_vec(),
    }
}

pub(crate) fn add_user_operation(user: &UserSpec) -> xray_proto::serial::TypedMessage {
    let operation = xray_proto::command::AddUserOperation {
        user: Some(xray_proto::protocol::User {
            level: user.level,
            email: user.email.clone(),
            account: Some(vless_account(&user.uuid, &user.flow)),
        }),
    };
    xray_proto::serial::TypedMessage {
        r#type: xray_proto::ADD_USER_OPERATION_TYPE.to_string(),
        value: operation.encode_to_vec(),
    }
}

pub(crate) fn remove_user_operation(email: &str) -> xray_proto::serial::TypedMessage {
    let operation = xray_proto::command::RemoveUserOperation {
        email: email.to_string(),
    };
    xray_proto::serial::TypedMessage {
        r#type: xray_proto::REMOVE_USER_OPERATION_TYPE.to_string(),
        value: operation.encode_to_vec(),
    }
}

/// Decode one listed user. UUID extraction is per-user best-effort.
pub(crate) fn decode_inbound_user(user: &xray_proto::protocol::User) -> InboundUser {
    let uuid = user
        .account
        .as_ref()
        .filter(|account| account.r#type == xray_proto::VLESS_ACCOUNT_TYPE)
        .and_then(|account| xray_proto::vless::Account::decode(account.value.as_slice()).ok())
        .map(|account| account.id)
        .filter(|id| !id.is_empty());
    InboundUser {
        email: user.email.clone(),
        uuid,
    }
}

pub(crate) fn parse_hostport(addr: &str) -> Result<(String, u16), XrayError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| XrayError::Address(addr.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| XrayError::Address(addr.to_string()))?;
    if host.is_empty() {
        return Err(XrayError::Address(addr.to_string()));
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::{Code, Status};

    #[test]
    fn test_already_exists_by_code() {
        let status = Status::new(Code::AlreadyExists, "whatever");
        assert!(is_already_exists(&status));
    }

    #[test]
    fn test_already_exists_by_substring() {
        for message in [
            "User 123 already exists.",
            "operation failed: AlreadyExists",
            "duplicate user",
        ] {
            let status = Status::new(Code::Unknown, message);
            assert!(is_already_exists(&status), "{message}");
        }
    }

    #[test]
    fn test_already_exists_stays_narrow() {
        let status = Status::new(Code::Unknown, "inbound not found");
        assert!(!is_already_exists(&status));
        let status = Status::new(Code::Internal, "connection reset");
        assert!(!is_already_exists(&status));
    }

    #[test]
    fn test_user_not_found_requires_both_words() {
        assert!(is_user_not_found(&Status::new(
            Code::Unknown,
            "User 123456 not found."
        )));
        assert!(!is_user_not_found(&Status::new(
            Code::Unknown,
            "handler not found"
        )));
    }

    #[test]
    fn test_mask_email() {
        assert_eq!(mask_email("123456789"), "12***");
        assert_eq!(mask_email("a"), "***");
    }

    #[test]
    fn test_account_envelope_round_trip() {
        let spec = UserSpec {
            uuid: "3f2b8c1a-9d4e-4f6a-8b2c-1d3e5f7a9b0c".to_string(),
            email: "123456".to_string(),
            inbound_tag: "vless-in".to_string(),
            level: 0,
            flow: "xtls-rprx-vision".to_string(),
        };
        let operation = add_user_operation(&spec);
        assert_eq!(operation.r#type, xray_proto::ADD_USER_OPERATION_TYPE);

        let decoded =
            xray_proto::command::AddUserOperation::decode(operation.value.as_slice()).unwrap();
        let user = decoded.user.unwrap();
        assert_eq!(user.email, "123456");

        let inbound_user = decode_inbound_user(&user);
        assert_eq!(inbound_user.email, "123456");
        assert_eq!(inbound_user.uuid.as_deref(), Some(spec.uuid.as_str()));
    }

    #[test]
    fn test_decode_tolerates_garbage_account() {
        let user = xray_proto::protocol::User {
            level: 0,
            email: "u".to_string(),
            account: Some(xray_proto::serial::TypedMessage {
                r#type: xray_proto::VLESS_ACCOUNT_TYPE.to_string(),
                value: vec![0xff, 0xff, 0xff],
            }),
        };
        let decoded = decode_inbound_user(&user);
        assert_eq!(decoded.email, "u");
        assert_eq!(decoded.uuid, None);
    }

    #[test]
    fn test_parse_hostport() {
        assert_eq!(
            parse_hostport("127.0.0.1:10085").unwrap(),
            ("127.0.0.1".to_string(), 10085)
        );
        assert!(parse_hostport("nocolon").is_err());
        assert!(parse_hostport(":10085").is_err());
        assert!(parse_hostport("host:notaport").is_err());
    }
}
