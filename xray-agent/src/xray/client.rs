//! Production gRPC client for the proxy control service.
//!
//! One long-lived channel is shared by all callers. Before each call the
//! client waits briefly for readiness; if the channel cannot be readied
//! it is torn down, rebuilt and the call retried once. A second failure
//! surfaces as a transient [`XrayError::Unavailable`]. Keepalive pings
//! are spaced far apart and disabled while idle so the proxy's ping
//! rate-limiting is never tripped.

use std::time::Duration;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;
use tracing::{debug, warn};

use crate::config::XraySettings;

use super::{
    add_user_operation, decode_inbound_user, is_already_exists, is_user_not_found, mask_email,
    parse_hostport, remove_user_operation, rpc_error, AddOutcome, InboundUser, RemoveOutcome,
    RuntimeStatus, UserSpec, XrayApi, XrayError,
};

/// Bound on connecting and per-call readiness.
const READY_WAIT: Duration = Duration::from_secs(2);

/// TCP probe bound for `runtime_status`.
const PORT_PROBE_WAIT: Duration = Duration::from_millis(700);

/// HTTP/2 keepalive ping spacing; the proxy rate-limits idle pings.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

enum CallError {
    Transport(XrayError),
    Status(tonic::Status),
}

/// Shared client for the proxy control endpoint.
pub struct XrayClient {
    addr: String,
    rpc_timeout_sec: u64,
    channel: Mutex<Option<Channel>>,
}

impl XrayClient {
    #[must_use]
    pub fn new(settings: &XraySettings) -> Self {
        Self {
            addr: settings.api_addr.clone(),
            rpc_timeout_sec: settings.timeout_sec,
            channel: Mutex::new(None),
        }
    }

    /// Get the shared channel, building it on first use. The mutex is
    /// held only during (re)initialization; established channels are
    /// cloned out and calls run concurrently.
    async fn channel(&self) -> Result<Channel, XrayError> {
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.as_ref() {
            return Ok(channel.clone());
        }

        let endpoint = Endpoint::from_shared(format!("http://{}", self.addr))
            .map_err(|_| XrayError::Address(self.addr.clone()))?
            .connect_timeout(READY_WAIT)
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_timeout(KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(false);

        let channel = tokio::time::timeout(READY_WAIT, endpoint.connect())
            .await
            .map_err(|_| XrayError::Unavailable(format!("connect to {} timed out", self.addr)))?
            .map_err(|e| XrayError::Unavailable(e.to_string()))?;

        debug!(addr = %self.addr, "proxy control channel established");
        *guard = Some(channel.clone());
        Ok(channel)
    }

    async fn invalidate(&self) {
        *self.channel.lock().await = None;
    }

    /// One unary call with readiness discipline: ensure ready within
    /// [`READY_WAIT`], rebuild the channel and retry once if not.
    async fn unary<Req, Resp>(
        &self,
        op: &'static str,
        path: &'static str,
        request: Req,
    ) -> Result<Resp, CallError>
    where
        Req: prost::Message + Clone + 'static,
        Resp: prost::Message + Default + 'static,
    {
        let mut last_err: Option<XrayError> = None;

        for attempt in 0..2u8 {
            let channel = match self.channel().await {
                Ok(channel) => channel,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };

            let mut grpc = Grpc::new(channel);
            match tokio::time::timeout(READY_WAIT, grpc.ready()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(op, attempt, error = %e, "proxy channel not ready, rebuilding");
                    self.invalidate().await;
                    last_err = Some(XrayError::Unavailable(e.to_string()));
                    continue;
                }
                Err(_) => {
                    warn!(op, attempt, "proxy readiness wait timed out, rebuilding");
                    self.invalidate().await;
                    last_err = Some(XrayError::Unavailable("readiness wait timed out".into()));
                    continue;
                }
            }

            let codec: ProstCodec<Req, Resp> = ProstCodec::default();
            let call = grpc.unary(
                Request::new(request.clone()),
                PathAndQuery::from_static(path),
                codec,
            );
            return match tokio::time::timeout(Duration::from_secs(self.rpc_timeout_sec), call)
                .await
            {
                Ok(Ok(response)) => Ok(response.into_inner()),
                Ok(Err(status)) => Err(CallError::Status(status)),
                Err(_) => Err(CallError::Transport(XrayError::Deadline {
                    op,
                    timeout_sec: self.rpc_timeout_sec,
                })),
            };
        }

        Err(CallError::Transport(last_err.unwrap_or_else(|| {
            XrayError::Unavailable("connect retries exhausted".into())
        })))
    }

    fn classify(op: &'static str, tag: &str, email: &str, err: CallError) -> XrayError {
        match err {
            CallError::Transport(e) => e,
            CallError::Status(status) => rpc_error(op, tag, email, &status),
        }
    }
}

#[async_trait]
impl XrayApi for XrayClient {
    async fn sys_stats(&self) -> Result<serde_json::Value, XrayError> {
        let stats: xray_proto::stats::SysStatsResponse = self
            .unary(
                "sys_stats",
                xray_proto::GET_SYS_STATS_PATH,
                xray_proto::stats::SysStatsRequest {},
            )
            .await
            .map_err(|e| Self::classify("sys_stats", "", "", e))?;

        Ok(json!({
            "num_goroutine": stats.num_goroutine,
            "num_gc": stats.num_gc,
            "alloc": stats.alloc,
            "total_alloc": stats.total_alloc,
            "sys": stats.sys,
            "mallocs": stats.mallocs,
            "frees": stats.frees,
            "live_objects": stats.live_objects,
            "pause_total_ns": stats.pause_total_ns,
            "uptime": stats.uptime,
        }))
    }

    async fn add_user(&self, user: UserSpec) -> Result<AddOutcome, XrayError> {
        let request = xray_proto::command::AlterInboundRequest {
            tag: user.inbound_tag.clone(),
            operation: Some(add_user_operation(&user)),
        };

        match self
            .unary::<_, xray_proto::command::AlterInboundResponse>(
                "add_user",
                xray_proto::ALTER_INBOUND_PATH,
                request,
            )
            .await
        {
            Ok(_) => Ok(AddOutcome::Added),
            Err(CallError::Status(status)) if is_already_exists(&status) => {
                debug!(tag = %user.inbound_tag, email = %mask_email(&user.email), "add_user: already exists");
                Ok(AddOutcome::AlreadyExists)
            }
            Err(e) => Err(Self::classify(
                "add_user",
                &user.inbound_tag,
                &user.email,
                e,
            )),
        }
    }

    async fn remove_user(&self, email: &str, tag: &str) -> Result<RemoveOutcome, XrayError> {
        let request = xray_proto::command::AlterInboundRequest {
            tag: tag.to_string(),
            operation: Some(remove_user_operation(email)),
        };

        match self
            .unary::<_, xray_proto::command::AlterInboundResponse>(
                "remove_user",
                xray_proto::ALTER_INBOUND_PATH,
                request,
            )
            .await
        {
            Ok(_) => Ok(RemoveOutcome::Removed),
            Err(CallError::Status(status)) if is_user_not_found(&status) => {
                debug!(tag, email = %mask_email(email), "remove_user: not found");
                Ok(RemoveOutcome::NotFound)
            }
            Err(e) => Err(Self::classify("remove_user", tag, email, e)),
        }
    }

    async fn list_users(&self, tag: &str) -> Result<Vec<InboundUser>, XrayError> {
        let request = xray_proto::command::GetInboundUserRequest {
            tag: tag.to_string(),
            email: String::new(),
        };

        let response: xray_proto::command::GetInboundUserResponse = self
            .unary("list_users", xray_proto::GET_INBOUND_USERS_PATH, request)
            .await
            .map_err(|e| Self::classify("list_users", tag, "", e))?;

        Ok(response.users.iter().map(decode_inbound_user).collect())
    }

    async fn count_users(&self, tag: &str) -> Result<i64, XrayError> {
        let request = xray_proto::command::GetInboundUserRequest {
            tag: tag.to_string(),
            email: String::new(),
        };

        let response: xray_proto::command::GetInboundUsersCountResponse = self
            .unary(
                "count_users",
                xray_proto::GET_INBOUND_USERS_COUNT_PATH,
                request,
            )
            .await
            .map_err(|e| Self::classify("count_users", tag, "", e))?;

        Ok(response.count)
    }

    async fn runtime_status(&self) -> RuntimeStatus {
        let mut status = RuntimeStatus {
            api_addr: self.addr.clone(),
            port_open: false,
            ok: false,
            sys_stats: None,
            error: None,
        };

        let (host, port) = match parse_hostport(&self.addr) {
            Ok(parsed) => parsed,
            Err(e) => {
                status.error = Some(e.to_string());
                return status;
            }
        };

        status.port_open = matches!(
            tokio::time::timeout(PORT_PROBE_WAIT, TcpStream::connect((host.as_str(), port))).await,
            Ok(Ok(_))
        );
        if !status.port_open {
            status.error = Some("xray api port is not open".to_string());
            return status;
        }

        match self.sys_stats().await {
            Ok(stats) => {
                status.sys_stats = Some(stats);
                status.ok = true;
            }
            Err(e) => {
                status.error = Some(e.to_string());
            }
        }

        status
    }
}
