//! Agent configuration.
//!
//! Configuration is loaded from three sources with clear precedence:
//!
//! 1. Environment variables (highest priority; the flat names the
//!    deployment already uses, e.g. `API_TOKEN`, `XRAY_GUARD_BAN_GRACE_SEC`)
//! 2. `./xray-agent.toml`
//! 3. Hardcoded defaults (fallback)
//!
//! The flat environment names are aliased onto nested sections, so
//! `XRAY_GUARD_BAN_GRACE_SEC=600` and
//!
//! ```toml
//! [guard]
//! ban_grace_sec = 600
//! ```
//!
//! configure the same field.

use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// HTTP surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Shared bearer secret for every endpoint.
    pub token: String,

    /// Listen port of the API process.
    pub port: u16,

    /// Include error traces in job error documents.
    pub debug_errors: bool,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            token: "CHANGE_ME".to_string(),
            port: 18000,
            debug_errors: false,
        }
    }
}

/// State store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Redis DSN.
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
        }
    }
}

/// Proxy control endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XraySettings {
    /// gRPC control endpoint, `host:port`.
    pub api_addr: String,

    /// Default inbound tag user management is scoped to.
    pub inbound_tag: String,

    /// Path to the proxy access log.
    pub access_log: String,

    /// Per-RPC deadline in seconds.
    pub timeout_sec: u64,
}

impl Default for XraySettings {
    fn default() -> Self {
        Self {
            api_addr: "127.0.0.1:10085".to_string(),
            inbound_tag: "vless-in".to_string(),
            access_log: "/var/log/xray/access.log".to_string(),
            timeout_sec: 10,
        }
    }
}

impl XraySettings {
    #[must_use]
    pub const fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

/// Access-log parsing and aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogwatchSettings {
    /// How many trailing log lines to read per pass.
    pub tail_max_lines: usize,

    /// Aggregation window: events older than this are dropped.
    pub window_sec: u64,

    /// "Online" predicate threshold.
    pub online_window_sec: u64,

    /// How long an IP counts as an active device after its last event.
    pub ip_active_ttl_sec: u64,

    /// Snapshot cache TTL.
    pub cache_ttl_sec: f64,
}

impl Default for LogwatchSettings {
    fn default() -> Self {
        Self {
            tail_max_lines: 30_000,
            window_sec: 600,
            online_window_sec: 240,
            ip_active_ttl_sec: 120,
            cache_ttl_sec: 2.0,
        }
    }
}

/// Guard loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSettings {
    /// Per-user device ceiling; estimates above it are violations.
    pub devices_limit: usize,

    /// Tick period.
    pub interval_sec: u64,

    /// Grace window between WARN and BAN.
    pub ban_grace_sec: u64,

    /// WARN anti-spam cooldown.
    pub warn_cooldown_sec: u64,

    /// BAN anti-repeat cooldown.
    pub disable_cooldown_sec: u64,

    /// Only users seen within this window are warned or banned.
    pub active_seen_sec: u64,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            devices_limit: 2,
            interval_sec: 20,
            ban_grace_sec: 900,
            warn_cooldown_sec: 300,
            disable_cooldown_sec: 1800,
            active_seen_sec: 600,
        }
    }
}

/// Per-inbound capacity ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacitySettings {
    pub limit: i64,

    /// Safety TTL on the counter so crashed workers cannot leak slots.
    pub ttl_sec: u64,
}

impl Default for CapacitySettings {
    fn default() -> Self {
        Self {
            limit: 50,
            ttl_sec: 120,
        }
    }
}

/// VLESS/REALITY link-building parameters. Opaque to the core; consumed
/// only by the link assembler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    pub public_host: Option<String>,
    pub public_port: Option<u16>,
    pub sni: Option<String>,
    pub fingerprint: Option<String>,
    pub public_key: Option<String>,
    pub short_id: Option<String>,
    pub default_flow: Option<String>,
}

impl LinkSettings {
    #[must_use]
    pub fn default_flow(&self) -> String {
        self.default_flow.clone().unwrap_or_default()
    }
}

/// Outbound notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    /// Target URL; unset disables notifications.
    pub url: Option<String>,

    /// Sent as `X-API-Key` when set.
    pub api_key: Option<String>,

    /// Per-attempt timeout.
    pub timeout_sec: u64,

    /// Number of delivery attempts.
    pub retries: u32,

    /// Bound on the whole delivery including backoff.
    pub total_timeout_sec: u64,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_sec: 10,
            retries: 3,
            total_timeout_sec: 30,
        }
    }
}

/// Root settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api: ApiSettings,
    pub redis: RedisSettings,
    pub xray: XraySettings,
    pub logwatch: LogwatchSettings,
    pub guard: GuardSettings,
    pub capacity: CapacitySettings,
    pub link: LinkSettings,
    pub notify: NotifySettings,
}

/// Flat environment name → nested field path (joined with `__` so the
/// figment `split` turns it into a section).
fn env_alias(name: &str) -> Option<&'static str> {
    Some(match name {
        "API_TOKEN" => "api__token",
        "PORT" => "api__port",
        "DEBUG_ERRORS" => "api__debug_errors",
        "REDIS_URL" => "redis__url",
        "XRAY_API_ADDR" => "xray__api_addr",
        "XRAY_INBOUND_TAG" => "xray__inbound_tag",
        "XRAY_ACCESS_LOG" => "xray__access_log",
        "GRPC_TIMEOUT_SEC" => "xray__timeout_sec",
        "TAIL_MAX_LINES" => "logwatch__tail_max_lines",
        "WINDOW_SEC" => "logwatch__window_sec",
        "ONLINE_WINDOW_SEC" => "logwatch__online_window_sec",
        "IP_ACTIVE_TTL_SEC" => "logwatch__ip_active_ttl_sec",
        "CACHE_TTL_SEC" => "logwatch__cache_ttl_sec",
        "DEVICES_LIMIT" => "guard__devices_limit",
        "XRAY_GUARD_INTERVAL_SEC" => "guard__interval_sec",
        "XRAY_GUARD_BAN_GRACE_SEC" => "guard__ban_grace_sec",
        "XRAY_GUARD_WARN_COOLDOWN_SEC" => "guard__warn_cooldown_sec",
        "XRAY_GUARD_DISABLE_COOLDOWN_SEC" => "guard__disable_cooldown_sec",
        "XRAY_GUARD_ACTIVE_SEEN_SEC" => "guard__active_seen_sec",
        "CAPACITY_LIMIT" => "capacity__limit",
        "CAPACITY_TTL_SEC" => "capacity__ttl_sec",
        "PUBLIC_HOST" => "link__public_host",
        "PUBLIC_PORT" => "link__public_port",
        "REALITY_SNI" => "link__sni",
        "REALITY_FP" => "link__fingerprint",
        "REALITY_PBK" => "link__public_key",
        "REALITY_SID" => "link__short_id",
        "DEFAULT_FLOW" => "link__default_flow",
        "NOTIFY_URL" => "notify__url",
        "NOTIFY_API_KEY" => "notify__api_key",
        "NOTIFY_TIMEOUT_SEC" => "notify__timeout_sec",
        "NOTIFY_RETRIES" => "notify__retries",
        "NOTIFY_TOTAL_TIMEOUT_SEC" => "notify__total_timeout_sec",
        _ => return None,
    })
}

impl Settings {
    /// Load settings from defaults, `./xray-agent.toml` and environment
    /// variables, in ascending precedence.
    ///
    /// # Errors
    ///
    /// Returns an error when a source fails to parse or a value fails
    /// type conversion.
    pub fn load() -> anyhow::Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file("xray-agent.toml"))
            .merge(
                Env::raw()
                    .map(|key| {
                        let upper = key.as_str().to_ascii_uppercase();
                        match env_alias(&upper) {
                            Some(mapped) => mapped.into(),
                            None => key.as_str().to_owned().into(),
                        }
                    })
                    .split("__"),
            );

        let settings: Self = figment.extract()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployment_contract() {
        let s = Settings::default();
        assert_eq!(s.api.port, 18000);
        assert_eq!(s.xray.inbound_tag, "vless-in");
        assert_eq!(s.xray.timeout_sec, 10);
        assert_eq!(s.logwatch.tail_max_lines, 30_000);
        assert_eq!(s.logwatch.window_sec, 600);
        assert_eq!(s.logwatch.online_window_sec, 240);
        assert_eq!(s.logwatch.ip_active_ttl_sec, 120);
        assert_eq!(s.guard.devices_limit, 2);
        assert_eq!(s.guard.interval_sec, 20);
        assert_eq!(s.guard.ban_grace_sec, 900);
        assert_eq!(s.guard.warn_cooldown_sec, 300);
        assert_eq!(s.guard.disable_cooldown_sec, 1800);
        assert_eq!(s.guard.active_seen_sec, 600);
        assert_eq!(s.capacity.limit, 50);
        assert_eq!(s.capacity.ttl_sec, 120);
        assert_eq!(s.notify.retries, 3);
    }

    #[test]
    fn test_env_aliases_cover_guard_family() {
        assert_eq!(
            env_alias("XRAY_GUARD_BAN_GRACE_SEC"),
            Some("guard__ban_grace_sec")
        );
        assert_eq!(env_alias("DEVICES_LIMIT"), Some("guard__devices_limit"));
        assert_eq!(env_alias("REALITY_PBK"), Some("link__public_key"));
        assert_eq!(env_alias("NOT_A_KNOWN_NAME"), None);
    }
}
