//! Access-log snapshots.
//!
//! Reads the tail of the proxy access log, extracts the events of one
//! inbound and aggregates them into per-user device estimates. A short
//! TTL cache in front of the build protects the proxy's disk from rapid
//! re-parses: reads go through a lock-free fast path, builds are
//! serialized behind a mutex with the classic double-checked re-read.

pub mod aggregate;
pub mod parser;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Settings;
use crate::error::AgentError;

pub use aggregate::{aggregate, Aggregate, AggregationWindows, ClientStatus, HostHits};
pub use parser::{parse_access_lines, LogEvent};

/// The parsed-and-aggregated view of recent access-log events.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub ok: bool,
    pub source: String,
    pub ts_epoch: f64,
    pub ts_iso_utc: String,
    pub window_sec: u64,
    pub online_window_sec: u64,
    pub devices_limit: usize,
    pub inbound_tag: String,
    pub parse_ms: u64,
    /// Events inside the aggregation window.
    pub window_events: usize,
    pub clients_total_seen: usize,
    pub clients_online: usize,
    pub suspicious_clients: usize,
    pub clients: Vec<ClientStatus>,
}

struct CachedSnapshot {
    built_at: Instant,
    snapshot: Arc<Snapshot>,
}

/// Snapshot builder with the TTL cache.
pub struct LogWatcher {
    access_log: PathBuf,
    inbound_tag: String,
    tail_max_lines: usize,
    window_sec: u64,
    cache_ttl_sec: f64,
    windows: AggregationWindows,
    cache: RwLock<Option<CachedSnapshot>>,
    build_lock: Mutex<()>,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl LogWatcher {
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        Self::with_config(
            PathBuf::from(&settings.xray.access_log),
            settings.xray.inbound_tag.clone(),
            settings,
        )
    }

    /// Like [`LogWatcher::new`] but with an explicit log path and tag;
    /// the seam tests use to point at synthetic logs.
    #[must_use]
    pub fn with_config(access_log: PathBuf, inbound_tag: String, settings: &Settings) -> Self {
        Self {
            access_log,
            inbound_tag,
            tail_max_lines: settings.logwatch.tail_max_lines,
            window_sec: settings.logwatch.window_sec,
            cache_ttl_sec: settings.logwatch.cache_ttl_sec,
            windows: AggregationWindows {
                online_window_sec: settings.logwatch.online_window_sec,
                ip_active_ttl_sec: settings.logwatch.ip_active_ttl_sec,
                devices_limit: settings.guard.devices_limit,
            },
            cache: RwLock::new(None),
            build_lock: Mutex::new(()),
        }
    }

    fn source(&self) -> String {
        format!("logfile:{}", self.access_log.display())
    }

    fn unavailable(&self, error: &str) -> AgentError {
        AgentError::XrayUnavailable {
            details: json!({ "source": self.source(), "error": error }),
        }
    }

    fn cached(&self) -> Option<Arc<Snapshot>> {
        let guard = self.cache.read();
        guard.as_ref().and_then(|cached| {
            (cached.built_at.elapsed().as_secs_f64() < self.cache_ttl_sec)
                .then(|| cached.snapshot.clone())
        })
    }

    /// Current snapshot, at most `cache_ttl_sec` old.
    pub async fn snapshot(&self) -> Result<Arc<Snapshot>, AgentError> {
        if let Some(snapshot) = self.cached() {
            return Ok(snapshot);
        }

        let _build = self.build_lock.lock().await;
        // Another task may have built while we waited for the lock.
        if let Some(snapshot) = self.cached() {
            return Ok(snapshot);
        }

        let snapshot = Arc::new(self.build().await?);
        *self.cache.write() = Some(CachedSnapshot {
            built_at: Instant::now(),
            snapshot: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// Read the last `max_lines` lines of the log. Also the liveness
    /// probe for `/health/logfile`.
    pub async fn tail(&self, max_lines: usize) -> Result<Vec<String>, AgentError> {
        let content = tokio::fs::read_to_string(&self.access_log)
            .await
            .map_err(|e| self.unavailable(&e.to_string()))?;

        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
        if lines.len() > max_lines {
            lines.drain(..lines.len() - max_lines);
        }
        Ok(lines)
    }

    async fn build(&self) -> Result<Snapshot, AgentError> {
        let started = Instant::now();
        let lines = self.tail(self.tail_max_lines).await?;

        let inbound_tag = self.inbound_tag.clone();
        let window_sec = self.window_sec;
        let windows = self.windows;
        let now = now_epoch();

        // Parsing 30k lines is CPU-bound; keep it off the event loop.
        let (window_events, agg) = tokio::task::spawn_blocking(move || {
            let mut events = parse_access_lines(&lines, &inbound_tag);
            let cutoff = now - window_sec as f64;
            events.retain(|event| event.t >= cutoff);
            let agg = aggregate(&events, now, &windows);
            (events.len(), agg)
        })
        .await
        .map_err(|e| AgentError::Internal(e.into()))?;

        let parse_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(
            source = %self.source(),
            window_events,
            clients = agg.clients_total_seen,
            parse_ms,
            "access log snapshot built"
        );

        Ok(Snapshot {
            ok: true,
            source: self.source(),
            ts_epoch: now,
            ts_iso_utc: chrono::DateTime::from_timestamp(now as i64, 0)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_default(),
            window_sec: self.window_sec,
            online_window_sec: self.windows.online_window_sec,
            devices_limit: self.windows.devices_limit,
            inbound_tag: self.inbound_tag.clone(),
            parse_ms,
            window_events,
            clients_total_seen: agg.clients_total_seen,
            clients_online: agg.clients_online,
            suspicious_clients: agg.suspicious_clients,
            clients: agg.clients,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use std::io::Write;

    fn log_line(age_sec: i64, ip: &str, email: &str) -> String {
        let ts = Local::now() - chrono::Duration::seconds(age_sec);
        format!(
            "{} from {ip}:1989 accepted tcp:www.youtube.com:443 [vless-in -> direct] email: {email}",
            ts.format("%Y/%m/%d %H:%M:%S%.6f")
        )
    }

    fn watcher(path: PathBuf, cache_ttl_sec: f64) -> LogWatcher {
        let mut settings = Settings::default();
        settings.logwatch.cache_ttl_sec = cache_ttl_sec;
        LogWatcher::with_config(path, "vless-in".to_string(), &settings)
    }

    #[tokio::test]
    async fn test_snapshot_aggregates_live_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", log_line(10, "1.1.1.1", "1001")).unwrap();
        writeln!(file, "{}", log_line(5, "2.2.2.2", "1001")).unwrap();
        writeln!(file, "{}", log_line(20, "3.3.3.3", "2002")).unwrap();
        file.flush().unwrap();

        let watcher = watcher(file.path().to_path_buf(), 0.0);
        let snapshot = watcher.snapshot().await.unwrap();

        assert!(snapshot.ok);
        assert_eq!(snapshot.window_events, 3);
        assert_eq!(snapshot.clients_total_seen, 2);
        let c1001 = snapshot
            .clients
            .iter()
            .find(|c| c.email == "1001")
            .unwrap();
        assert_eq!(c1001.devices_estimate, 2);
    }

    #[tokio::test]
    async fn test_events_outside_window_dropped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", log_line(10_000, "1.1.1.1", "1001")).unwrap();
        writeln!(file, "{}", log_line(5, "2.2.2.2", "2002")).unwrap();
        file.flush().unwrap();

        let watcher = watcher(file.path().to_path_buf(), 0.0);
        let snapshot = watcher.snapshot().await.unwrap();
        assert_eq!(snapshot.window_events, 1);
        assert_eq!(snapshot.clients_total_seen, 1);
        assert_eq!(snapshot.clients[0].email, "2002");
    }

    #[tokio::test]
    async fn test_cache_serves_stale_within_ttl() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", log_line(5, "1.1.1.1", "1001")).unwrap();
        file.flush().unwrap();

        let watcher = watcher(file.path().to_path_buf(), 60.0);
        let first = watcher.snapshot().await.unwrap();
        assert_eq!(first.window_events, 1);

        writeln!(file, "{}", log_line(1, "2.2.2.2", "1001")).unwrap();
        file.flush().unwrap();

        let second = watcher.snapshot().await.unwrap();
        assert_eq!(second.window_events, 1, "second read must come from cache");
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let watcher = watcher(PathBuf::from("/nonexistent/access.log"), 0.0);
        let err = watcher.snapshot().await.unwrap_err();
        assert_eq!(err.code(), "XRAY_UNAVAILABLE");
    }
}
