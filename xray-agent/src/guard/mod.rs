//! Anti-sharing guard loop.
//!
//! Every tick: take a fresh access-log snapshot, reduce it to the set of
//! *active* violators and walk each `(inbound, email)` through the
//! WARN → GRACE → BAN → THANKS machine. Ticks are independent and
//! idempotent: state lives in the store under TTLs, every notification
//! is guarded by a once-lock, and a missed tick delays a WARN or BAN by
//! at most one interval.

pub mod policy;
mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::AgentError;
use crate::jobs::JobStore;
use crate::logwatch::{ClientStatus, LogWatcher};
use crate::notify::{GuardEvent, GuardEventKind, Notifier};
use crate::store::keys;
use crate::xray::XrayApi;

pub use store::GuardStore;

use policy::{ViolatorAction, THANKS_COOLDOWN_SEC};

fn now_sec() -> i64 {
    #[allow(clippy::cast_possible_wrap)]
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    secs
}

pub struct Guard {
    settings: Arc<Settings>,
    store: GuardStore,
    xray: Arc<dyn XrayApi>,
    logwatch: Arc<LogWatcher>,
    notifier: Arc<Notifier>,
    jobs: JobStore,
}

impl Guard {
    #[must_use]
    pub fn new(
        settings: Arc<Settings>,
        store: GuardStore,
        xray: Arc<dyn XrayApi>,
        logwatch: Arc<LogWatcher>,
        notifier: Arc<Notifier>,
        jobs: JobStore,
    ) -> Self {
        Self {
            settings,
            store,
            xray,
            logwatch,
            notifier,
            jobs,
        }
    }

    /// Tick forever; a failed tick logs and waits for the next interval.
    pub async fn run(&self, shutdown: CancellationToken) {
        let interval = Duration::from_secs(self.settings.guard.interval_sec);
        info!(
            interval_sec = self.settings.guard.interval_sec,
            devices_limit = self.settings.guard.devices_limit,
            "guard started"
        );

        loop {
            if let Err(e) = self.tick().await {
                error!(error = %e, "guard tick failed");
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
        }

        info!("guard stopped");
    }

    /// One evaluation pass over the current snapshot.
    pub async fn tick(&self) -> Result<(), AgentError> {
        let now = now_sec();
        let snapshot = self.logwatch.snapshot().await?;
        let guard_cfg = &self.settings.guard;

        let violators: HashMap<&str, &ClientStatus> = snapshot
            .clients
            .iter()
            .filter(|client| {
                policy::is_active_violation(
                    client.devices_estimate,
                    client.last_seen_ago_sec,
                    guard_cfg,
                )
            })
            .map(|client| (client.email.as_str(), client))
            .collect();

        debug!(
            clients = snapshot.clients.len(),
            violators = violators.len(),
            "guard tick"
        );

        for client in violators.values() {
            self.police_violator(now, client).await;
        }

        // Users who carried a warning but are clean again get it cleared
        // and a THANKS, once per cooldown.
        for client in &snapshot.clients {
            if violators.contains_key(client.email.as_str()) {
                continue;
            }
            self.settle_recovered(client).await;
        }

        Ok(())
    }

    async fn police_violator(&self, now: i64, client: &ClientStatus) {
        let tag = &self.settings.xray.inbound_tag;
        let guard_cfg = &self.settings.guard;
        let email = client.email.as_str();
        let keys = keys::guard(tag, email);

        let warned_at = match self.store.get(&keys.warned_at).await {
            // An unparsable mark counts as freshly warned rather than
            // triggering an instant ban.
            Ok(Some(raw)) => Some(raw.parse::<i64>().unwrap_or(now)),
            Ok(None) => None,
            Err(e) => {
                warn!(email, error = %e, "guard state read failed, skipping user this tick");
                return;
            }
        };

        match policy::violator_action(now, warned_at, guard_cfg) {
            ViolatorAction::Warn => {
                if !self
                    .store
                    .allow_once(&keys.once_warn, guard_cfg.warn_cooldown_sec)
                    .await
                {
                    return;
                }
                let ttl = policy::warned_at_ttl(guard_cfg);
                if let Err(e) = self
                    .store
                    .set_ex(&keys.warned_at, &now.to_string(), ttl)
                    .await
                {
                    warn!(email, error = %e, "warned_at write failed");
                    return;
                }
                info!(
                    email,
                    tag = %tag,
                    devices = client.devices_estimate,
                    limit = guard_cfg.devices_limit,
                    "guard WARN"
                );
                self.send_event(GuardEventKind::Warn, client).await;
            }
            ViolatorAction::SilentGrace => {}
            ViolatorAction::ClearStale => {
                if let Err(e) = self.store.delete(&keys.warned_at).await {
                    warn!(email, error = %e, "stale warned_at sweep failed");
                }
            }
            ViolatorAction::Ban => {
                if !self
                    .store
                    .allow_once(&keys.once_ban, guard_cfg.disable_cooldown_sec)
                    .await
                {
                    return;
                }
                warn!(
                    email,
                    tag = %tag,
                    devices = client.devices_estimate,
                    limit = guard_cfg.devices_limit,
                    "guard BAN, removing user"
                );

                if let Err(e) = self.xray.remove_user(email, tag).await {
                    error!(email, tag = %tag, error = %e, "guard remove_user failed");
                    return;
                }

                if let Err(e) = self.jobs.clear_issue_dedupe(email, tag).await {
                    warn!(email, error = %e, "issue dedupe invalidation failed after ban");
                }
                if let Err(e) = self.store.delete(&keys.warned_at).await {
                    warn!(email, error = %e, "warned_at clear failed after ban");
                }

                self.send_event(GuardEventKind::Ban, client).await;
            }
        }
    }

    async fn settle_recovered(&self, client: &ClientStatus) {
        let tag = &self.settings.xray.inbound_tag;
        let email = client.email.as_str();
        let keys = keys::guard(tag, email);

        match self.store.get(&keys.warned_at).await {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => {
                warn!(email, error = %e, "guard state read failed for recovered user");
                return;
            }
        }

        if let Err(e) = self.store.delete(&keys.warned_at).await {
            warn!(email, error = %e, "warned_at clear failed for recovered user");
            return;
        }
        info!(email, tag = %tag, "guard violation resolved");

        if self
            .store
            .allow_once(&keys.once_thanks, THANKS_COOLDOWN_SEC)
            .await
        {
            self.send_event(GuardEventKind::Thanks, client).await;
        }
    }

    /// Best-effort, bounded by the notifier's own timeouts; never fails
    /// the tick.
    async fn send_event(&self, kind: GuardEventKind, client: &ClientStatus) {
        let event = GuardEvent {
            event: kind,
            email: client.email.clone(),
            inbound_tag: self.settings.xray.inbound_tag.clone(),
            devices: client.devices_estimate,
            limit: self.settings.guard.devices_limit,
            grace_sec: self.settings.guard.ban_grace_sec,
        };
        let outcome = self.notifier.notify_guard(&event).await;
        if let Some(reason) = outcome.reason {
            debug!(email = %event.email, reason = %reason, "guard notify not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xray::MockXrayApi;
    use chrono::Local;
    use std::io::Write;
    use std::path::PathBuf;

    fn violator_log() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let ts = Local::now() - chrono::Duration::seconds(5);
        for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
            writeln!(
                file,
                "{} from {ip}:1989 accepted tcp:a.com:443 [vless-in -> direct] email: 424242",
                ts.format("%Y/%m/%d %H:%M:%S%.6f")
            )
            .unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn guard_over(log: PathBuf, xray: MockXrayApi) -> Guard {
        let settings = Arc::new(Settings::default());
        // Closed port: every store operation fails fast.
        let pool = crate::store::create_pool("redis://127.0.0.1:1/0").unwrap();
        Guard::new(
            settings.clone(),
            GuardStore::new(pool.clone()),
            Arc::new(xray),
            Arc::new(LogWatcher::with_config(
                log,
                "vless-in".to_string(),
                &settings,
            )),
            Arc::new(Notifier::new(settings.notify.clone()).unwrap()),
            JobStore::new(pool),
        )
    }

    // A flapping store must suppress enforcement, never crash a tick or
    // remove a user whose state cannot be read.
    #[tokio::test]
    async fn test_tick_with_dead_store_never_removes() {
        let file = violator_log();
        let mut xray = MockXrayApi::new();
        xray.expect_remove_user().times(0);

        let guard = guard_over(file.path().to_path_buf(), xray);
        guard.tick().await.unwrap();
    }

    #[tokio::test]
    async fn test_tick_with_missing_log_is_an_error() {
        let xray = MockXrayApi::new();
        let guard = guard_over(PathBuf::from("/nonexistent/access.log"), xray);
        let err = guard.tick().await.unwrap_err();
        assert_eq!(err.code(), "XRAY_UNAVAILABLE");
    }
}
