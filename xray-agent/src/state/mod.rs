//! Process-level application state.
//!
//! The global singletons of a typical agent deployment (proxy channel,
//! store pool, snapshot cache) are explicit objects constructed once and
//! handed around; tests build the same state from parts with a mocked
//! proxy API.

use std::sync::Arc;

use deadpool_redis::Pool;

use crate::config::Settings;
use crate::jobs::{HandlerDeps, JobStore};
use crate::limits::{CapacityLimiter, RateLimiter};
use crate::logwatch::LogWatcher;
use crate::notify::Notifier;
use crate::store;
use crate::xray::{XrayApi, XrayClient};

/// Shared state of the API process. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    settings: Arc<Settings>,
    deps: Arc<HandlerDeps>,
    rate_limiter: RateLimiter,
    logwatch: Arc<LogWatcher>,
}

impl AppState {
    /// Build production state from settings: store pool, proxy client,
    /// notifier, snapshot cache.
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        let settings = Arc::new(settings);
        let pool = store::create_pool(&settings.redis.url)?;
        let xray: Arc<dyn XrayApi> = Arc::new(XrayClient::new(&settings.xray));
        let notifier = Arc::new(Notifier::new(settings.notify.clone())?);
        let logwatch = Arc::new(LogWatcher::new(&settings));
        Ok(Self::from_parts(settings, pool, xray, notifier, logwatch))
    }

    /// Assemble state from pre-built parts; the seam tests use to swap
    /// in a mocked proxy API or a synthetic access log.
    #[must_use]
    pub fn from_parts(
        settings: Arc<Settings>,
        pool: Pool,
        xray: Arc<dyn XrayApi>,
        notifier: Arc<Notifier>,
        logwatch: Arc<LogWatcher>,
    ) -> Self {
        let deps = Arc::new(HandlerDeps {
            settings: settings.clone(),
            xray,
            jobs: JobStore::new(pool.clone()),
            capacity: CapacityLimiter::new(pool.clone(), settings.capacity.clone()),
            notifier,
        });
        Self {
            settings,
            deps,
            rate_limiter: RateLimiter::new(pool),
            logwatch,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    #[must_use]
    pub fn deps(&self) -> &Arc<HandlerDeps> {
        &self.deps
    }

    #[must_use]
    pub fn xray(&self) -> &Arc<dyn XrayApi> {
        &self.deps.xray
    }

    #[must_use]
    pub fn jobs(&self) -> &JobStore {
        &self.deps.jobs
    }

    #[must_use]
    pub const fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    #[must_use]
    pub fn logwatch(&self) -> &Arc<LogWatcher> {
        &self.logwatch
    }
}
