//! Anti-sharing guard of the agent: polices the access log and enforces
//! the device policy.

use std::sync::Arc;

use anyhow::Context;

use xray_agent::config::Settings;
use xray_agent::guard::{Guard, GuardStore};
use xray_agent::jobs::JobStore;
use xray_agent::logwatch::LogWatcher;
use xray_agent::notify::Notifier;
use xray_agent::xray::{XrayApi, XrayClient};
use xray_agent::{observability, shutdown, store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init()?;
    let settings = Arc::new(Settings::load().context("load settings")?);

    let pool = store::create_pool(&settings.redis.url).context("create store pool")?;
    let xray: Arc<dyn XrayApi> = Arc::new(XrayClient::new(&settings.xray));
    let notifier = Arc::new(Notifier::new(settings.notify.clone()).context("build notifier")?);
    let logwatch = Arc::new(LogWatcher::new(&settings));

    let guard = Guard::new(
        Arc::clone(&settings),
        GuardStore::new(pool.clone()),
        xray,
        logwatch,
        notifier,
        JobStore::new(pool),
    );
    guard.run(shutdown::token()).await;
    Ok(())
}
