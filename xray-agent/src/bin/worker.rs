//! Queue worker of the agent: pops jobs and executes them against the
//! proxy control API.

use std::sync::Arc;

use anyhow::Context;

use xray_agent::config::Settings;
use xray_agent::jobs::Worker;
use xray_agent::state::AppState;
use xray_agent::{observability, shutdown};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init()?;
    let settings = Settings::load().context("load settings")?;
    let state = AppState::new(settings).context("build worker state")?;

    let worker = Worker::new(Arc::clone(state.deps()));
    worker.run(shutdown::token()).await;
    Ok(())
}
