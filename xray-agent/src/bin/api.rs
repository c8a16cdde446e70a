//! HTTP control surface of the agent.

use std::net::SocketAddr;

use anyhow::Context;
use tracing::info;

use xray_agent::config::Settings;
use xray_agent::state::AppState;
use xray_agent::{handlers, observability, shutdown};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init()?;
    let settings = Settings::load().context("load settings")?;
    let port = settings.api.port;

    let state = AppState::new(settings).context("build application state")?;
    let app = handlers::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "api listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown::signal())
    .await
    .context("serve api")?;

    Ok(())
}
