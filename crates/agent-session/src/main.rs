mod config;
mod core;

use anyhow::{Context, Result};
use config::Config;
use core::supervisor;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    agent_helpers::logging::init_logging("agent_session=info,tokio_tungstenite=warn", "AGENT_LOG", "agent-session");

    let config = Config::load().context("failed to load agent configuration")?;
    info!("agent starting: console_url={} agent_id={}", config.console_url, config.agent_id);

    let cancel = CancellationToken::new();
    let shutdown_task = tokio::spawn(agent_helpers::shutdown::listen_shutdown(cancel.clone()));

    supervisor::run(config, cancel).await;

    shutdown_task.abort();
    info!("agent stopped");
    Ok(())
}
