mod args;
mod core;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use agent_helpers::logging;
use anyhow::{Context, Result};
use args::HelperArgs;
use tracing::{info, warn};

fn main() -> Result<()> {
    logging::init_logging("agent_helper=info", "AGENT_HELPER_LOG", "agent-helper");

    let args = HelperArgs::parse(std::env::args().skip(1))?;
    info!("helper starting: capture_pipe={}, input_pipe={}", args.capture_pipe, args.input_pipe);

    let mut capture_pipe = open_pipe_client(&args.capture_pipe).context("failed to connect to capture pipe")?;
    let input_pipe = open_pipe_client(&args.input_pipe).context("failed to connect to input pipe")?;

    let connected = Arc::new(AtomicBool::new(false));
    let input_connected = connected.clone();
    let input_thread =
        std::thread::spawn(move || core::input_server::run(input_pipe, input_connected));

    // The capture request/response loop runs on the main thread; the
    // helper exits once the service closes the capture pipe (§4.6).
    let result = core::capture_server::run(&mut capture_pipe);
    if let Err(err) = &result {
        warn!("capture server stopped: {err:#}");
    }

    core::overlay::hide();

    match input_thread.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("input server stopped: {err:#}"),
        Err(_) => warn!("input server thread panicked"),
    }

    info!("helper exiting");
    result
}

#[cfg(windows)]
fn open_pipe_client(name: &str) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(format!(r"\\.\pipe\{name}"))
        .context("failed to open named pipe")
}

#[cfg(not(windows))]
fn open_pipe_client(_name: &str) -> Result<std::fs::File> {
    anyhow::bail!("the session-0 helper is only supported on Windows")
}
