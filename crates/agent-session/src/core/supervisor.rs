use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use agent_helpers::input::InputSimulator;
use agent_helpers::metrics::HostMetrics;
use agent_proto::{AuthPayload, HeartbeatPayload, KeyEventPayload, Message, MouseEventPayload};
use anyhow::{Context, Result, bail};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;

use super::bridge::{CAPTURE_INPUT_TYPE_KEY, CAPTURE_INPUT_TYPE_MOUSE, SessionZeroBridge};
use super::capture::{self, CaptureProvider, CaptureSnapshot, DirectCaptureProvider, StreamParams};
use super::dispatch::{self, DispatchAction};
use super::transport::{self, Incoming, TransportEvent};

#[cfg(windows)]
use super::capture::GdiScreenGrabber;
#[cfg(not(windows))]
use super::capture::StubScreenGrabber;
#[cfg(windows)]
use agent_helpers::input::SendInputSink;
#[cfg(not(windows))]
use agent_helpers::input::LoggingInputSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closing,
}

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CAPTURE_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const MAX_BACKOFF_SECS: u64 = 60;

/// `min(2^attempt, 60)` seconds, per §4.2 / §8's backoff invariant.
pub fn backoff_duration(attempt: u32) -> Duration {
    let secs = if attempt >= 6 { MAX_BACKOFF_SECS } else { 1u64 << attempt };
    Duration::from_secs(secs.min(MAX_BACKOFF_SECS))
}

/// Whether this process is running with an attached interactive desktop.
/// On non-Windows targets there is no session-0 concept to detect, so the
/// direct backend is always selected.
#[cfg(windows)]
fn has_interactive_desktop() -> bool {
    use windows_sys::Win32::System::Threading::{GetCurrentProcessId, ProcessIdToSessionId};

    let pid = unsafe { GetCurrentProcessId() };
    let mut session_id: u32 = 0;
    if unsafe { ProcessIdToSessionId(pid, &mut session_id) } == 0 {
        return true;
    }
    session_id != 0
}

#[cfg(not(windows))]
fn has_interactive_desktop() -> bool {
    true
}

fn build_direct_input() -> InputSimulator {
    #[cfg(windows)]
    let sink = Box::new(SendInputSink::new());
    #[cfg(not(windows))]
    let sink = Box::new(LoggingInputSink::new());
    InputSimulator::new(sink)
}

fn build_direct_capture_provider() -> Box<dyn CaptureProvider> {
    #[cfg(windows)]
    let grabber = Box::new(GdiScreenGrabber::new());
    #[cfg(not(windows))]
    let grabber = Box::new(StubScreenGrabber::new(1920, 1080));
    Box::new(DirectCaptureProvider::new(grabber))
}

/// Routes mouse/key events either to a local simulator or across the
/// session-0 bridge, depending on which capture backend was selected at
/// startup.
enum InputRoute {
    Direct(InputSimulator),
    Bridge(Arc<StdMutex<SessionZeroBridge>>),
}

impl InputRoute {
    fn apply_mouse(&mut self, payload: &MouseEventPayload) {
        match self {
            InputRoute::Direct(sim) => {
                if let Err(err) = sim.apply_mouse(payload) {
                    warn!("failed to apply mouse event: {err:#}");
                }
            }
            InputRoute::Bridge(bridge) => {
                forward_to_bridge(bridge, CAPTURE_INPUT_TYPE_MOUSE, payload);
            }
        }
    }

    fn apply_key(&mut self, payload: &KeyEventPayload) {
        match self {
            InputRoute::Direct(sim) => {
                if let Err(err) = sim.apply_key(payload) {
                    warn!("failed to apply key event: {err:#}");
                }
            }
            InputRoute::Bridge(bridge) => {
                forward_to_bridge(bridge, CAPTURE_INPUT_TYPE_KEY, payload);
            }
        }
    }
}

fn forward_to_bridge<T: serde::Serialize>(bridge: &Arc<StdMutex<SessionZeroBridge>>, frame_type: u8, payload: &T) {
    let json = match serde_json::to_vec(payload) {
        Ok(json) => json,
        Err(err) => {
            warn!("failed to serialize input event for bridge: {err}");
            return;
        }
    };
    if let Err(err) = bridge.lock().expect("bridge mutex poisoned").send_input_frame(frame_type, &json) {
        warn!("failed to forward input event across session-0 bridge: {err:#}");
    }
}

struct BridgeCaptureProvider(Arc<StdMutex<SessionZeroBridge>>);

impl CaptureProvider for BridgeCaptureProvider {
    fn capture(&mut self, quality: u8) -> Result<CaptureSnapshot> {
        self.0.lock().expect("bridge mutex poisoned").capture(quality)
    }

    fn reset(&mut self) {
        self.0.lock().expect("bridge mutex poisoned").reset();
    }
}

/// Entry point: drives the connect/auth/ready/backoff state machine until
/// `cancel` fires (§4.2). Never returns early for a recoverable failure.
pub async fn run(config: Config, cancel: CancellationToken) {
    let metrics = Arc::new(Mutex::new(HostMetrics::new()));
    let identity = {
        let guard = metrics.lock().await;
        AuthPayload {
            agent_id: config.agent_id.clone(),
            token: config.agent_token.clone(),
            hostname: guard.hostname().to_string(),
            os_info: guard.os_info().to_string(),
        }
    };

    let interactive = has_interactive_desktop();
    if interactive {
        info!("running with an interactive desktop; using the direct capture backend");
    } else {
        info!("no interactive desktop detected; using the session-0 bridge");
    }

    let bridge: Option<Arc<StdMutex<SessionZeroBridge>>> =
        if interactive { None } else { Some(Arc::new(StdMutex::new(SessionZeroBridge::new()))) };

    let mut attempt: u32 = 0;
    let mut was_active: Option<StreamParams> = None;

    while !cancel.is_cancelled() {
        if let Err(err) = connect_and_serve(
            &config,
            &identity,
            interactive,
            &bridge,
            metrics.clone(),
            &mut was_active,
            cancel.clone(),
            &mut attempt,
        )
        .await
        {
            warn!("session ended: {err:#}");
        }

        if cancel.is_cancelled() {
            break;
        }

        attempt = attempt.saturating_add(1);
        let delay = backoff_duration(attempt);
        info!("reconnecting in {:.0}s (attempt {attempt})", delay.as_secs_f64());

        tokio::select! {
            _ = sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }
    }

    info!("session supervisor shut down");
}

#[allow(clippy::too_many_arguments)]
async fn connect_and_serve(
    config: &Config,
    identity: &AuthPayload,
    interactive: bool,
    bridge: &Option<Arc<StdMutex<SessionZeroBridge>>>,
    metrics: Arc<Mutex<HostMetrics>>,
    was_active: &mut Option<StreamParams>,
    cancel: CancellationToken,
    attempt: &mut u32,
) -> Result<()> {
    let mut transport = transport::connect(&config.console_url).await.context("connect failed")?;

    let auth_bytes = agent_proto::encode(&Message::Auth(identity.clone())).context("failed to encode AUTH")?;
    transport.send_direct(auth_bytes).await.context("failed to send AUTH")?;

    let auth_result = tokio::time::timeout(AUTH_TIMEOUT, receive_decoded(&mut transport))
        .await
        .context("authentication timed out")??;

    match auth_result {
        Message::AuthOk(_) => {
            info!("authenticated as {}", identity.agent_id);
            // Reset the backoff floor on the Ready transition itself, not on
            // a clean supervisor return, so a link that keeps reaching Ready
            // and then dropping never escalates past the first rung.
            *attempt = 0;
        }
        Message::Error(payload) => bail!("authentication rejected: {} {}", payload.code, payload.message),
        other => bail!("unexpected message during authentication: {:?}", other.kind()),
    }

    let connection_cancel = cancel.child_token();
    let handle = transport.handle();

    let heartbeat_cancel = connection_cancel.child_token();
    let heartbeat_handle = handle.clone();
    let heartbeat_metrics = metrics.clone();
    let heartbeat_task = tokio::spawn(run_heartbeat(heartbeat_handle, heartbeat_metrics, heartbeat_cancel));

    let mut input_route = match bridge {
        Some(bridge) => InputRoute::Bridge(bridge.clone()),
        None => InputRoute::Direct(build_direct_input()),
    };

    let mut capture_task: Option<(tokio::task::JoinHandle<()>, CancellationToken)> = None;
    if let Some(params) = *was_active {
        capture_task = Some(start_capture(interactive, bridge, params, handle.clone(), &connection_cancel));
    }

    let result = receive_loop(&mut transport, &connection_cancel, &mut input_route, &mut capture_task, was_active, interactive, bridge, &handle).await;

    connection_cancel.cancel();
    heartbeat_task.abort();
    if let Some((task, _)) = capture_task.take() {
        let _ = tokio::time::timeout(CAPTURE_SHUTDOWN_GRACE, task).await;
    }
    transport.close().await;

    result
}

#[allow(clippy::too_many_arguments)]
async fn receive_loop(
    transport: &mut transport::Transport,
    connection_cancel: &CancellationToken,
    input_route: &mut InputRoute,
    capture_task: &mut Option<(tokio::task::JoinHandle<()>, CancellationToken)>,
    was_active: &mut Option<StreamParams>,
    interactive: bool,
    bridge: &Option<Arc<StdMutex<SessionZeroBridge>>>,
    handle: &transport::OutgoingHandle,
) -> Result<()> {
    loop {
        let event = tokio::select! {
            event = transport.next_event() => event?,
            _ = connection_cancel.cancelled() => return Ok(()),
        };

        let bytes = match event {
            TransportEvent::Sent => continue,
            TransportEvent::Incoming(Incoming::Closed) => bail!("connection closed by peer"),
            TransportEvent::Incoming(Incoming::Binary(bytes)) => bytes,
        };

        let message = match agent_proto::decode(&bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!("dropping malformed frame: {err}");
                continue;
            }
        };

        match dispatch::handle(message, ConnectionState::Ready) {
            DispatchAction::None => {}
            DispatchAction::Mouse(payload) => input_route.apply_mouse(&payload),
            DispatchAction::Key(payload) => input_route.apply_key(&payload),
            DispatchAction::StartCapture { quality, fps_max } => {
                if let Some((task, task_cancel)) = capture_task.take() {
                    task_cancel.cancel();
                    let _ = tokio::time::timeout(CAPTURE_SHUTDOWN_GRACE, task).await;
                }
                let params = StreamParams { quality, fps_max };
                *was_active = Some(params);
                *capture_task = Some(start_capture(interactive, bridge, params, handle.clone(), connection_cancel));
            }
            DispatchAction::StopCapture => {
                *was_active = None;
                if let Some((task, task_cancel)) = capture_task.take() {
                    task_cancel.cancel();
                    let _ = tokio::time::timeout(CAPTURE_SHUTDOWN_GRACE, task).await;
                }
            }
        }
    }
}

fn start_capture(
    interactive: bool,
    bridge: &Option<Arc<StdMutex<SessionZeroBridge>>>,
    params: StreamParams,
    handle: transport::OutgoingHandle,
    connection_cancel: &CancellationToken,
) -> (tokio::task::JoinHandle<()>, CancellationToken) {
    let task_cancel = connection_cancel.child_token();
    let provider: Box<dyn CaptureProvider> = if interactive {
        build_direct_capture_provider()
    } else {
        let bridge = bridge.clone().expect("bridge must exist in non-interactive mode");
        Box::new(BridgeCaptureProvider(bridge))
    };
    let task = tokio::spawn(capture::run(provider, params, handle, task_cancel.clone()));
    (task, task_cancel)
}

async fn receive_decoded(transport: &mut transport::Transport) -> Result<Message> {
    loop {
        match transport.next_event().await? {
            TransportEvent::Sent => continue,
            TransportEvent::Incoming(Incoming::Closed) => bail!("connection closed"),
            TransportEvent::Incoming(Incoming::Binary(bytes)) => return agent_proto::decode(&bytes).map_err(Into::into),
        }
    }
}

async fn run_heartbeat(handle: transport::OutgoingHandle, metrics: Arc<Mutex<HostMetrics>>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = sleep(HEARTBEAT_INTERVAL) => {}
            _ = cancel.cancelled() => return,
        }

        let sample = metrics.lock().await.sample();
        let message = Message::Heartbeat(HeartbeatPayload {
            uptime: sample.uptime_secs,
            cpu: sample.cpu_percent,
            mem: sample.mem_percent,
        });

        let bytes = match agent_proto::encode(&message) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("failed to encode heartbeat: {err}");
                continue;
            }
        };

        if handle.send(bytes).await.is_err() {
            warn!("heartbeat send failed, connection is closing");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_follows_min_2_pow_n_60() {
        // `attempt` counts consecutive failures 1-based: the n-th failure
        // sleeps min(2^n, 60)s, so the first failure sleeps 2s.
        assert_eq!(backoff_duration(1), Duration::from_secs(2));
        assert_eq!(backoff_duration(5), Duration::from_secs(32));
        assert_eq!(backoff_duration(6), Duration::from_secs(60));
        assert_eq!(backoff_duration(10), Duration::from_secs(60));
    }
}
