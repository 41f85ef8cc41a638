use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use agent_helpers::bridge_protocol::{CAPTURE_INPUT_TYPE_KEY, CAPTURE_INPUT_TYPE_MOUSE, CAPTURE_INPUT_TYPE_NOTIFY};
use agent_helpers::input::InputSimulator;
use agent_proto::{KeyEventPayload, MouseEventPayload};
use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use super::overlay;

#[cfg(windows)]
use agent_helpers::input::SendInputSink;
#[cfg(not(windows))]
use agent_helpers::input::LoggingInputSink;

#[derive(Debug, Deserialize)]
struct NotifyPayload {
    technician_name: String,
    connected: bool,
}

/// Reads the one-way input pipe on its own thread until it closes (§4.6),
/// applying mouse/key events locally and toggling the overlay on notify.
/// `connected` mirrors the latest notify state for the caller to poll.
pub fn run<P: Read>(mut pipe: P, connected: Arc<AtomicBool>) -> Result<()> {
    #[cfg(windows)]
    let sink = Box::new(SendInputSink::new());
    #[cfg(not(windows))]
    let sink = Box::new(LoggingInputSink::new());
    let mut simulator = InputSimulator::new(sink);

    loop {
        let mut header = [0u8; 5];
        match pipe.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("input pipe closed by service");
                return Ok(());
            }
            Err(err) => return Err(err).context("input pipe read failed"),
        }

        let frame_type = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut body = vec![0u8; len];
        pipe.read_exact(&mut body).context("input pipe read failed")?;

        match frame_type {
            CAPTURE_INPUT_TYPE_MOUSE => match serde_json::from_slice::<MouseEventPayload>(&body) {
                Ok(event) => {
                    if let Err(err) = simulator.apply_mouse(&event) {
                        warn!("failed to apply mouse event: {err:#}");
                    }
                }
                Err(err) => warn!("dropping malformed mouse frame: {err}"),
            },
            CAPTURE_INPUT_TYPE_KEY => match serde_json::from_slice::<KeyEventPayload>(&body) {
                Ok(event) => {
                    if let Err(err) = simulator.apply_key(&event) {
                        warn!("failed to apply key event: {err:#}");
                    }
                }
                Err(err) => warn!("dropping malformed key frame: {err}"),
            },
            CAPTURE_INPUT_TYPE_NOTIFY => match serde_json::from_slice::<NotifyPayload>(&body) {
                Ok(notify) => {
                    connected.store(notify.connected, Ordering::SeqCst);
                    if notify.connected {
                        overlay::show(&notify.technician_name);
                    } else {
                        overlay::hide();
                    }
                }
                Err(err) => warn!("dropping malformed notify frame: {err}"),
            },
            other => warn!("dropping input frame with unknown type {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    struct FakePipe(VecDeque<u8>);

    impl Read for FakePipe {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.0.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.0.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    fn frame(frame_type: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![frame_type];
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn notify_toggles_the_connected_flag() {
        let body = serde_json::to_vec(&serde_json::json!({
            "technician_name": "Alex",
            "connected": true,
        }))
        .unwrap();
        let mut bytes = frame(CAPTURE_INPUT_TYPE_NOTIFY, &body);
        bytes.extend(frame(
            CAPTURE_INPUT_TYPE_NOTIFY,
            &serde_json::to_vec(&serde_json::json!({ "technician_name": "Alex", "connected": false }))
                .unwrap(),
        ));

        let pipe = FakePipe(VecDeque::from(bytes));
        let connected = Arc::new(AtomicBool::new(false));
        run(pipe, connected.clone()).unwrap();

        assert!(!connected.load(Ordering::SeqCst));
    }

    #[test]
    fn malformed_frame_is_dropped_without_ending_the_loop() {
        let mut bytes = frame(CAPTURE_INPUT_TYPE_MOUSE, b"not json");
        bytes.extend(frame(
            CAPTURE_INPUT_TYPE_NOTIFY,
            &serde_json::to_vec(&serde_json::json!({ "technician_name": "Alex", "connected": true }))
                .unwrap(),
        ));

        let pipe = FakePipe(VecDeque::from(bytes));
        let connected = Arc::new(AtomicBool::new(false));
        run(pipe, connected.clone()).unwrap();

        assert!(connected.load(Ordering::SeqCst));
    }
}
