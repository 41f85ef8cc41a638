use agent_proto::{KeyEventPayload, Message, MouseEventPayload};
use tracing::warn;

use super::supervisor::ConnectionState;

/// Outcome of handling one inbound message (§4.3). Input events are
/// classified here but applied by the caller, since the caller alone knows
/// whether this process is driving input directly or forwarding it across
/// the session-0 bridge.
pub enum DispatchAction {
    None,
    StartCapture { quality: u8, fps_max: u32 },
    StopCapture,
    Mouse(MouseEventPayload),
    Key(KeyEventPayload),
}

pub fn handle(message: Message, state: ConnectionState) -> DispatchAction {
    match message {
        Message::AuthOk(_) => {
            if state == ConnectionState::Ready {
                warn!("protocol anomaly: unexpected AUTH_OK while already Ready");
            }
            DispatchAction::None
        }
        Message::StartStream(payload) => {
            DispatchAction::StartCapture { quality: payload.quality, fps_max: payload.fps_max }
        }
        Message::StopStream => DispatchAction::StopCapture,
        Message::MouseEvent(payload) => DispatchAction::Mouse(payload),
        Message::KeyEvent(payload) => DispatchAction::Key(payload),
        Message::HeartbeatAck => DispatchAction::None,
        Message::Error(payload) => {
            warn!("server reported error: code={} message={}", payload.code, payload.message);
            DispatchAction::None
        }
        Message::Auth(_) | Message::Frame(_) | Message::Heartbeat(_) => {
            warn!("protocol anomaly: received a console-bound message kind {:?}", message.kind());
            DispatchAction::None
        }
    }
}

#[cfg(test)]
mod tests {
    use agent_proto::{KeyAction, KeyEventPayload, MouseAction, MouseEventPayload};

    use super::*;

    #[test]
    fn start_stream_carries_quality_and_fps() {
        let action = handle(
            Message::StartStream(agent_proto::StartStreamPayload { quality: 70, fps_max: 15 }),
            ConnectionState::Ready,
        );
        assert!(matches!(action, DispatchAction::StartCapture { quality: 70, fps_max: 15 }));
    }

    #[test]
    fn mouse_and_key_events_classify_without_requiring_active_stream() {
        let mouse = handle(
            Message::MouseEvent(MouseEventPayload { x: 1, y: 2, button: 0, action: MouseAction::Move }),
            ConnectionState::Ready,
        );
        assert!(matches!(mouse, DispatchAction::Mouse(_)));

        let key = handle(
            Message::KeyEvent(KeyEventPayload {
                key: "a".into(),
                action: KeyAction::Down,
                modifiers: Vec::new(),
            }),
            ConnectionState::Ready,
        );
        assert!(matches!(key, DispatchAction::Key(_)));
    }
}
