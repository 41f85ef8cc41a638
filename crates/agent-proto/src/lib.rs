use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `[1 byte kind][4 bytes BE length][N bytes payload]`.
pub const HEADER_LEN: usize = 5;

/// Defensive decode ceiling. The protocol itself allows up to `u32::MAX`;
/// this bounds how much a single malicious/corrupt frame can force us to
/// allocate while still comfortably exceeding the 16 MiB floor the wire
/// format requires implementations to accept.
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Auth = 0x01,
    AuthOk = 0x02,
    StartStream = 0x03,
    Frame = 0x04,
    MouseEvent = 0x05,
    KeyEvent = 0x06,
    StopStream = 0x07,
    Heartbeat = 0x08,
    HeartbeatAck = 0x09,
    Error = 0xFF,
}

impl Kind {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Kind::Auth),
            0x02 => Some(Kind::AuthOk),
            0x03 => Some(Kind::StartStream),
            0x04 => Some(Kind::Frame),
            0x05 => Some(Kind::MouseEvent),
            0x06 => Some(Kind::KeyEvent),
            0x07 => Some(Kind::StopStream),
            0x08 => Some(Kind::Heartbeat),
            0x09 => Some(Kind::HeartbeatAck),
            0xFF => Some(Kind::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("payload length overflows u32")]
    PayloadTooLarge,
    #[error("failed to serialize json payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame shorter than declared header+payload length")]
    Truncated,
    #[error("unknown message kind byte: 0x{0:02x}")]
    UnknownKind(u8),
    #[error("payload length {0} exceeds decode ceiling")]
    PayloadTooLarge(u32),
    #[error("malformed json payload: {0}")]
    MalformedJson(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub agent_id: String,
    pub token: String,
    pub hostname: String,
    pub os_info: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthOkPayload {
    pub agent_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StartStreamPayload {
    pub quality: u8,
    pub fps_max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePayload {
    pub seq: u32,
    pub ts_ms: u32,
    pub jpeg: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MouseAction {
    Move,
    Down,
    Up,
    Click,
    Dblclick,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MouseEventPayload {
    pub x: i32,
    pub y: i32,
    pub button: u8,
    pub action: MouseAction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyAction {
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    Ctrl,
    Alt,
    Shift,
    Meta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEventPayload {
    pub key: String,
    pub action: KeyAction,
    #[serde(default)]
    pub modifiers: Vec<Modifier>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub uptime: u64,
    pub cpu: f32,
    pub mem: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// A fully decoded protocol message. `StopStream` and `HeartbeatAck` carry
/// no payload by design (§6); everything else carries either JSON or, for
/// `Frame`, the binary seq/timestamp/JPEG layout from §4.1.
#[derive(Debug, Clone)]
pub enum Message {
    Auth(AuthPayload),
    AuthOk(AuthOkPayload),
    StartStream(StartStreamPayload),
    Frame(FramePayload),
    MouseEvent(MouseEventPayload),
    KeyEvent(KeyEventPayload),
    StopStream,
    Heartbeat(HeartbeatPayload),
    HeartbeatAck,
    Error(ErrorPayload),
}

impl Message {
    pub fn kind(&self) -> Kind {
        match self {
            Message::Auth(_) => Kind::Auth,
            Message::AuthOk(_) => Kind::AuthOk,
            Message::StartStream(_) => Kind::StartStream,
            Message::Frame(_) => Kind::Frame,
            Message::MouseEvent(_) => Kind::MouseEvent,
            Message::KeyEvent(_) => Kind::KeyEvent,
            Message::StopStream => Kind::StopStream,
            Message::Heartbeat(_) => Kind::Heartbeat,
            Message::HeartbeatAck => Kind::HeartbeatAck,
            Message::Error(_) => Kind::Error,
        }
    }
}

/// Encodes a complete message into a single binary WebSocket payload.
///
/// Every WebSocket binary message is already one length-delimited unit, so
/// this produces a whole in-memory buffer rather than writing to a stream.
pub fn encode(message: &Message) -> Result<Vec<u8>, EncodeError> {
    let payload = match message {
        Message::Auth(body) => serde_json::to_vec(body)?,
        Message::AuthOk(body) => serde_json::to_vec(body)?,
        Message::StartStream(body) => serde_json::to_vec(body)?,
        Message::Frame(body) => encode_frame_payload(body),
        Message::MouseEvent(body) => serde_json::to_vec(body)?,
        Message::KeyEvent(body) => serde_json::to_vec(body)?,
        Message::StopStream => Vec::new(),
        Message::Heartbeat(body) => serde_json::to_vec(body)?,
        Message::HeartbeatAck => Vec::new(),
        Message::Error(body) => serde_json::to_vec(body)?,
    };
    encode_raw(message.kind(), &payload)
}

/// Encodes a raw kind+payload pair without touching JSON. Used by callers
/// that already hold a serialized payload (e.g. the session-0 bridge, which
/// forwards mouse/key/notify frames it never deserializes).
pub fn encode_raw(kind: Kind, payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| EncodeError::PayloadTooLarge)?;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(kind as u8);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

pub fn encode_frame_payload(frame: &FramePayload) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + frame.jpeg.len());
    buf.extend_from_slice(&frame.seq.to_be_bytes());
    buf.extend_from_slice(&frame.ts_ms.to_be_bytes());
    buf.extend_from_slice(&frame.jpeg);
    buf
}

fn decode_frame_payload(payload: &[u8]) -> Result<FramePayload, DecodeError> {
    if payload.len() < 8 {
        return Err(DecodeError::Truncated);
    }
    let seq = u32::from_be_bytes(payload[0..4].try_into().unwrap());
    let ts_ms = u32::from_be_bytes(payload[4..8].try_into().unwrap());
    Ok(FramePayload { seq, ts_ms, jpeg: payload[8..].to_vec() })
}

/// Decodes one complete binary WebSocket message.
///
/// Returns [`DecodeError::UnknownKind`] for a kind byte outside the
/// enumerated set so callers can log and continue without tearing down the
/// connection, per the protocol's anomaly-tolerant policy.
pub fn decode(buf: &[u8]) -> Result<Message, DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::Truncated);
    }

    let kind_byte = buf[0];
    let len = u32::from_be_bytes(buf[1..5].try_into().unwrap());
    if len > MAX_PAYLOAD_LEN {
        return Err(DecodeError::PayloadTooLarge(len));
    }

    let len = len as usize;
    if buf.len() < HEADER_LEN + len {
        return Err(DecodeError::Truncated);
    }
    let payload = &buf[HEADER_LEN..HEADER_LEN + len];

    let kind = Kind::from_u8(kind_byte).ok_or(DecodeError::UnknownKind(kind_byte))?;

    Ok(match kind {
        Kind::Auth => Message::Auth(serde_json::from_slice(payload)?),
        Kind::AuthOk => Message::AuthOk(serde_json::from_slice(payload)?),
        Kind::StartStream => Message::StartStream(serde_json::from_slice(payload)?),
        Kind::Frame => Message::Frame(decode_frame_payload(payload)?),
        Kind::MouseEvent => Message::MouseEvent(serde_json::from_slice(payload)?),
        Kind::KeyEvent => Message::KeyEvent(serde_json::from_slice(payload)?),
        Kind::StopStream => Message::StopStream,
        Kind::Heartbeat => Message::Heartbeat(serde_json::from_slice(payload)?),
        Kind::HeartbeatAck => Message::HeartbeatAck,
        Kind::Error => Message::Error(serde_json::from_slice(payload)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) -> Message {
        let bytes = encode(&message).expect("encode should succeed");
        decode(&bytes).expect("decode should succeed")
    }

    #[test]
    fn auth_roundtrips() {
        let msg = Message::Auth(AuthPayload {
            agent_id: "a-1".into(),
            token: "t".into(),
            hostname: "H".into(),
            os_info: "OS".into(),
        });
        match roundtrip(msg) {
            Message::Auth(body) => {
                assert_eq!(body.agent_id, "a-1");
                assert_eq!(body.token, "t");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn stop_stream_and_heartbeat_ack_have_empty_payload() {
        let encoded = encode(&Message::StopStream).unwrap();
        assert_eq!(encoded.len(), HEADER_LEN);
        assert!(matches!(decode(&encoded).unwrap(), Message::StopStream));

        let encoded = encode(&Message::HeartbeatAck).unwrap();
        assert_eq!(encoded.len(), HEADER_LEN);
        assert!(matches!(decode(&encoded).unwrap(), Message::HeartbeatAck));
    }

    #[test]
    fn frame_roundtrips_with_zero_length_jpeg() {
        let msg = Message::Frame(FramePayload { seq: 7, ts_ms: 42, jpeg: Vec::new() });
        match roundtrip(msg) {
            Message::Frame(body) => {
                assert_eq!(body.seq, 7);
                assert_eq!(body.ts_ms, 42);
                assert!(body.jpeg.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn frame_roundtrips_with_jpeg_bytes() {
        let msg = Message::Frame(FramePayload { seq: 1, ts_ms: 0, jpeg: vec![0xFF, 0xD8, 0xFF] });
        match roundtrip(msg) {
            Message::Frame(body) => assert_eq!(body.jpeg, vec![0xFF, 0xD8, 0xFF]),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn mouse_and_key_events_roundtrip() {
        let mouse = Message::MouseEvent(MouseEventPayload {
            x: 100,
            y: 100,
            button: 0,
            action: MouseAction::Click,
        });
        match roundtrip(mouse) {
            Message::MouseEvent(body) => {
                assert_eq!((body.x, body.y, body.button), (100, 100, 0));
                assert_eq!(body.action, MouseAction::Click);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let key = Message::KeyEvent(KeyEventPayload {
            key: "Enter".into(),
            action: KeyAction::Down,
            modifiers: vec![Modifier::Ctrl, Modifier::Shift],
        });
        match roundtrip(key) {
            Message::KeyEvent(body) => {
                assert_eq!(body.key, "Enter");
                assert_eq!(body.modifiers, vec![Modifier::Ctrl, Modifier::Shift]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn key_event_modifiers_default_to_empty() {
        let payload = br#"{"key":"a","action":"down"}"#;
        let encoded = encode_raw(Kind::KeyEvent, payload).unwrap();
        match decode(&encoded).unwrap() {
            Message::KeyEvent(body) => assert!(body.modifiers.is_empty()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn decode_truncated_header() {
        let buf = [0x01, 0x00, 0x00];
        assert!(matches!(decode(&buf), Err(DecodeError::Truncated)));
    }

    #[test]
    fn decode_truncated_payload() {
        let mut buf = vec![0x07, 0x00, 0x00, 0x00, 0x05];
        buf.extend_from_slice(b"ab");
        assert!(matches!(decode(&buf), Err(DecodeError::Truncated)));
    }

    #[test]
    fn decode_unknown_kind_does_not_panic() {
        let buf = [0x42, 0x00, 0x00, 0x00, 0x00];
        assert!(matches!(decode(&buf), Err(DecodeError::UnknownKind(0x42))));
    }

    #[test]
    fn decode_malformed_json() {
        let encoded = encode_raw(Kind::Auth, b"not json").unwrap();
        assert!(matches!(decode(&encoded), Err(DecodeError::MalformedJson(_))));
    }

    #[test]
    fn heartbeat_roundtrips() {
        let msg = Message::Heartbeat(HeartbeatPayload { uptime: 120, cpu: 12.5, mem: 44.0 });
        match roundtrip(msg) {
            Message::Heartbeat(body) => {
                assert_eq!(body.uptime, 120);
                assert!((body.cpu - 12.5).abs() < f32::EPSILON);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn error_roundtrips() {
        let msg = Message::Error(ErrorPayload {
            code: "INVALID_TOKEN".into(),
            message: "bad token".into(),
        });
        match roundtrip(msg) {
            Message::Error(body) => assert_eq!(body.code, "INVALID_TOKEN"),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
