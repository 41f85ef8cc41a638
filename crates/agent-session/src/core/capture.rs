use std::time::Instant;

use agent_helpers::screen::{self, RawFrame, ScreenGrabber};
use agent_proto::{FramePayload, Message};
use anyhow::{Context, Result};
use tokio::time::{Duration, Instant as TokioInstant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::transport::OutgoingHandle;

#[cfg(windows)]
pub use agent_helpers::screen::GdiScreenGrabber;
#[cfg(not(windows))]
pub use agent_helpers::screen::StubScreenGrabber;

#[derive(Debug, Clone, Copy)]
pub struct StreamParams {
    pub quality: u8,
    pub fps_max: u32,
}

pub enum CaptureSnapshot {
    Jpeg(Vec<u8>),
    Unchanged,
}

/// `quality -> JPEG | Unchanged`, satisfied identically by the direct
/// in-process backend and the session-0 bridge backend (§4.4).
pub trait CaptureProvider: Send {
    fn capture(&mut self, quality: u8) -> Result<CaptureSnapshot>;

    /// Clears any change-detection state. Called on every START_STREAM so
    /// the previous-frame fingerprint never survives across streams (§9).
    fn reset(&mut self);
}

/// Grabs in-process, hashes the raw pixel buffer for change detection, and
/// JPEG-encodes only on a miss.
pub struct DirectCaptureProvider {
    grabber: Box<dyn ScreenGrabber>,
    previous_fingerprint: Option<u128>,
}

impl DirectCaptureProvider {
    pub fn new(grabber: Box<dyn ScreenGrabber>) -> Self {
        Self { grabber, previous_fingerprint: None }
    }
}

impl CaptureProvider for DirectCaptureProvider {
    fn capture(&mut self, quality: u8) -> Result<CaptureSnapshot> {
        let frame: RawFrame = self.grabber.grab_primary().context("screen grab failed")?;
        let fingerprint = screen::fingerprint(&frame);

        if self.previous_fingerprint == Some(fingerprint) {
            return Ok(CaptureSnapshot::Unchanged);
        }
        self.previous_fingerprint = Some(fingerprint);

        let jpeg = screen::encode_jpeg(&frame, quality)?;
        Ok(CaptureSnapshot::Jpeg(jpeg))
    }

    fn reset(&mut self) {
        self.previous_fingerprint = None;
    }
}

/// Runs the fps-capped capture loop until cancelled or the provider/send
/// fails. Owns `frame_seq` and `capture_origin` for the lifetime of one
/// stream, per §3's Stream state record.
pub async fn run(
    mut provider: Box<dyn CaptureProvider>,
    params: StreamParams,
    outgoing: OutgoingHandle,
    cancel: CancellationToken,
) {
    provider.reset();
    let mut frame_seq: u32 = 0;
    let capture_origin = Instant::now();
    let frame_interval = Duration::from_millis(1000 / u64::from(params.fps_max.max(1)));

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let iter_start = TokioInstant::now();

        match provider.capture(params.quality) {
            Ok(CaptureSnapshot::Unchanged) => {}
            Ok(CaptureSnapshot::Jpeg(jpeg)) => {
                frame_seq += 1;
                let ts_ms = u32::try_from(capture_origin.elapsed().as_millis()).unwrap_or(u32::MAX);
                let message = Message::Frame(FramePayload { seq: frame_seq, ts_ms, jpeg });

                let bytes = match agent_proto::encode(&message) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!("failed to encode frame seq={frame_seq}: {err}");
                        continue;
                    }
                };

                if let Err(err) = outgoing.send(bytes).await {
                    debug!("capture loop stopping, transport closed: {err}");
                    break;
                }
            }
            Err(err) => {
                warn!("capture provider error, ending stream: {err:#}");
                break;
            }
        }

        let elapsed = iter_start.elapsed();
        if elapsed < frame_interval {
            tokio::select! {
                _ = tokio::time::sleep(frame_interval - elapsed) => {}
                _ = cancel.cancelled() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc;

    use super::*;

    #[cfg(not(windows))]
    fn stub_provider() -> DirectCaptureProvider {
        DirectCaptureProvider::new(Box::new(StubScreenGrabber::new(4, 4)))
    }

    #[cfg(not(windows))]
    #[test]
    fn identical_frames_are_suppressed_after_the_first() {
        let mut provider = stub_provider();
        let first = provider.capture(70).unwrap();
        assert!(matches!(first, CaptureSnapshot::Jpeg(_)));

        let second = provider.capture(70).unwrap();
        assert!(matches!(second, CaptureSnapshot::Unchanged));
    }

    #[cfg(not(windows))]
    #[test]
    fn reset_forgets_the_previous_fingerprint() {
        let mut provider = stub_provider();
        provider.capture(70).unwrap();
        provider.reset();
        let after_reset = provider.capture(70).unwrap();
        assert!(matches!(after_reset, CaptureSnapshot::Jpeg(_)));
    }

    struct CountingProvider {
        remaining_frames: u32,
        fingerprint_reset_calls: Arc<Mutex<u32>>,
    }

    impl CaptureProvider for CountingProvider {
        fn capture(&mut self, _quality: u8) -> Result<CaptureSnapshot> {
            if self.remaining_frames == 0 {
                return Ok(CaptureSnapshot::Unchanged);
            }
            self.remaining_frames -= 1;
            Ok(CaptureSnapshot::Jpeg(vec![0xFF, 0xD8, 0xFF]))
        }

        fn reset(&mut self) {
            *self.fingerprint_reset_calls.lock().unwrap() += 1;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emitted_frames_carry_strictly_increasing_sequence_numbers() {
        let (tx, mut rx) = mpsc::channel(16);
        let outgoing = OutgoingHandle::for_test(tx);
        let cancel = CancellationToken::new();
        let reset_calls = Arc::new(Mutex::new(0));

        let provider =
            Box::new(CountingProvider { remaining_frames: 3, fingerprint_reset_calls: reset_calls.clone() });
        let params = StreamParams { quality: 70, fps_max: 1000 };

        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(run(provider, params, outgoing, cancel_clone));

        let mut seqs = Vec::new();
        for _ in 0..3 {
            let bytes = rx.recv().await.expect("expected a frame");
            match agent_proto::decode(&bytes).unwrap() {
                agent_proto::Message::Frame(frame) => seqs.push(frame.seq),
                other => panic!("unexpected message: {other:?}"),
            }
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(*reset_calls.lock().unwrap(), 1);
    }
}
