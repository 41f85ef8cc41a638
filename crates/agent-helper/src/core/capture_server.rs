use std::io::{Read, Write};

use agent_helpers::screen::{self, RawFrame, ScreenGrabber};
use anyhow::{Context, Result};
use tracing::debug;

#[cfg(windows)]
use agent_helpers::screen::GdiScreenGrabber;
#[cfg(not(windows))]
use agent_helpers::screen::StubScreenGrabber;

/// Serves capture requests on the main thread until the pipe closes (§4.6):
/// one byte quality in, a 4-byte big-endian length out — `0` for
/// "unchanged", otherwise that many JPEG bytes follow. Generic over the pipe
/// handle so the framing can be exercised without a real named pipe.
pub fn run<P: Read + Write>(pipe: &mut P) -> Result<()> {
    #[cfg(windows)]
    let mut grabber: Box<dyn ScreenGrabber> = Box::new(GdiScreenGrabber::new());
    #[cfg(not(windows))]
    let mut grabber: Box<dyn ScreenGrabber> = Box::new(StubScreenGrabber::new(1920, 1080));

    let mut previous_fingerprint: Option<u128> = None;

    loop {
        let mut quality_buf = [0u8; 1];
        match pipe.read_exact(&mut quality_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("capture pipe closed by service");
                return Ok(());
            }
            Err(err) => return Err(err).context("capture pipe read failed"),
        }
        let quality = quality_buf[0].clamp(1, 100);

        let frame: RawFrame = grabber.grab_primary().context("screen grab failed")?;
        let fingerprint = screen::fingerprint(&frame);

        if previous_fingerprint == Some(fingerprint) {
            pipe.write_all(&0u32.to_be_bytes()).context("capture pipe write failed")?;
            continue;
        }
        previous_fingerprint = Some(fingerprint);

        let jpeg = screen::encode_jpeg(&frame, quality)?;
        let len = u32::try_from(jpeg.len()).context("encoded frame too large")?;
        pipe.write_all(&len.to_be_bytes()).context("capture pipe write failed")?;
        pipe.write_all(&jpeg).context("capture pipe write failed")?;
    }
}

#[cfg(all(test, not(windows)))]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    struct FakePipe {
        inbound: VecDeque<u8>,
        outbound: Vec<u8>,
    }

    impl Read for FakePipe {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for FakePipe {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn second_request_at_same_quality_reports_unchanged() {
        let mut pipe = FakePipe { inbound: VecDeque::from(vec![70u8, 70u8]), outbound: Vec::new() };
        run(&mut pipe).unwrap();

        let first_len = u32::from_be_bytes(pipe.outbound[0..4].try_into().unwrap()) as usize;
        assert!(first_len > 0);

        let second_len_at = 4 + first_len;
        let second_len =
            u32::from_be_bytes(pipe.outbound[second_len_at..second_len_at + 4].try_into().unwrap());
        assert_eq!(second_len, 0);
    }

    #[test]
    fn empty_pipe_returns_cleanly_on_eof() {
        let mut pipe = FakePipe { inbound: VecDeque::new(), outbound: Vec::new() };
        run(&mut pipe).unwrap();
        assert!(pipe.outbound.is_empty());
    }
}
