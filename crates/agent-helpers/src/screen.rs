use anyhow::{Context, Result};
use image::ColorType;
use image::codecs::jpeg::JpegEncoder;
use xxhash_rust::xxh3::xxh3_128;

/// A 32-bit ARGB capture of the primary display, row-major, no padding.
/// Shared by the agent's direct capture backend and the session-0 helper,
/// which each own their own change-detection state but grab and encode the
/// same way.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub argb: Vec<u8>,
}

/// The out-of-scope OS-specific primitive: grabs one frame of the primary
/// display. Concrete implementations live behind `cfg(windows)`.
pub trait ScreenGrabber: Send {
    fn grab_primary(&mut self) -> Result<RawFrame>;
}

/// A collision-resistant, non-cryptographic 128-bit digest of the raw pixel
/// buffer, used exclusively for change detection (§3).
pub fn fingerprint(frame: &RawFrame) -> u128 {
    xxh3_128(&frame.argb)
}

pub fn encode_jpeg(frame: &RawFrame, quality: u8) -> Result<Vec<u8>> {
    let rgb = argb_to_rgb(&frame.argb);
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder
        .encode(&rgb, frame.width, frame.height, ColorType::Rgb8)
        .context("jpeg encode failed")?;
    Ok(out)
}

/// GDI delivers pixels as `[B, G, R, A]`; JPEG encoding wants `[R, G, B]`.
fn argb_to_rgb(argb: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(argb.len() / 4 * 3);
    for px in argb.chunks_exact(4) {
        rgb.push(px[2]);
        rgb.push(px[1]);
        rgb.push(px[0]);
    }
    rgb
}

#[cfg(windows)]
mod gdi {
    use std::mem::size_of;

    use anyhow::{Result, bail};
    use windows_sys::Win32::Graphics::Gdi::{
        BI_RGB, BITMAPINFO, BITMAPINFOHEADER, BitBlt, CreateCompatibleBitmap, CreateCompatibleDC,
        DIB_RGB_COLORS, DeleteDC, DeleteObject, GetDC, GetDIBits, ReleaseDC, SRCCOPY, SelectObject,
    };
    use windows_sys::Win32::UI::WindowsAndMessaging::{GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN};

    use super::{RawFrame, ScreenGrabber};

    pub struct GdiScreenGrabber;

    impl GdiScreenGrabber {
        pub fn new() -> Self {
            Self
        }
    }

    impl ScreenGrabber for GdiScreenGrabber {
        fn grab_primary(&mut self) -> Result<RawFrame> {
            unsafe {
                let width = GetSystemMetrics(SM_CXSCREEN);
                let height = GetSystemMetrics(SM_CYSCREEN);
                if width <= 0 || height <= 0 {
                    bail!("GetSystemMetrics returned non-positive display dimensions");
                }

                let screen_dc = GetDC(0);
                if screen_dc == 0 {
                    bail!("GetDC(0) failed");
                }
                let mem_dc = CreateCompatibleDC(screen_dc);
                let bitmap = CreateCompatibleBitmap(screen_dc, width, height);
                let previous = SelectObject(mem_dc, bitmap);

                let blit_ok = BitBlt(mem_dc, 0, 0, width, height, screen_dc, 0, 0, SRCCOPY);

                let mut argb = vec![0u8; (width as usize) * (height as usize) * 4];
                let mut bmi: BITMAPINFO = std::mem::zeroed();
                bmi.bmiHeader = BITMAPINFOHEADER {
                    biSize: size_of::<BITMAPINFOHEADER>() as u32,
                    biWidth: width,
                    biHeight: -height,
                    biPlanes: 1,
                    biBitCount: 32,
                    biCompression: BI_RGB,
                    biSizeImage: 0,
                    biXPelsPerMeter: 0,
                    biYPelsPerMeter: 0,
                    biClrUsed: 0,
                    biClrImportant: 0,
                };

                let copied = GetDIBits(
                    mem_dc,
                    bitmap,
                    0,
                    height as u32,
                    argb.as_mut_ptr().cast(),
                    &mut bmi,
                    DIB_RGB_COLORS,
                );

                SelectObject(mem_dc, previous);
                DeleteObject(bitmap);
                DeleteDC(mem_dc);
                ReleaseDC(0, screen_dc);

                if blit_ok == 0 || copied == 0 {
                    bail!("BitBlt/GetDIBits failed while capturing the primary display");
                }

                Ok(RawFrame { width: width as u32, height: height as u32, argb })
            }
        }
    }
}

#[cfg(windows)]
pub use gdi::GdiScreenGrabber;

#[cfg(not(windows))]
mod stub {
    use anyhow::Result;

    use super::{RawFrame, ScreenGrabber};

    /// A fixed, solid-color buffer — this platform has no display to grab
    /// from, but a deterministic source lets capture-loop behavior (change
    /// suppression, frame cadence) be exercised without Win32.
    pub struct StubScreenGrabber {
        width: u32,
        height: u32,
    }

    impl StubScreenGrabber {
        pub fn new(width: u32, height: u32) -> Self {
            Self { width, height }
        }
    }

    impl ScreenGrabber for StubScreenGrabber {
        fn grab_primary(&mut self) -> Result<RawFrame> {
            let pixel_count = (self.width as usize) * (self.height as usize);
            let mut argb = vec![0u8; pixel_count * 4];
            for px in argb.chunks_exact_mut(4) {
                px.copy_from_slice(&[0x20, 0x40, 0x80, 0xFF]);
            }
            Ok(RawFrame { width: self.width, height: self.height, argb })
        }
    }
}

#[cfg(not(windows))]
pub use stub::StubScreenGrabber;

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(windows))]
    #[test]
    fn identical_frames_share_a_fingerprint() {
        let mut grabber = StubScreenGrabber::new(4, 4);
        let a = grabber.grab_primary().unwrap();
        let b = grabber.grab_primary().unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[cfg(not(windows))]
    #[test]
    fn encode_jpeg_produces_non_empty_bytes() {
        let mut grabber = StubScreenGrabber::new(4, 4);
        let frame = grabber.grab_primary().unwrap();
        let jpeg = encode_jpeg(&frame, 70).unwrap();
        assert!(!jpeg.is_empty());
    }
}
