use std::sync::OnceLock;
use std::sync::mpsc::Sender;

use tracing::warn;

#[cfg(windows)]
use windows_overlay::Command;

#[cfg(windows)]
static OVERLAY: OnceLock<Sender<Command>> = OnceLock::new();

/// Shows the topmost, borderless, click-through "Session controlled by"
/// banner, re-anchored to the bottom-right of the primary display (§4.6).
/// The window is owned by a dedicated thread started on first use.
#[cfg(windows)]
pub fn show(technician_name: &str) {
    let tx = OVERLAY.get_or_init(windows_overlay::spawn);
    if tx.send(Command::Show(technician_name.to_string())).is_err() {
        warn!("overlay thread is gone, could not show banner");
    }
}

#[cfg(windows)]
pub fn hide() {
    if let Some(tx) = OVERLAY.get() {
        if tx.send(Command::Hide).is_err() {
            warn!("overlay thread is gone, could not hide banner");
        }
    }
}

#[cfg(not(windows))]
pub fn show(technician_name: &str) {
    tracing::debug!("overlay stub: would show \"Session controlled by: {technician_name}\"");
}

#[cfg(not(windows))]
pub fn hide() {
    tracing::debug!("overlay stub: would hide banner");
}

#[cfg(windows)]
mod windows_overlay {
    use std::sync::Mutex;
    use std::sync::mpsc::{self, Sender, TryRecvError};
    use std::time::Duration;

    use windows_sys::Win32::Foundation::{HWND, LPARAM, LRESULT, WPARAM};
    use windows_sys::Win32::Graphics::Gdi::{
        BeginPaint, CreateSolidBrush, EndPaint, InvalidateRect, PAINTSTRUCT, SetBkMode, SetTextColor,
        TextOutW, TRANSPARENT,
    };
    use windows_sys::Win32::UI::WindowsAndMessaging::{
        CW_USEDEFAULT, CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GetSystemMetrics,
        MSG, PM_REMOVE, PeekMessageW, RegisterClassW, SM_CXSCREEN, SM_CYSCREEN, SW_HIDE, SW_SHOWNOACTIVATE,
        SWP_NOACTIVATE, SetWindowPos, ShowWindow, TranslateMessage, WM_DESTROY, WM_PAINT, WNDCLASSW,
        WS_EX_LAYERED, WS_EX_NOACTIVATE, WS_EX_TOOLWINDOW, WS_EX_TOPMOST, WS_EX_TRANSPARENT, WS_POPUP,
    };

    const OVERLAY_WIDTH: i32 = 320;
    const OVERLAY_HEIGHT: i32 = 32;
    const MARGIN: i32 = 16;
    const CLASS_NAME: &str = "RemoteAgentOverlayWindow";
    const POLL_INTERVAL: Duration = Duration::from_millis(50);

    pub enum Command {
        Show(String),
        Hide,
    }

    static BANNER_TEXT: Mutex<Vec<u16>> = Mutex::new(Vec::new());

    pub fn spawn() -> Sender<Command> {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || pump(rx));
        tx
    }

    fn pump(rx: std::sync::mpsc::Receiver<Command>) {
        let hwnd = unsafe { create_window() };

        unsafe {
            let mut msg: MSG = std::mem::zeroed();
            loop {
                while PeekMessageW(&mut msg, 0, 0, 0, PM_REMOVE) != 0 {
                    TranslateMessage(&msg);
                    DispatchMessageW(&msg);
                }

                match rx.try_recv() {
                    Ok(Command::Show(name)) => {
                        *BANNER_TEXT.lock().unwrap() = wide(&format!("Session controlled by: {name}"));
                        anchor_bottom_right(hwnd);
                        ShowWindow(hwnd, SW_SHOWNOACTIVATE);
                        InvalidateRect(hwnd, std::ptr::null(), 1);
                    }
                    Ok(Command::Hide) => {
                        ShowWindow(hwnd, SW_HIDE);
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => break,
                }

                std::thread::sleep(POLL_INTERVAL);
            }
            DestroyWindow(hwnd);
        }
    }

    unsafe fn create_window() -> HWND {
        unsafe {
            let class_name = wide(CLASS_NAME);
            let class = WNDCLASSW {
                style: 0,
                lpfnWndProc: Some(wnd_proc),
                cbClsExtra: 0,
                cbWndExtra: 0,
                hInstance: 0,
                hIcon: 0,
                hCursor: 0,
                hbrBackground: CreateSolidBrush(0x00202020),
                lpszMenuName: std::ptr::null(),
                lpszClassName: class_name.as_ptr(),
            };
            RegisterClassW(&class);

            let hwnd = CreateWindowExW(
                WS_EX_LAYERED | WS_EX_TOPMOST | WS_EX_TOOLWINDOW | WS_EX_NOACTIVATE | WS_EX_TRANSPARENT,
                class_name.as_ptr(),
                wide("").as_ptr(),
                WS_POPUP,
                CW_USEDEFAULT,
                CW_USEDEFAULT,
                OVERLAY_WIDTH,
                OVERLAY_HEIGHT,
                0,
                0,
                0,
                std::ptr::null(),
            );
            hwnd
        }
    }

    /// Re-anchors to the bottom-right of the primary display, re-reading
    /// screen metrics on every show so a resolution change since the last
    /// show is picked up.
    unsafe fn anchor_bottom_right(hwnd: HWND) {
        unsafe {
            let screen_w = GetSystemMetrics(SM_CXSCREEN);
            let screen_h = GetSystemMetrics(SM_CYSCREEN);
            let x = (screen_w - OVERLAY_WIDTH - MARGIN).max(0);
            let y = (screen_h - OVERLAY_HEIGHT - MARGIN).max(0);
            SetWindowPos(hwnd, 0, x, y, OVERLAY_WIDTH, OVERLAY_HEIGHT, SWP_NOACTIVATE);
        }
    }

    unsafe extern "system" fn wnd_proc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
        unsafe {
            match msg {
                WM_PAINT => {
                    let mut paint: PAINTSTRUCT = std::mem::zeroed();
                    let hdc = BeginPaint(hwnd, &mut paint);
                    SetBkMode(hdc, TRANSPARENT);
                    SetTextColor(hdc, 0x00FFFFFF);
                    let text = BANNER_TEXT.lock().unwrap();
                    TextOutW(hdc, 12, 8, text.as_ptr(), text.len() as i32);
                    EndPaint(hwnd, &paint);
                    0
                }
                WM_DESTROY => 0,
                _ => DefWindowProcW(hwnd, msg, wparam, lparam),
            }
        }
    }

    fn wide(value: &str) -> Vec<u16> {
        value.encode_utf16().chain(std::iter::once(0)).collect()
    }
}
