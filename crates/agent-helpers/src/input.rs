use anyhow::Result;
use tracing::warn;

use agent_proto::{KeyAction, KeyEventPayload, Modifier, MouseAction, MouseEventPayload};

/// The OS-level primitive the simulator drives. Concrete implementations
/// live behind the `cfg(windows)`/stub split below; shared by the agent's
/// direct input path and the session-0 helper, which both apply the same
/// protocol-level events to an interactive desktop.
pub trait InputSink: Send {
    fn mouse_event(&mut self, x: i32, y: i32, button: u8, action: MouseAction) -> Result<()>;
    fn key_event(&mut self, vk: u16, action: KeyAction) -> Result<()>;
}

/// Applies protocol-level mouse/key events to an [`InputSink`], expanding
/// `click`/`dblclick` and ordering modifiers around the main key per §4.7.
pub struct InputSimulator {
    sink: Box<dyn InputSink>,
}

impl InputSimulator {
    pub fn new(sink: Box<dyn InputSink>) -> Self {
        Self { sink }
    }

    pub fn apply_mouse(&mut self, event: &MouseEventPayload) -> Result<()> {
        match event.action {
            MouseAction::Move | MouseAction::Down | MouseAction::Up => {
                self.sink.mouse_event(event.x, event.y, event.button, event.action)
            }
            MouseAction::Click => {
                self.sink.mouse_event(event.x, event.y, event.button, MouseAction::Down)?;
                self.sink.mouse_event(event.x, event.y, event.button, MouseAction::Up)
            }
            MouseAction::Dblclick => {
                for _ in 0..2 {
                    self.sink.mouse_event(event.x, event.y, event.button, MouseAction::Down)?;
                    self.sink.mouse_event(event.x, event.y, event.button, MouseAction::Up)?;
                }
                Ok(())
            }
        }
    }

    /// On `down`, modifiers are pressed before the main key; on `up`, the
    /// main key releases first, then modifiers release in the same order
    /// they were listed.
    pub fn apply_key(&mut self, event: &KeyEventPayload) -> Result<()> {
        let Some(vk) = vk_code(&event.key) else {
            warn!("ignoring key event for unmapped key: {}", event.key);
            return Ok(());
        };

        match event.action {
            KeyAction::Down => {
                for modifier in &event.modifiers {
                    self.sink.key_event(modifier_vk(*modifier), KeyAction::Down)?;
                }
                self.sink.key_event(vk, KeyAction::Down)
            }
            KeyAction::Up => {
                self.sink.key_event(vk, KeyAction::Up)?;
                for modifier in &event.modifiers {
                    self.sink.key_event(modifier_vk(*modifier), KeyAction::Up)?;
                }
                Ok(())
            }
        }
    }
}

fn modifier_vk(modifier: Modifier) -> u16 {
    match modifier {
        Modifier::Ctrl => 0x11,
        Modifier::Alt => 0x12,
        Modifier::Shift => 0x10,
        Modifier::Meta => 0x5B,
    }
}

/// Maps a web-platform key name to its virtual-key code. Matching is
/// case-insensitive; unmapped names return `None` so the caller can log and
/// drop the event rather than fail the session.
pub fn vk_code(key: &str) -> Option<u16> {
    let lower = key.to_ascii_lowercase();

    if let Some(code) = named_key_vk(&lower) {
        return Some(code);
    }

    if key.chars().count() == 1 {
        let ch = key.chars().next().unwrap();
        if ch.is_ascii_alphabetic() {
            return Some(0x41 + (ch.to_ascii_uppercase() as u16 - b'A' as u16));
        }
        if ch.is_ascii_digit() {
            return Some(0x30 + (ch as u16 - b'0' as u16));
        }
    }

    None
}

fn named_key_vk(lower: &str) -> Option<u16> {
    Some(match lower {
        "enter" => 0x0D,
        "tab" => 0x09,
        "escape" => 0x1B,
        "backspace" => 0x08,
        "delete" => 0x2E,
        "insert" => 0x2D,
        "home" => 0x24,
        "end" => 0x23,
        "pageup" => 0x21,
        "pagedown" => 0x22,
        "arrowleft" => 0x25,
        "arrowup" => 0x26,
        "arrowright" => 0x27,
        "arrowdown" => 0x28,
        "space" => 0x20,
        "f1" => 0x70,
        "f2" => 0x71,
        "f3" => 0x72,
        "f4" => 0x73,
        "f5" => 0x74,
        "f6" => 0x75,
        "f7" => 0x76,
        "f8" => 0x77,
        "f9" => 0x78,
        "f10" => 0x79,
        "f11" => 0x7A,
        "f12" => 0x7B,
        "capslock" => 0x14,
        "numlock" => 0x90,
        "scrolllock" => 0x91,
        "printscreen" => 0x2C,
        "pause" => 0x13,
        "contextmenu" => 0x5D,
        "control" => 0x11,
        "alt" => 0x12,
        "shift" => 0x10,
        "meta" => 0x5B,
        _ => return None,
    })
}

#[cfg(windows)]
mod windows_sink {
    use std::mem::size_of;

    use anyhow::Result;
    use windows_sys::Win32::UI::Input::KeyboardAndMouse::{
        INPUT, INPUT_0, INPUT_KEYBOARD, INPUT_MOUSE, KEYBDINPUT, KEYEVENTF_KEYUP, MOUSEEVENTF_ABSOLUTE,
        MOUSEEVENTF_LEFTDOWN, MOUSEEVENTF_LEFTUP, MOUSEEVENTF_MIDDLEDOWN, MOUSEEVENTF_MIDDLEUP,
        MOUSEEVENTF_MOVE, MOUSEEVENTF_RIGHTDOWN, MOUSEEVENTF_RIGHTUP, MOUSEINPUT, SendInput,
    };
    use windows_sys::Win32::UI::WindowsAndMessaging::{GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN};

    use agent_proto::{KeyAction, MouseAction};

    use super::InputSink;

    pub struct SendInputSink;

    impl SendInputSink {
        pub fn new() -> Self {
            Self
        }

        fn normalize(x: i32, y: i32) -> (i32, i32) {
            let width = unsafe { GetSystemMetrics(SM_CXSCREEN) }.max(1);
            let height = unsafe { GetSystemMetrics(SM_CYSCREEN) }.max(1);
            let nx = (x.clamp(0, width) as i64 * 65535 / width as i64) as i32;
            let ny = (y.clamp(0, height) as i64 * 65535 / height as i64) as i32;
            (nx, ny)
        }
    }

    impl InputSink for SendInputSink {
        fn mouse_event(&mut self, x: i32, y: i32, button: u8, action: MouseAction) -> Result<()> {
            let (nx, ny) = Self::normalize(x, y);
            let flags = match (button, action) {
                (_, MouseAction::Move) => MOUSEEVENTF_MOVE | MOUSEEVENTF_ABSOLUTE,
                (1, MouseAction::Down) => MOUSEEVENTF_MIDDLEDOWN | MOUSEEVENTF_ABSOLUTE,
                (1, MouseAction::Up) => MOUSEEVENTF_MIDDLEUP | MOUSEEVENTF_ABSOLUTE,
                (2, MouseAction::Down) => MOUSEEVENTF_RIGHTDOWN | MOUSEEVENTF_ABSOLUTE,
                (2, MouseAction::Up) => MOUSEEVENTF_RIGHTUP | MOUSEEVENTF_ABSOLUTE,
                (_, MouseAction::Down) => MOUSEEVENTF_LEFTDOWN | MOUSEEVENTF_ABSOLUTE,
                (_, MouseAction::Up) => MOUSEEVENTF_LEFTUP | MOUSEEVENTF_ABSOLUTE,
                (_, MouseAction::Click | MouseAction::Dblclick) => {
                    unreachable!("click/dblclick are expanded before reaching the sink")
                }
            };

            let input = INPUT {
                r#type: INPUT_MOUSE,
                Anonymous: INPUT_0 {
                    mi: MOUSEINPUT {
                        dx: nx,
                        dy: ny,
                        mouseData: 0,
                        dwFlags: flags,
                        time: 0,
                        dwExtraInfo: 0,
                    },
                },
            };
            send_inputs(&[input])
        }

        fn key_event(&mut self, vk: u16, action: KeyAction) -> Result<()> {
            let flags = match action {
                KeyAction::Down => 0,
                KeyAction::Up => KEYEVENTF_KEYUP,
            };
            let input = INPUT {
                r#type: INPUT_KEYBOARD,
                Anonymous: INPUT_0 {
                    ki: KEYBDINPUT { wVk: vk, wScan: 0, dwFlags: flags, time: 0, dwExtraInfo: 0 },
                },
            };
            send_inputs(&[input])
        }
    }

    fn send_inputs(inputs: &[INPUT]) -> Result<()> {
        let sent = unsafe { SendInput(inputs.len() as u32, inputs.as_ptr(), size_of::<INPUT>() as i32) };
        if sent as usize != inputs.len() {
            anyhow::bail!("SendInput reported {sent} of {} events accepted", inputs.len());
        }
        Ok(())
    }
}

#[cfg(windows)]
pub use windows_sink::SendInputSink;

#[cfg(not(windows))]
mod stub_sink {
    use anyhow::Result;
    use tracing::debug;

    use agent_proto::{KeyAction, MouseAction};

    use super::InputSink;

    /// Logs instead of injecting; this platform has no interactive desktop
    /// input surface to drive.
    pub struct LoggingInputSink;

    impl LoggingInputSink {
        pub fn new() -> Self {
            Self
        }
    }

    impl InputSink for LoggingInputSink {
        fn mouse_event(&mut self, x: i32, y: i32, button: u8, action: MouseAction) -> Result<()> {
            debug!("input sink stub: mouse {action:?} button={button} at ({x}, {y})");
            Ok(())
        }

        fn key_event(&mut self, vk: u16, action: KeyAction) -> Result<()> {
            debug!("input sink stub: key {action:?} vk=0x{vk:02x}");
            Ok(())
        }
    }
}

#[cfg(not(windows))]
pub use stub_sink::LoggingInputSink;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_keys_map_to_documented_codes() {
        assert_eq!(vk_code("Enter"), Some(0x0D));
        assert_eq!(vk_code("ArrowLeft"), Some(0x25));
        assert_eq!(vk_code("F5"), Some(0x74));
        assert_eq!(vk_code("Control"), Some(0x11));
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(vk_code("enter"), vk_code("ENTER"));
        assert_eq!(vk_code("arrowleft"), vk_code("ArrowLeft"));
    }

    #[test]
    fn letters_and_digits_map_directly() {
        assert_eq!(vk_code("a"), Some(0x41));
        assert_eq!(vk_code("z"), Some(0x5A));
        assert_eq!(vk_code("0"), Some(0x30));
        assert_eq!(vk_code("9"), Some(0x39));
    }

    #[test]
    fn unknown_key_returns_none() {
        assert_eq!(vk_code("Hyper"), None);
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl InputSink for RecordingSink {
        fn mouse_event(&mut self, x: i32, y: i32, button: u8, action: MouseAction) -> Result<()> {
            self.events.lock().unwrap().push(format!("mouse:{action:?}:{button}:{x},{y}"));
            Ok(())
        }

        fn key_event(&mut self, vk: u16, action: KeyAction) -> Result<()> {
            self.events.lock().unwrap().push(format!("key:{action:?}:0x{vk:02x}"));
            Ok(())
        }
    }

    #[test]
    fn click_expands_to_down_then_up() {
        let recorder = RecordingSink::default();
        let mut sim = InputSimulator::new(Box::new(recorder.clone()));
        sim.apply_mouse(&MouseEventPayload { x: 1, y: 2, button: 0, action: MouseAction::Click })
            .unwrap();
        assert_eq!(*recorder.events.lock().unwrap(), vec!["mouse:Down:0:1,2", "mouse:Up:0:1,2"]);
    }

    #[test]
    fn dblclick_expands_to_two_down_up_pairs() {
        let recorder = RecordingSink::default();
        let mut sim = InputSimulator::new(Box::new(recorder.clone()));
        sim.apply_mouse(&MouseEventPayload { x: 0, y: 0, button: 0, action: MouseAction::Dblclick })
            .unwrap();
        assert_eq!(recorder.events.lock().unwrap().len(), 4);
    }

    #[test]
    fn key_down_presses_modifiers_before_main_key() {
        let recorder = RecordingSink::default();
        let mut sim = InputSimulator::new(Box::new(recorder.clone()));
        sim.apply_key(&KeyEventPayload {
            key: "a".into(),
            action: KeyAction::Down,
            modifiers: vec![Modifier::Ctrl, Modifier::Shift],
        })
        .unwrap();
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["key:Down:0x11", "key:Down:0x10", "key:Down:0x41"]
        );
    }

    #[test]
    fn key_up_releases_main_key_before_modifiers() {
        let recorder = RecordingSink::default();
        let mut sim = InputSimulator::new(Box::new(recorder.clone()));
        sim.apply_key(&KeyEventPayload {
            key: "a".into(),
            action: KeyAction::Up,
            modifiers: vec![Modifier::Ctrl],
        })
        .unwrap();
        assert_eq!(*recorder.events.lock().unwrap(), vec!["key:Up:0x41", "key:Up:0x11"]);
    }
}
