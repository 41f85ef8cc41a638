// `CAPTURE_INPUT_TYPE_NOTIFY` is re-exported for helper-side parity but has
// no sender on this side yet: the wire protocol carries no technician
// identity for the service to pass along, so the overlay's "Session
// controlled by" banner never lights up from a live connection. This is a
// known latent gap, not an oversight.
pub use agent_helpers::bridge_protocol::{
    CAPTURE_INPUT_TYPE_KEY, CAPTURE_INPUT_TYPE_MOUSE, CAPTURE_INPUT_TYPE_NOTIFY,
};
use uuid::Uuid;

use super::capture::CaptureSnapshot;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("no interactive session available to host a helper")]
    NoInteractiveSession,
    #[error("helper did not connect both pipes within the timeout")]
    HelperDidNotConnect,
    #[error("bridge I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session-0 bridge is not supported on this platform")]
    Unsupported,
}

pub fn new_pipe_names() -> (String, String) {
    let suffix = Uuid::new_v4();
    (format!("capture-{suffix}"), format!("input-{suffix}"))
}

#[cfg(windows)]
pub use windows_bridge::SessionZeroBridge;

#[cfg(not(windows))]
pub use stub_bridge::SessionZeroBridge;

#[cfg(windows)]
mod windows_bridge {
    use std::ffi::c_void;
    use std::io::{Read, Write};
    use std::mem::size_of;
    use std::os::windows::ffi::OsStrExt;
    use std::time::Duration;

    use anyhow::{Context, Result, bail};
    use tracing::{info, warn};
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::Security::Authorization::ConvertStringSecurityDescriptorToSecurityDescriptorW;
    use windows_sys::Win32::Security::{
        PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES, SECURITY_IMPERSONATION_LEVEL, TOKEN_ALL_ACCESS,
        TokenPrimary,
    };
    use windows_sys::Win32::Security::DuplicateTokenEx;
    use windows_sys::Win32::System::Environment::{CreateEnvironmentBlock, DestroyEnvironmentBlock};
    use windows_sys::Win32::System::Pipes::{
        ConnectNamedPipe, CreateNamedPipeW, PIPE_ACCESS_DUPLEX, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE,
        PIPE_WAIT,
    };
    use windows_sys::Win32::System::RemoteDesktop::{
        WTSActive, WTSEnumerateSessionsW, WTSFreeMemory, WTSGetActiveConsoleSessionId,
        WTSQueryUserToken, WTS_CURRENT_SERVER_HANDLE, WTS_SESSION_INFOW,
    };
    use windows_sys::Win32::System::Threading::{
        CREATE_NO_WINDOW, CREATE_UNICODE_ENVIRONMENT, CreateProcessAsUserW, PROCESS_INFORMATION,
        STARTUPINFOW,
    };

    use super::{BridgeError, CaptureSnapshot, new_pipe_names};
    use crate::core::capture::CaptureProvider;

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Grants full control to SYSTEM and read/write to any authenticated
    /// interactive user (§4.5 step 1).
    const PIPE_SDDL: &str = "D:(A;;GA;;;SY)(A;;GRGW;;;AU)";

    struct HandleGuard(HANDLE);

    impl Drop for HandleGuard {
        fn drop(&mut self) {
            if self.0 != 0 && self.0 != INVALID_HANDLE_VALUE {
                unsafe {
                    CloseHandle(self.0);
                }
            }
        }
    }

    struct EnvBlockGuard(*mut c_void);

    impl Drop for EnvBlockGuard {
        fn drop(&mut self) {
            if !self.0.is_null() {
                unsafe {
                    DestroyEnvironmentBlock(self.0);
                }
            }
        }
    }

    pub struct SessionZeroBridge {
        capture_pipe: Option<std::fs::File>,
        input_pipe: Option<std::fs::File>,
        target_session_id: Option<u32>,
    }

    impl SessionZeroBridge {
        pub fn new() -> Self {
            Self { capture_pipe: None, input_pipe: None, target_session_id: None }
        }

        /// One-way service→helper framing for mouse/key/notify events
        /// (§4.5). Serialised by the caller holding the bridge behind a
        /// mutex, so writes to the pipe never interleave.
        pub fn send_input_frame(&mut self, frame_type: u8, json: &[u8]) -> Result<()> {
            self.ensure_connected()?;
            let pipe = self.input_pipe.as_mut().expect("connected above");
            let len = u32::try_from(json.len()).context("input frame too large")?;
            pipe.write_all(&[frame_type])?;
            pipe.write_all(&len.to_be_bytes())?;
            pipe.write_all(json)?;
            Ok(())
        }

        fn teardown(&mut self) {
            self.capture_pipe = None;
            self.input_pipe = None;
        }

        fn ensure_connected(&mut self) -> Result<()> {
            if self.capture_pipe.is_some() && self.input_pipe.is_some() {
                return Ok(());
            }

            let session_id = self.resolve_target_session()?;
            let (capture_name, input_name) = new_pipe_names();

            let capture_server = create_pipe_server(&capture_name)?;
            let input_server = create_pipe_server(&input_name)?;

            spawn_helper_into_session(session_id, &capture_name, &input_name)
                .context("failed to spawn session-0 helper")?;

            let capture_pipe = wait_for_connection(capture_server)?;
            let input_pipe = wait_for_connection(input_server)?;

            self.capture_pipe = Some(capture_pipe);
            self.input_pipe = Some(input_pipe);
            info!("session-0 helper connected for session {session_id}");
            Ok(())
        }

        fn resolve_target_session(&self) -> Result<u32> {
            if let Some(id) = self.target_session_id {
                return Ok(id);
            }

            let console = unsafe { WTSGetActiveConsoleSessionId() };
            if console != u32::MAX {
                return Ok(console);
            }

            unsafe {
                let mut sessions: *mut WTS_SESSION_INFOW = std::ptr::null_mut();
                let mut count: u32 = 0;
                if WTSEnumerateSessionsW(WTS_CURRENT_SERVER_HANDLE, 0, 1, &mut sessions, &mut count) == 0 {
                    bail!(BridgeError::NoInteractiveSession);
                }

                let slice = std::slice::from_raw_parts(sessions, count as usize);
                let found = slice.iter().find_map(|session| {
                    if session.State == WTSActive {
                        let mut token: HANDLE = 0;
                        if WTSQueryUserToken(session.SessionId, &mut token) != 0 {
                            CloseHandle(token);
                            return Some(session.SessionId);
                        }
                    }
                    None
                });

                WTSFreeMemory(sessions.cast());
                found.ok_or_else(|| BridgeError::NoInteractiveSession.into())
            }
        }
    }

    impl CaptureProvider for SessionZeroBridge {
        fn capture(&mut self, quality: u8) -> Result<CaptureSnapshot> {
            self.ensure_connected().map_err(|err| {
                self.teardown();
                err
            })?;

            let result = (|| -> Result<CaptureSnapshot> {
                let pipe = self.capture_pipe.as_mut().expect("connected above");
                pipe.write_all(&[quality.clamp(1, 100)])?;

                let mut len_buf = [0u8; 4];
                pipe.read_exact(&mut len_buf)?;
                let len = u32::from_be_bytes(len_buf) as usize;
                if len == 0 {
                    return Ok(CaptureSnapshot::Unchanged);
                }

                let mut jpeg = vec![0u8; len];
                pipe.read_exact(&mut jpeg)?;
                Ok(CaptureSnapshot::Jpeg(jpeg))
            })();

            if result.is_err() {
                warn!("session-0 capture pipe failed, helper will be re-spawned on next request");
                self.teardown();
            }
            result
        }

        // Change detection happens entirely on the helper side
        // (`capture_server::run`'s fingerprint comparison, which answers
        // with a 0-length frame for "unchanged"); the bridge itself holds
        // no change-detection state to reset.
        fn reset(&mut self) {}
    }

    fn create_pipe_server(name: &str) -> Result<HANDLE> {
        let full_name = wide_null(&format!(r"\\.\pipe\{name}"));
        let sddl = wide_null(PIPE_SDDL);

        unsafe {
            let mut descriptor: PSECURITY_DESCRIPTOR = std::ptr::null_mut();
            if ConvertStringSecurityDescriptorToSecurityDescriptorW(
                sddl.as_ptr(),
                1,
                &mut descriptor,
                std::ptr::null_mut(),
            ) == 0
            {
                bail!("failed to build pipe security descriptor");
            }

            let mut attrs = SECURITY_ATTRIBUTES {
                nLength: size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: descriptor,
                bInheritHandle: 0,
            };

            let handle = CreateNamedPipeW(
                full_name.as_ptr(),
                PIPE_ACCESS_DUPLEX,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                1,
                65536,
                65536,
                0,
                &mut attrs,
            );

            if handle == INVALID_HANDLE_VALUE {
                bail!("CreateNamedPipeW failed for {name}");
            }

            Ok(handle)
        }
    }

    fn wait_for_connection(server: HANDLE) -> Result<std::fs::File> {
        use std::os::windows::io::FromRawHandle;

        let guard = HandleGuard(server);
        let (tx, rx) = std::sync::mpsc::channel();
        let raw = guard.0;
        std::thread::spawn(move || {
            let ok = unsafe { ConnectNamedPipe(raw, std::ptr::null_mut()) };
            let _ = tx.send(ok != 0);
        });

        match rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(true) => {
                let file = unsafe { std::fs::File::from_raw_handle(guard.0 as *mut c_void) };
                std::mem::forget(guard);
                Ok(file)
            }
            _ => Err(BridgeError::HelperDidNotConnect.into()),
        }
    }

    fn spawn_helper_into_session(session_id: u32, capture_pipe: &str, input_pipe: &str) -> Result<()> {
        unsafe {
            let mut user_token: HANDLE = 0;
            if WTSQueryUserToken(session_id, &mut user_token) == 0 {
                bail!("WTSQueryUserToken failed for session {session_id}");
            }
            let user_token_guard = HandleGuard(user_token);

            let mut primary_token: HANDLE = 0;
            if DuplicateTokenEx(
                user_token_guard.0,
                TOKEN_ALL_ACCESS,
                std::ptr::null(),
                SECURITY_IMPERSONATION_LEVEL::default(),
                TokenPrimary,
                &mut primary_token,
            ) == 0
            {
                bail!("DuplicateTokenEx failed for session {session_id}");
            }
            let primary_token_guard = HandleGuard(primary_token);

            let mut env_block: *mut c_void = std::ptr::null_mut();
            if CreateEnvironmentBlock(&mut env_block, primary_token_guard.0, 0) == 0 {
                bail!("CreateEnvironmentBlock failed for session {session_id}");
            }
            let env_guard = EnvBlockGuard(env_block);

            let helper_exe = helper_executable_path()?;
            let mut command_line =
                wide_null(&format!("\"{}\" {capture_pipe} {input_pipe}", helper_exe.display()));
            let mut desktop = wide_null(r"winsta0\default");

            let mut startup_info: STARTUPINFOW = std::mem::zeroed();
            startup_info.cb = size_of::<STARTUPINFOW>() as u32;
            startup_info.lpDesktop = desktop.as_mut_ptr();

            let mut process_info: PROCESS_INFORMATION = std::mem::zeroed();

            let created = CreateProcessAsUserW(
                primary_token_guard.0,
                std::ptr::null(),
                command_line.as_mut_ptr(),
                std::ptr::null(),
                std::ptr::null(),
                0,
                CREATE_UNICODE_ENVIRONMENT | CREATE_NO_WINDOW,
                env_guard.0,
                std::ptr::null(),
                &startup_info,
                &mut process_info,
            );

            if created == 0 {
                bail!("CreateProcessAsUserW failed for session {session_id}");
            }

            CloseHandle(process_info.hProcess);
            CloseHandle(process_info.hThread);
            Ok(())
        }
    }

    /// The helper ships as a sibling binary beside the service executable
    /// (§4.6's "distinct process image" with its own `main`), not a flag on
    /// this process.
    fn helper_executable_path() -> Result<std::path::PathBuf> {
        let current = std::env::current_exe().context("failed to resolve own executable path")?;
        let dir = current.parent().context("executable has no parent directory")?;
        let file_name = if cfg!(windows) { "agent-helper.exe" } else { "agent-helper" };
        Ok(dir.join(file_name))
    }

    fn wide_null(value: &str) -> Vec<u16> {
        std::ffi::OsStr::new(value).encode_wide().chain(std::iter::once(0)).collect()
    }
}

#[cfg(not(windows))]
mod stub_bridge {
    use anyhow::Result;

    use super::{BridgeError, CaptureSnapshot};
    use crate::core::capture::CaptureProvider;

    pub struct SessionZeroBridge;

    impl SessionZeroBridge {
        pub fn new() -> Self {
            Self
        }

        pub fn send_input_frame(&mut self, _frame_type: u8, _json: &[u8]) -> Result<()> {
            Err(BridgeError::Unsupported.into())
        }
    }

    impl CaptureProvider for SessionZeroBridge {
        fn capture(&mut self, _quality: u8) -> Result<CaptureSnapshot> {
            Err(BridgeError::Unsupported.into())
        }

        fn reset(&mut self) {}
    }
}
