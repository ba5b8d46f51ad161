//! Platform adaptation seam
//!
//! Everything that differs between hosts when talking to a worker lives
//! here: the line terminator the worker expects, how a polite stop is
//! delivered, and the executable suffix tried during resolution.

use std::str::FromStr;

/// Line terminator written after each outbound message
///
/// Reads always accept both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEnding {
    #[default]
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            LineEnding::Lf => b"\n",
            LineEnding::CrLf => b"\r\n",
        }
    }
}

impl FromStr for LineEnding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lf" | "\\n" | "unix" => Ok(LineEnding::Lf),
            "crlf" | "\\r\\n" | "windows" => Ok(LineEnding::CrLf),
            other => Err(format!("unknown line ending '{}' (expected lf or crlf)", other)),
        }
    }
}

/// How a stop request reaches the worker before the forced kill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Close stdin, send SIGTERM, wait out the grace period, then SIGKILL
    SignalThenKill,
    /// Close stdin, wait out the grace period, then kill
    CloseThenKill,
}

/// Host-specific behavior injected into the supervisor at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformProfile {
    pub line_ending: LineEnding,
    pub termination: Termination,
    pub executable_suffix: &'static str,
}

impl PlatformProfile {
    /// Profile for the host this binary was built for
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::windows()
        } else {
            Self::unix()
        }
    }

    pub fn unix() -> Self {
        Self {
            line_ending: LineEnding::Lf,
            termination: Termination::SignalThenKill,
            executable_suffix: "",
        }
    }

    pub fn windows() -> Self {
        Self {
            line_ending: LineEnding::CrLf,
            termination: Termination::CloseThenKill,
            executable_suffix: ".exe",
        }
    }

    pub fn with_line_ending(mut self, line_ending: LineEnding) -> Self {
        self.line_ending = line_ending;
        self
    }
}

impl Default for PlatformProfile {
    fn default() -> Self {
        Self::current()
    }
}

/// Deliver the polite termination signal to `pid`
///
/// Returns false when the platform has no such signal or delivery failed,
/// in which case the caller relies on the grace timer alone.
#[cfg(unix)]
pub(crate) fn send_terminate(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            tracing::warn!(pid, error = %e, "failed to send SIGTERM to worker");
            false
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn send_terminate(_pid: u32) -> bool {
    false
}

/// Whether a spawn failure is a known transient condition
///
/// Covers ETXTBSY ("text file busy", the executable is still being
/// written or unpacked) and the Windows sharing violation.
pub(crate) fn is_transient_spawn_error(error: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        error.raw_os_error() == Some(libc::ETXTBSY)
    }
    #[cfg(windows)]
    {
        const ERROR_SHARING_VIOLATION: i32 = 32;
        error.raw_os_error() == Some(ERROR_SHARING_VIOLATION)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = error;
        false
    }
}
