//! Error types for agentlink
//!
//! [`LaunchError`] covers everything that can go wrong before the worker is
//! running. [`ClientError`] is the full taxonomy surfaced by the client's
//! public operations. Any client error can be rendered as a structured
//! [`ErrorReport`] for JSON output.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::transport::protocol::RpcError;
use crate::transport::supervisor::ExitInfo;

/// Failures while resolving or spawning the worker
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Script or executable does not exist
    #[error("worker not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// Interpreter could not be located on PATH
    #[error("interpreter not found: {program}")]
    InterpreterNotFound { program: String },

    /// Path exists but cannot be executed
    #[error("worker is not executable: {}", path.display())]
    NotExecutable { path: PathBuf },

    #[error("permission denied launching {program}: {source}")]
    PermissionDenied {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Any other OS-level spawn failure
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {0} pipe was not captured")]
    MissingPipe(&'static str),
}

impl LaunchError {
    pub fn code(&self) -> &'static str {
        match self {
            LaunchError::NotFound { .. } => "LAUNCH_NOT_FOUND",
            LaunchError::InterpreterNotFound { .. } => "LAUNCH_INTERPRETER_NOT_FOUND",
            LaunchError::NotExecutable { .. } => "LAUNCH_NOT_EXECUTABLE",
            LaunchError::PermissionDenied { .. } => "LAUNCH_PERMISSION_DENIED",
            LaunchError::Spawn { .. } => "LAUNCH_SPAWN_FAILED",
            LaunchError::MissingPipe(_) => "LAUNCH_PIPE_FAILED",
        }
    }

    /// Classify an OS error returned by `spawn`
    pub fn from_spawn(program: &str, via_interpreter: bool, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound if via_interpreter => LaunchError::InterpreterNotFound {
                program: program.to_string(),
            },
            std::io::ErrorKind::NotFound => LaunchError::NotFound {
                path: PathBuf::from(program),
            },
            std::io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied {
                program: program.to_string(),
                source,
            },
            _ => LaunchError::Spawn {
                program: program.to_string(),
                source,
            },
        }
    }
}

/// Failures surfaced by [`crate::client::RpcClient`]
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// No ready signal within the startup window and the worker died
    #[error("worker did not become ready within {}ms and {exit}", waited.as_millis())]
    StartupTimeout { waited: Duration, exit: ExitInfo },

    /// The worker exited before signalling readiness
    #[error("worker exited during startup: {exit}")]
    StartupExited { exit: ExitInfo },

    /// The worker answered with an error object
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("{method} timed out after {}ms", timeout.as_millis())]
    Timeout { method: String, timeout: Duration },

    /// The worker went away while the call was outstanding
    #[error("worker disconnected: {reason}")]
    Disconnected { reason: String },

    #[error("worker is not started")]
    NotStarted,

    #[error("failed to write to worker stdin: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ClientError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::Launch(e) => e.code(),
            ClientError::StartupTimeout { .. } => "STARTUP_TIMEOUT",
            ClientError::StartupExited { .. } => "STARTUP_EXITED",
            ClientError::Rpc(_) => "RPC_ERROR",
            ClientError::Timeout { .. } => "TIMEOUT",
            ClientError::Disconnected { .. } => "DISCONNECTED",
            ClientError::NotStarted => "NOT_STARTED",
            ClientError::Write(_) => "WRITE_FAILED",
            ClientError::Encode(_) => "ENCODE_FAILED",
        }
    }

    /// Whether retrying the same operation may succeed
    ///
    /// Only spawn failures caused by a busy executable qualify.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Launch(LaunchError::Spawn { source, .. })
            | ClientError::Launch(LaunchError::PermissionDenied { source, .. }) => {
                crate::transport::platform::is_transient_spawn_error(source)
            }
            _ => false,
        }
    }

    /// Structured detail for the report, when there is any
    fn data(&self) -> Option<Value> {
        match self {
            ClientError::Rpc(error) => Some(serde_json::json!({
                "code": error.code,
                "data": error.data,
            })),
            ClientError::Timeout { method, timeout } => Some(serde_json::json!({
                "method": method,
                "timeout_ms": timeout.as_millis() as u64,
            })),
            ClientError::StartupTimeout { exit, .. } | ClientError::StartupExited { exit } => {
                serde_json::to_value(exit).ok()
            }
            _ => None,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code().to_string(),
            message: self.to_string(),
            data: self.data(),
        }
    }
}

/// Serializable form of a [`ClientError`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorReport {
    /// Format as a JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}"}}"#,
                self.code,
                self.message.replace('"', "'")
            )
        })
    }
}

impl From<&ClientError> for ErrorReport {
    fn from(error: &ClientError) -> Self {
        error.report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exit(code: i32) -> ExitInfo {
        ExitInfo {
            code: Some(code),
            signal: None,
            requested: false,
        }
    }

    #[test]
    fn test_spawn_error_classification() {
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(matches!(
            LaunchError::from_spawn("python3", true, missing),
            LaunchError::InterpreterNotFound { .. }
        ));

        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(matches!(
            LaunchError::from_spawn("/opt/agent", false, missing),
            LaunchError::NotFound { .. }
        ));

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let err = LaunchError::from_spawn("/opt/agent", false, denied);
        assert_eq!(err.code(), "LAUNCH_PERMISSION_DENIED");

        let other = std::io::Error::from(std::io::ErrorKind::OutOfMemory);
        assert_eq!(
            LaunchError::from_spawn("/opt/agent", false, other).code(),
            "LAUNCH_SPAWN_FAILED"
        );
    }

    #[test]
    fn test_codes() {
        assert_eq!(ClientError::NotStarted.code(), "NOT_STARTED");
        assert_eq!(
            ClientError::from(LaunchError::NotFound {
                path: PathBuf::from("/x")
            })
            .code(),
            "LAUNCH_NOT_FOUND"
        );
        assert_eq!(
            ClientError::StartupExited { exit: exit(1) }.code(),
            "STARTUP_EXITED"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_transient_only_for_busy_executable() {
        let busy = ClientError::Launch(LaunchError::Spawn {
            program: "agent".into(),
            source: std::io::Error::from_raw_os_error(libc::ETXTBSY),
        });
        assert!(busy.is_transient());

        let missing = ClientError::Launch(LaunchError::NotFound {
            path: PathBuf::from("agent"),
        });
        assert!(!missing.is_transient());
        assert!(!ClientError::NotStarted.is_transient());
    }

    #[test]
    fn test_rpc_report_passes_error_through() {
        let err = ClientError::Rpc(
            RpcError::new(-32601, "Method not found: nope").with_data(json!({"hint": 1})),
        );
        let report = err.report();
        assert_eq!(report.code, "RPC_ERROR");
        assert!(report.message.contains("Method not found: nope"));
        assert_eq!(report.data, Some(json!({"code": -32601, "data": {"hint": 1}})));
    }

    #[test]
    fn test_timeout_report() {
        let err = ClientError::Timeout {
            method: "slow_echo".into(),
            timeout: Duration::from_millis(50),
        };
        assert_eq!(err.to_string(), "slow_echo timed out after 50ms");
        let json = err.report().to_json();
        assert!(json.contains("\"TIMEOUT\""));
        assert!(json.contains("\"timeout_ms\":50"));
    }

    #[test]
    fn test_report_without_data_omits_field() {
        let report = ErrorReport::from(&ClientError::NotStarted);
        assert_eq!(report.to_json(), r#"{"code":"NOT_STARTED","message":"worker is not started"}"#);
    }

    #[test]
    fn test_startup_timeout_message() {
        let err = ClientError::StartupTimeout {
            waited: Duration::from_millis(250),
            exit: exit(3),
        };
        let text = err.to_string();
        assert!(text.contains("250ms"));
        assert!(text.contains("code 3"));
    }
}
