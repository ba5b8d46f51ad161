//! Worker command resolution
//!
//! Turns the configured launch spec into the concrete program and
//! arguments to spawn. Hosts with their own discovery rules (bundled
//! resources, interpreter probing) plug in through [`ExecutableResolver`].

use std::path::{Path, PathBuf};

use crate::config::ClientOptions;
use crate::error::LaunchError;

/// What to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchSpec {
    /// Run a script through an interpreter (`python3 agent.py`)
    Interpreter {
        interpreter: String,
        script: PathBuf,
    },
    /// Run a self-contained executable
    Executable { path: PathBuf },
}

impl LaunchSpec {
    pub fn interpreter(interpreter: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        LaunchSpec::Interpreter {
            interpreter: interpreter.into(),
            script: script.into(),
        }
    }

    pub fn executable(path: impl Into<PathBuf>) -> Self {
        LaunchSpec::Executable { path: path.into() }
    }
}

/// Fully resolved command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// True when `program` is an interpreter looked up on PATH
    pub via_interpreter: bool,
}

impl ResolvedCommand {
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Resolves a launch spec into a command, or explains why it cannot
pub trait ExecutableResolver: Send + Sync {
    fn resolve(&self, options: &ClientOptions) -> Result<ResolvedCommand, LaunchError>;
}

/// Resolver that checks the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalResolver;

impl ExecutableResolver for LocalResolver {
    fn resolve(&self, options: &ClientOptions) -> Result<ResolvedCommand, LaunchError> {
        let (program, mut args, via_interpreter) = match &options.launch {
            LaunchSpec::Interpreter {
                interpreter,
                script,
            } => {
                if !script.exists() {
                    return Err(LaunchError::NotFound {
                        path: script.clone(),
                    });
                }
                (
                    PathBuf::from(interpreter),
                    vec![script.to_string_lossy().into_owned()],
                    true,
                )
            }
            LaunchSpec::Executable { path } => {
                let found = find_executable(path, options.platform.executable_suffix)?;
                (found, Vec::new(), false)
            }
        };

        args.extend(options.worker_args.iter().cloned());
        if options.debug {
            args.push("--debug".to_string());
        }

        Ok(ResolvedCommand {
            program,
            args,
            via_interpreter,
        })
    }
}

/// Locate a direct executable, trying the platform suffix as a fallback
fn find_executable(path: &Path, suffix: &str) -> Result<PathBuf, LaunchError> {
    let mut candidates = vec![path.to_path_buf()];
    if !suffix.is_empty() && !path.to_string_lossy().ends_with(suffix) {
        let mut with_suffix = path.as_os_str().to_owned();
        with_suffix.push(suffix);
        candidates.push(PathBuf::from(with_suffix));
    }

    let found = candidates
        .into_iter()
        .find(|candidate| candidate.exists())
        .ok_or_else(|| LaunchError::NotFound {
            path: path.to_path_buf(),
        })?;

    if !found.is_file() || !is_executable(&found) {
        return Err(LaunchError::NotExecutable { path: found });
    }
    Ok(found)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}
