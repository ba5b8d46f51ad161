//! Client configuration
//!
//! [`ClientOptions`] is what the client is constructed with. It can be
//! built in code with the `with_*` methods, or sourced from `~/.agentlinkrc`
//! and `AGENTLINK_*` environment variables through [`Settings`]:
//! - AGENTLINK_INTERPRETER / AGENTLINK_SCRIPT (interpreter mode)
//! - AGENTLINK_EXECUTABLE (direct executable, wins over a script)
//! - AGENTLINK_ARGS (shell-word split extra worker args)
//! - AGENTLINK_DEBUG (1/true/yes/on)
//! - AGENTLINK_STARTUP_TIMEOUT_MS, AGENTLINK_CALL_TIMEOUT_MS,
//!   AGENTLINK_PING_TIMEOUT_MS, AGENTLINK_SHUTDOWN_GRACE_MS
//! - AGENTLINK_LINE_ENDING (lf, crlf)
//! - AGENTLINK_START_RETRIES (total startup attempts)
//! - AGENTLINK_READY_METHOD
//! - AGENTLINK_ENV_<NAME>=value (extra worker environment)

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::transport::platform::{LineEnding, PlatformProfile};
use crate::transport::protocol::DEFAULT_READY_METHOD;
use crate::transport::resolver::LaunchSpec;
use crate::transport::retry::RetryPolicy;

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Interpreter used when only a script is configured
pub const DEFAULT_INTERPRETER: &str = if cfg!(windows) { "python" } else { "python3" };

const PREFIX: &str = "AGENTLINK_";
const ENV_PREFIX: &str = "AGENTLINK_ENV_";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("no worker configured (set AGENTLINK_SCRIPT or AGENTLINK_EXECUTABLE)")]
    MissingLaunch,
}

/// Everything needed to launch and talk to one worker
///
/// Immutable once handed to the client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub launch: LaunchSpec,
    /// Extra arguments appended after the script/executable
    pub worker_args: Vec<String>,
    /// Appends `--debug` to the worker arguments
    pub debug: bool,
    pub startup_timeout: Duration,
    /// Default per-call timeout
    pub call_timeout: Duration,
    /// Timeout for health-check pings
    pub ping_timeout: Duration,
    /// How long a stop waits before forcing a kill
    pub shutdown_grace: Duration,
    /// Extra worker environment, on top of the inherited one
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Notification that marks the end of worker startup
    pub ready_method: String,
    pub retry: RetryPolicy,
    pub platform: PlatformProfile,
}

impl ClientOptions {
    pub fn new(launch: LaunchSpec) -> Self {
        let mut env = BTreeMap::new();
        // Keep a Python worker's stdio UTF-8 and unbuffered
        env.insert("PYTHONIOENCODING".to_string(), "utf-8".to_string());
        env.insert("PYTHONUTF8".to_string(), "1".to_string());
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

        Self {
            launch,
            worker_args: Vec::new(),
            debug: false,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            env,
            working_dir: None,
            ready_method: DEFAULT_READY_METHOD.to_string(),
            retry: RetryPolicy::none(),
            platform: PlatformProfile::current(),
        }
    }

    /// Run `script` through `interpreter`
    pub fn interpreter(interpreter: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self::new(LaunchSpec::interpreter(interpreter, script))
    }

    /// Run a self-contained executable
    pub fn executable(path: impl Into<PathBuf>) -> Self {
        Self::new(LaunchSpec::executable(path))
    }

    pub fn with_worker_args(mut self, args: Vec<String>) -> Self {
        self.worker_args = args;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_ready_method(mut self, method: impl Into<String>) -> Self {
        self.ready_method = method.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_platform(mut self, platform: PlatformProfile) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_line_ending(mut self, line_ending: LineEnding) -> Self {
        self.platform = self.platform.with_line_ending(line_ending);
        self
    }
}

/// Raw `AGENTLINK_*` key/value pairs from the rc file and environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

impl Settings {
    /// Path to `~/.agentlinkrc`
    pub fn rc_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".agentlinkrc")
    }

    /// Parse rc-file content (`KEY=value`, `export`, `#` comments, quotes)
    pub fn parse(content: &str) -> Self {
        let mut settings = Settings::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);
            if let Some((key, value)) = parse_assignment(line) {
                if key.starts_with(PREFIX) {
                    settings.values.insert(key, unquote(&value));
                }
            }
        }

        settings
    }

    /// Collect `AGENTLINK_*` pairs from an iterator of variables
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| k.starts_with(PREFIX))
            .collect();
        Settings { values }
    }

    /// Collect `AGENTLINK_*` pairs from the process environment
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Read an rc file; a missing file yields empty settings
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Rc file (default `~/.agentlinkrc`) overridden by the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_file(&Self::rc_path())?,
        };
        Ok(file.merge(Self::from_env()))
    }

    /// Overlay `other` on top of `self`
    pub fn merge(mut self, other: Settings) -> Self {
        self.values.extend(other.values);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Build client options, validating every recognized key
    pub fn to_options(&self) -> Result<ClientOptions, ConfigError> {
        let launch = if let Some(path) = self.non_empty("AGENTLINK_EXECUTABLE") {
            LaunchSpec::executable(path)
        } else if let Some(script) = self.non_empty("AGENTLINK_SCRIPT") {
            let interpreter = self
                .non_empty("AGENTLINK_INTERPRETER")
                .unwrap_or(DEFAULT_INTERPRETER);
            LaunchSpec::interpreter(interpreter, script)
        } else {
            return Err(ConfigError::MissingLaunch);
        };

        let mut options = ClientOptions::new(launch);

        if let Some(args) = self.get("AGENTLINK_ARGS") {
            options.worker_args =
                shell_words::split(args).map_err(|e| invalid("AGENTLINK_ARGS", args, e))?;
        }
        if let Some(debug) = self.get("AGENTLINK_DEBUG") {
            options.debug = parse_bool("AGENTLINK_DEBUG", debug)?;
        }
        if let Some(t) = self.millis("AGENTLINK_STARTUP_TIMEOUT_MS")? {
            options.startup_timeout = t;
        }
        if let Some(t) = self.millis("AGENTLINK_CALL_TIMEOUT_MS")? {
            options.call_timeout = t;
        }
        if let Some(t) = self.millis("AGENTLINK_PING_TIMEOUT_MS")? {
            options.ping_timeout = t;
        }
        if let Some(t) = self.millis("AGENTLINK_SHUTDOWN_GRACE_MS")? {
            options.shutdown_grace = t;
        }
        if let Some(ending) = self.get("AGENTLINK_LINE_ENDING") {
            let ending: LineEnding = ending
                .parse()
                .map_err(|e| invalid("AGENTLINK_LINE_ENDING", ending, e))?;
            options = options.with_line_ending(ending);
        }
        if let Some(retries) = self.get("AGENTLINK_START_RETRIES") {
            let attempts: u32 = retries
                .trim()
                .parse()
                .map_err(|e| invalid("AGENTLINK_START_RETRIES", retries, e))?;
            if attempts > 1 {
                options.retry = RetryPolicy::transient_launch().with_max_attempts(attempts);
            }
        }
        if let Some(method) = self.non_empty("AGENTLINK_READY_METHOD") {
            options.ready_method = method.to_string();
        }

        for (key, value) in &self.values {
            if let Some(name) = key.strip_prefix(ENV_PREFIX) {
                if !name.is_empty() {
                    options.env.insert(name.to_string(), value.clone());
                }
            }
        }

        Ok(options)
    }

    fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|v| !v.is_empty())
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(|ms| Some(Duration::from_millis(ms)))
                .map_err(|e| invalid(key, raw, e)),
        }
    }
}

fn invalid(key: &str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let value = line[eq_pos + 1..].trim().to_string();

    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key, value))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}
