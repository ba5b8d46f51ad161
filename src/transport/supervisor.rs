//! Worker process supervisor
//!
//! Owns one spawned worker and its stdio:
//! - stdin: serialized writer, ids assigned under the write lock so the
//!   wire order matches the id order
//! - stdout: a single reader task feeding the framer and dispatching to
//!   the pending-call table and the event bus
//! - stderr: a line reader that logs and republishes as `stderr` events
//! - exit: a waiter task that owns the child, drains the reader, settles
//!   the final state, fails outstanding calls and publishes `exit`
//!
//! Dropping a [`Worker`] kills the process.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::framer::MessageDecoder;
use super::pending::{deadline_after, PendingCalls};
use super::platform::{send_terminate, LineEnding, Termination};
use super::protocol::{
    encode_line, MalformedMessage, Message, Notification, Request, RequestId, Response,
};
use super::resolver::ResolvedCommand;
use crate::config::ClientOptions;
use crate::error::{ClientError, LaunchError};
use crate::events::{ClientEvent, EventBus};

/// How long the waiter lets the reader drain after the process exits
const READER_DRAIN: Duration = Duration::from_millis(250);

/// How long a stop waits for in-flight writes before closing stdin anyway
const WRITER_RELEASE: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 8192;

/// Lifecycle of one client's worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    NotStarted,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Crashed,
}

impl WorkerState {
    /// States in which calls are accepted
    pub fn accepts_calls(&self) -> bool {
        matches!(self, WorkerState::Starting | WorkerState::Ready)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Crashed)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::NotStarted => "not_started",
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// How the worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// True when the exit followed a stop request
    pub requested: bool,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus, requested: bool) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            requested,
        }
    }

    /// Exit whose status could not be observed
    pub fn unknown(requested: bool) -> Self {
        Self {
            code: None,
            signal: None,
            requested,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {}", code),
            (None, Some(signal)) => write!(f, "was killed by signal {}", signal),
            (None, None) => f.write_str("exited"),
        }
    }
}

/// Shared, lock-protected worker state
#[derive(Debug, Clone)]
pub(crate) struct StateCell(Arc<Mutex<WorkerState>>);

impl StateCell {
    fn new(state: WorkerState) -> Self {
        StateCell(Arc::new(Mutex::new(state)))
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn get(&self) -> WorkerState {
        *self.lock()
    }

    fn set(&self, state: WorkerState) {
        *self.lock() = state;
    }

    /// Enter `Stopping` unless the exit has already been settled
    fn begin_stopping(&self) -> bool {
        let mut current = self.lock();
        if current.is_terminal() {
            false
        } else {
            *current = WorkerState::Stopping;
            true
        }
    }

    /// Move to `to` only if currently `from`
    fn transition(&self, from: WorkerState, to: WorkerState) -> bool {
        let mut current = self.lock();
        if *current == from {
            *current = to;
            true
        } else {
            false
        }
    }
}

/// Last error reported by the worker or observed on its process
#[derive(Debug, Clone, Default)]
pub(crate) struct ErrorSlot(Arc<Mutex<Option<String>>>);

impl ErrorSlot {
    pub(crate) fn set(&self, message: impl Into<String>) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }

    pub(crate) fn get(&self) -> Option<String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

struct Writer {
    stdin: Option<ChildStdin>,
    next_id: i64,
}

/// A running (or exited) worker process
pub struct Worker {
    pid: Option<u32>,
    state: StateCell,
    writer: tokio::sync::Mutex<Writer>,
    pending: PendingCalls,
    line_ending: LineEnding,
    termination: Termination,
    shutdown_grace: Duration,
    /// Bound on a notification's wait for stdin
    write_timeout: Duration,
    ready_rx: watch::Receiver<bool>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: mpsc::Sender<()>,
    stop_requested: Arc<AtomicBool>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.pid)
            .field("state", &self.state.get())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Worker {
    /// Spawn the resolved command and start its stdio tasks
    ///
    /// The worker starts in `Starting`; call [`Worker::wait_ready`] next.
    pub(crate) fn spawn(
        command: &ResolvedCommand,
        options: &ClientOptions,
        events: EventBus,
        last_error: ErrorSlot,
    ) -> Result<Self, LaunchError> {
        let program = command.program.to_string_lossy().into_owned();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| LaunchError::from_spawn(&program, command.via_interpreter, e))?;

        let stdin = child.stdin.take().ok_or(LaunchError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(LaunchError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(LaunchError::MissingPipe("stderr"))?;
        let pid = child.id();

        tracing::info!(pid, command = %command.display(), "worker spawned");

        let state = StateCell::new(WorkerState::Starting);
        let pending = PendingCalls::new();
        let (ready_tx, ready_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let stop_requested = Arc::new(AtomicBool::new(false));

        let dispatcher = Dispatcher {
            pending: pending.clone(),
            events: events.clone(),
            last_error: last_error.clone(),
            ready_method: options.ready_method.clone(),
            ready_tx,
        };
        let reader = tokio::spawn(read_stdout(stdout, dispatcher));
        tokio::spawn(read_stderr(stderr, events.clone()));
        tokio::spawn(supervise(
            child,
            kill_rx,
            reader,
            ExitContext {
                state: state.clone(),
                pending: pending.clone(),
                events,
                last_error,
                stop_requested: Arc::clone(&stop_requested),
                exit_tx,
            },
        ));

        Ok(Self {
            pid,
            state,
            writer: tokio::sync::Mutex::new(Writer {
                stdin: Some(stdin),
                next_id: 0,
            }),
            pending,
            line_ending: options.platform.line_ending,
            termination: options.platform.termination,
            shutdown_grace: options.shutdown_grace,
            write_timeout: options.call_timeout,
            ready_rx,
            exit_rx,
            kill_tx,
            stop_requested,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.exit_info().is_none()
    }

    /// Number of calls waiting on a response
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Wait for the ready notification, the process exit, or the timeout
    ///
    /// A timeout with the process still running counts as success: a slow
    /// worker is left alone and later calls surface real failures.
    pub(crate) async fn wait_ready(&self, timeout: Duration) -> Result<(), ClientError> {
        enum Startup {
            Ready,
            Exited(ExitInfo),
            TimedOut,
        }

        let mut ready = self.ready_rx.clone();
        let ready_seen = async move {
            let closed = ready.wait_for(|r| *r).await.is_err();
            if closed {
                // stdout closed without a ready signal; the exit branch decides
                std::future::pending::<()>().await;
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = ready_seen => Startup::Ready,
            info = wait_exit(self.exit_rx.clone(), false) => Startup::Exited(info),
            _ = tokio::time::sleep(timeout) => Startup::TimedOut,
        };

        match outcome {
            Startup::Ready => {
                if self.state.transition(WorkerState::Starting, WorkerState::Ready) {
                    tracing::info!(pid = self.pid, "worker ready");
                    return Ok(());
                }
                match self.exit_info() {
                    Some(exit) => Err(ClientError::StartupExited { exit }),
                    None => Err(ClientError::Disconnected {
                        reason: "worker stopped during startup".to_string(),
                    }),
                }
            }
            Startup::Exited(exit) => {
                tracing::warn!(pid = self.pid, %exit, "worker exited during startup");
                Err(ClientError::StartupExited { exit })
            }
            Startup::TimedOut => match self.exit_info() {
                None => {
                    tracing::warn!(
                        pid = self.pid,
                        timeout_ms = timeout.as_millis() as u64,
                        "no ready signal, worker still running; continuing"
                    );
                    self.state.transition(WorkerState::Starting, WorkerState::Ready);
                    Ok(())
                }
                Some(exit) => Err(ClientError::StartupTimeout {
                    waited: timeout,
                    exit,
                }),
            },
        }
    }

    /// Send a request and wait for its response
    ///
    /// The timeout covers the wait for stdin, the write and the response.
    pub(crate) async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let deadline = deadline_after(timeout);
        let timed_out = || ClientError::Timeout {
            method: method.to_string(),
            timeout,
        };

        let waiter = {
            let mut guard = tokio::time::timeout_at(deadline, self.writer.lock())
                .await
                .map_err(|_| timed_out())?;
            let writer = &mut *guard;
            writer.next_id += 1;
            let id = RequestId::Number(writer.next_id);
            if writer.stdin.is_none() {
                return Err(stdin_closed());
            }

            let line = encode_line(&Request::new(id.clone(), method, params), self.line_ending)?;
            let waiter = self.pending.register_until(id, method, timeout, deadline)?;
            // On failure the waiter is dropped, which removes the entry
            self.write_until(writer, &line, deadline)
                .await
                .map_err(|e| e.unwrap_or_else(timed_out))?;
            tracing::trace!(id = %waiter.id(), method, "request sent");
            waiter
        };
        waiter.wait().await
    }

    /// Write a notification; no response is expected
    pub(crate) async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let timeout = self.write_timeout;
        let deadline = deadline_after(timeout);
        let timed_out = || ClientError::Timeout {
            method: method.to_string(),
            timeout,
        };

        let line = encode_line(&Notification::new(method, params), self.line_ending)?;
        let mut guard = tokio::time::timeout_at(deadline, self.writer.lock())
            .await
            .map_err(|_| timed_out())?;
        self.write_until(&mut guard, &line, deadline)
            .await
            .map_err(|e| e.unwrap_or_else(timed_out))
    }

    /// Write one line before `deadline`
    ///
    /// `Err(None)` means the deadline passed mid-write. Part of the line may
    /// already be on the wire, so stdin is closed and the worker killed.
    async fn write_until(
        &self,
        writer: &mut Writer,
        line: &[u8],
        deadline: tokio::time::Instant,
    ) -> Result<(), Option<ClientError>> {
        let stdin = writer.stdin.as_mut().ok_or_else(|| Some(stdin_closed()))?;
        let written = tokio::time::timeout_at(deadline, write_line(stdin, line)).await;
        match written {
            Ok(result) => result.map_err(Some),
            Err(_) => {
                tracing::warn!(pid = self.pid, "worker stopped reading stdin, killing it");
                drop(writer.stdin.take());
                self.kill();
                Err(None)
            }
        }
    }

    /// Stop the worker, escalating to a kill after the grace period
    ///
    /// Resolves only once the exit has actually been observed.
    pub(crate) async fn stop(&self) -> ExitInfo {
        if let Some(info) = self.exit_info() {
            return info;
        }

        self.stop_requested.store(true, Ordering::SeqCst);
        self.state.begin_stopping();
        tracing::info!(pid = self.pid, "stopping worker");

        // Closing stdin is the worker's cue to exit on its own
        match tokio::time::timeout(WRITER_RELEASE, self.writer.lock()).await {
            Ok(mut writer) => drop(writer.stdin.take()),
            Err(_) => tracing::debug!(pid = self.pid, "stdin busy, not closing before terminate"),
        }

        if self.termination == Termination::SignalThenKill && self.is_alive() {
            if let Some(pid) = self.pid {
                if send_terminate(pid) {
                    tracing::debug!(pid, "sent SIGTERM");
                }
            }
        }

        let graceful =
            tokio::time::timeout(self.shutdown_grace, wait_exit(self.exit_rx.clone(), true)).await;
        match graceful {
            Ok(info) => info,
            Err(_) => {
                tracing::warn!(
                    pid = self.pid,
                    grace_ms = self.shutdown_grace.as_millis() as u64,
                    "worker did not exit within grace period, killing"
                );
                self.kill();
                wait_exit(self.exit_rx.clone(), true).await
            }
        }
    }

    /// Ask the waiter to kill the process now
    pub(crate) fn kill(&self) {
        // A full channel means a kill is already queued
        let _ = self.kill_tx.try_send(());
    }
}

fn stdin_closed() -> ClientError {
    ClientError::Disconnected {
        reason: "worker stdin is closed".to_string(),
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &[u8]) -> Result<(), ClientError> {
    let result = async {
        stdin.write_all(line).await?;
        stdin.flush().await
    }
    .await;
    result.map_err(|e| match e.kind() {
        std::io::ErrorKind::BrokenPipe => ClientError::Disconnected {
            reason: "worker closed its stdin".to_string(),
        },
        _ => ClientError::Write(e),
    })
}

/// Resolve with the exit once the waiter has published it
async fn wait_exit(mut exit_rx: watch::Receiver<Option<ExitInfo>>, requested: bool) -> ExitInfo {
    exit_rx
        .wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|info| *info)
        .unwrap_or_else(|| ExitInfo::unknown(requested))
}

/// Routes decoded stdout messages
struct Dispatcher {
    pending: PendingCalls,
    events: EventBus,
    last_error: ErrorSlot,
    ready_method: String,
    ready_tx: watch::Sender<bool>,
}

impl Dispatcher {
    fn dispatch(&self, item: Result<Message, MalformedMessage>) {
        match item {
            Ok(Message::Response(response)) => self.on_response(response),
            Ok(Message::Notification(notification)) => self.on_notification(notification),
            Ok(Message::Request(request)) => {
                tracing::warn!(
                    method = %request.method,
                    id = %request.id,
                    "worker sent a request; host does not serve requests"
                );
                self.events.emit(ClientEvent::Error {
                    message: format!(
                        "unexpected request from worker: {} (id {})",
                        request.method, request.id
                    ),
                });
            }
            Err(malformed) => {
                tracing::warn!(error = %malformed, "skipping malformed line from worker");
                self.events.emit(ClientEvent::Malformed {
                    line: malformed.line().map(str::to_string),
                    reason: malformed.to_string(),
                });
            }
        }
    }

    fn on_response(&self, response: Response) {
        let id = match response.id {
            Some(id) => id,
            None => {
                tracing::warn!(outcome = ?response.outcome, "response without id ignored");
                return;
            }
        };
        let delivered = match response.outcome {
            Ok(result) => self.pending.resolve(&id, result),
            Err(error) => self.pending.reject(&id, error),
        };
        if !delivered {
            tracing::debug!(id = %id, "response for unknown or expired id ignored");
        }
    }

    fn on_notification(&self, notification: Notification) {
        if notification.method == self.ready_method {
            self.ready_tx.send_replace(true);
        }
        if let Some(message) = notification.error_message() {
            tracing::warn!(method = %notification.method, error = %message, "worker reported an error");
            self.last_error.set(message);
        }
        self.events.emit(ClientEvent::Notification {
            method: notification.method,
            params: notification.params,
        });
    }
}

async fn read_stdout(mut stdout: ChildStdout, dispatcher: Dispatcher) {
    let mut decoder = MessageDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for item in decoder.feed(&buf[..n]) {
                    dispatcher.dispatch(item);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read worker stdout");
                break;
            }
        }
    }
    if let Some(item) = decoder.finish() {
        dispatcher.dispatch(item);
    }
    tracing::debug!("worker stdout closed");
}

async fn read_stderr(stderr: ChildStderr, events: EventBus) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line).trim_end().to_string();
                if text.is_empty() {
                    continue;
                }
                tracing::debug!(target: "agentlink::worker_stderr", "{}", text);
                events.emit(ClientEvent::Stderr { line: text });
            }
            Err(e) => {
                tracing::debug!(error = %e, "failed to read worker stderr");
                break;
            }
        }
    }
}

struct ExitContext {
    state: StateCell,
    pending: PendingCalls,
    events: EventBus,
    last_error: ErrorSlot,
    stop_requested: Arc<AtomicBool>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
}

/// Own the child until it exits, then settle everything that depends on it
async fn supervise(
    mut child: Child,
    mut kill_rx: mpsc::Receiver<()>,
    reader: JoinHandle<()>,
    ctx: ExitContext,
) {
    let mut handle_dropped = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = kill_rx.recv(), if !handle_dropped => {
                // No sender left means the Worker itself is gone
                handle_dropped = request.is_none();
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "failed to kill worker");
                }
            }
        }
    };

    let requested = ctx.stop_requested.load(Ordering::SeqCst);
    let info = match status {
        Ok(status) => ExitInfo::from_status(status, requested),
        Err(e) => {
            tracing::warn!(error = %e, "failed to observe worker exit status");
            ExitInfo::unknown(requested)
        }
    };

    // Responses written just before exit must reach their callers first
    let abort = reader.abort_handle();
    if tokio::time::timeout(READER_DRAIN, reader).await.is_err() {
        tracing::debug!("worker stdout still open after exit, abandoning reader");
        abort.abort();
    }

    let clean = requested || info.success();
    ctx.state.set(if clean {
        WorkerState::Stopped
    } else {
        WorkerState::Crashed
    });

    let reason = format!("worker {}", info);
    if !clean {
        ctx.last_error.set(reason.clone());
    }
    let rejected = ctx.pending.reject_all(reason.clone());
    if clean {
        tracing::info!(%info, rejected, "worker stopped");
    } else {
        tracing::warn!(%info, rejected, "worker exited unexpectedly");
        ctx.events.emit(ClientEvent::Error { message: reason });
    }

    ctx.events.emit(ClientEvent::Exit(info));
    ctx.exit_tx.send_replace(Some(info));
}
