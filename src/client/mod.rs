//! RPC client
//!
//! The public face of the transport. One client owns at most one worker at
//! a time; `start` is idempotent and concurrent starts share one spawn.

mod batch;

pub use batch::{BatchItem, BatchMode, BatchOutcome, BatchResult};

use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::ClientOptions;
use crate::error::ClientError;
use crate::events::{ClientEvent, EventBus, SubscriptionHandle};
use crate::transport::resolver::{ExecutableResolver, LocalResolver};
use crate::transport::supervisor::{ErrorSlot, Worker, WorkerState};

/// Method used for health checks
pub const PING_METHOD: &str = "ping";

/// Snapshot of the client's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClientStatus {
    /// A worker process is attached and accepting calls
    pub connected: bool,
    /// The worker finished startup (and answered a ping, for `check_health`)
    pub ready: bool,
    pub state: WorkerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// JSON-RPC client for one supervised worker
pub struct RpcClient {
    options: ClientOptions,
    resolver: Arc<dyn ExecutableResolver>,
    events: EventBus,
    last_error: ErrorSlot,
    /// Serializes start and stop
    lifecycle: tokio::sync::Mutex<()>,
    worker: Mutex<Option<Arc<Worker>>>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("launch", &self.options.launch)
            .field("worker", &self.current())
            .finish()
    }
}

impl RpcClient {
    pub fn new(options: ClientOptions) -> Self {
        Self::with_resolver(options, LocalResolver)
    }

    /// Use a custom executable resolver
    pub fn with_resolver(options: ClientOptions, resolver: impl ExecutableResolver + 'static) -> Self {
        Self {
            options,
            resolver: Arc::new(resolver),
            events: EventBus::new(),
            last_error: ErrorSlot::default(),
            lifecycle: tokio::sync::Mutex::new(()),
            worker: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn current(&self) -> Option<Arc<Worker>> {
        self.worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn replace_current(&self, worker: Arc<Worker>) {
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(worker);
    }

    /// The worker, if one is attached and accepting calls
    fn attached(&self) -> Result<Arc<Worker>, ClientError> {
        match self.current() {
            Some(worker) if worker.state().accepts_calls() => Ok(worker),
            _ => Err(ClientError::NotStarted),
        }
    }

    /// Launch the worker and wait until it is ready
    ///
    /// A no-op when a worker is already running. A caller arriving while
    /// another start is in flight waits for it and shares its worker.
    pub async fn start(&self) -> Result<(), ClientError> {
        let _lifecycle = self.lifecycle.lock().await;
        if let Some(worker) = self.current() {
            if worker.state().accepts_calls() {
                tracing::debug!(pid = worker.pid(), "worker already started");
                return Ok(());
            }
        }

        let policy = self.options.retry.clone();
        let result = policy
            .run(|attempt| self.start_once(attempt), ClientError::is_transient)
            .await;

        if let Err(e) = &result {
            self.last_error.set(e.to_string());
            if let ClientError::Launch(_) = e {
                self.events.emit(ClientEvent::Error {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn start_once(&self, attempt: u32) -> Result<(), ClientError> {
        let command = self.resolver.resolve(&self.options)?;
        tracing::debug!(attempt, command = %command.display(), "starting worker");

        let worker = Arc::new(Worker::spawn(
            &command,
            &self.options,
            self.events.clone(),
            self.last_error.clone(),
        )?);
        self.replace_current(Arc::clone(&worker));

        worker.wait_ready(self.options.startup_timeout).await
    }

    /// Call `method` with the default call timeout
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        self.call_with_timeout(method, params, self.options.call_timeout)
            .await
    }

    /// Call `method`, giving up after `timeout`
    ///
    /// A late response after the timeout is discarded.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let worker = self.attached()?;
        worker.request(method, params, timeout).await
    }

    /// Send a notification; nothing is awaited beyond the write
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let worker = self.attached()?;
        worker.notify(method, params).await
    }

    /// Stop the worker if there is one
    ///
    /// Always succeeds; returns once the process exit has been observed.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.current() {
            Some(worker) if worker.is_alive() => {
                let exit = worker.stop().await;
                tracing::debug!(%exit, "worker stop complete");
            }
            _ => tracing::debug!("stop requested with no running worker"),
        }
        Ok(())
    }

    /// Health-check call with the short ping timeout
    pub async fn ping(&self) -> Result<Value, ClientError> {
        self.call_with_timeout(PING_METHOD, None, self.options.ping_timeout)
            .await
    }

    /// Status derived from the worker's state alone
    pub fn status(&self) -> ClientStatus {
        let state = self.state();
        ClientStatus {
            connected: state.accepts_calls(),
            ready: state == WorkerState::Ready,
            state,
            pid: self.pid(),
        }
    }

    /// Status refined by a live ping
    ///
    /// A worker that is running but does not answer is reported as
    /// connected and not ready.
    pub async fn check_health(&self) -> ClientStatus {
        let mut status = self.status();
        if !status.connected {
            return status;
        }
        match self.ping().await {
            Ok(_) => status.ready = true,
            Err(e) => {
                tracing::warn!(error = %e, "health check failed");
                self.last_error.set(e.to_string());
                status.ready = false;
            }
        }
        status
    }

    pub fn state(&self) -> WorkerState {
        self.current()
            .map(|worker| worker.state())
            .unwrap_or(WorkerState::NotStarted)
    }

    /// Pid of the live worker
    pub fn pid(&self) -> Option<u32> {
        self.current()
            .filter(|worker| worker.is_alive())
            .and_then(|worker| worker.pid())
    }

    /// Last error reported by the worker or seen on its process
    pub fn last_error(&self) -> Option<String> {
        self.last_error.get()
    }

    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(event, handler)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.events.unsubscribe(handle)
    }
}
