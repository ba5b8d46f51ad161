//! Pending-call table
//!
//! Maps an outstanding request id to the caller waiting on it. Every entry
//! leaves the table exactly once, through one of:
//! - [`PendingCalls::resolve`] / [`PendingCalls::reject`] (response arrived)
//! - the caller's own deadline in [`ResponseWaiter::wait`]
//! - [`PendingCalls::reject_all`] (worker exited)
//!
//! Removal and delivery happen under the same lock, so a response racing a
//! deadline has exactly one winner and the loser is a no-op.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use super::protocol::{RequestId, RpcError};
use crate::error::ClientError;

/// Why a pending call finished without a result
#[derive(Debug, Clone, PartialEq)]
pub enum CallFailure {
    Rpc(RpcError),
    Disconnected(String),
}

type Outcome = Result<Value, CallFailure>;

/// Longest wait a deadline is allowed to express
pub const MAX_TIMEOUT: Duration = Duration::from_secs(86400 * 365 * 30);

/// Deadline `timeout` from now, clamped so it never overflows
pub fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    tokio::time::Instant::now() + timeout.min(MAX_TIMEOUT)
}

/// One outstanding request
#[derive(Debug)]
struct PendingCall {
    method: String,
    created_at: Instant,
    deadline: Instant,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Debug, Default)]
struct Table {
    calls: HashMap<RequestId, PendingCall>,
    /// Set by `reject_all`; later registrations fail immediately
    closed: Option<String>,
}

/// Shared handle to the table of one worker connection
#[derive(Debug, Clone, Default)]
pub struct PendingCalls {
    inner: Arc<Mutex<Table>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // A panic while holding this lock cannot leave the map half-updated,
        // so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `id` and return the future side of the call
    ///
    /// Fails with `Disconnected` once the connection has been torn down.
    pub fn register(
        &self,
        id: RequestId,
        method: impl Into<String>,
        timeout: Duration,
    ) -> Result<ResponseWaiter, ClientError> {
        self.register_until(id, method, timeout, deadline_after(timeout))
    }

    /// Register `id` against a deadline the caller already started counting
    pub fn register_until(
        &self,
        id: RequestId,
        method: impl Into<String>,
        timeout: Duration,
        deadline: tokio::time::Instant,
    ) -> Result<ResponseWaiter, ClientError> {
        let method = method.into();
        let mut table = self.lock();
        if let Some(reason) = &table.closed {
            return Err(ClientError::Disconnected {
                reason: reason.clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        table.calls.insert(
            id.clone(),
            PendingCall {
                method: method.clone(),
                created_at: Instant::now(),
                deadline: deadline.into_std(),
                tx,
            },
        );

        Ok(ResponseWaiter {
            id,
            method,
            timeout,
            deadline,
            rx,
            table: self.clone(),
        })
    }

    /// Fulfil the call waiting on `id`
    ///
    /// Unknown ids (late, duplicate or already timed out) are ignored.
    /// Returns whether a caller was waiting.
    pub fn resolve(&self, id: &RequestId, result: Value) -> bool {
        self.complete(id, Ok(result))
    }

    /// Fail the call waiting on `id` with the worker's error
    pub fn reject(&self, id: &RequestId, error: RpcError) -> bool {
        self.complete(id, Err(CallFailure::Rpc(error)))
    }

    fn complete(&self, id: &RequestId, outcome: Outcome) -> bool {
        let mut table = self.lock();
        match table.calls.remove(id) {
            Some(call) => {
                tracing::trace!(
                    id = %id,
                    method = %call.method,
                    elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                    past_deadline = Instant::now() > call.deadline,
                    "pending call completed"
                );
                // The receiver may be gone if the caller was dropped.
                let _ = call.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding call and refuse new ones
    ///
    /// Returns how many calls were rejected.
    pub fn reject_all(&self, reason: impl Into<String>) -> usize {
        let reason = reason.into();
        let mut table = self.lock();
        table.closed = Some(reason.clone());
        let calls: Vec<_> = table.calls.drain().collect();
        let count = calls.len();
        for (_, call) in calls {
            let _ = call.tx.send(Err(CallFailure::Disconnected(reason.clone())));
        }
        count
    }

    /// Remove `id` without completing it (e.g. the write failed)
    pub fn remove(&self, id: &RequestId) -> bool {
        self.lock().calls.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Claim `id` for the timeout path
    fn expire(&self, id: &RequestId) -> bool {
        self.lock().calls.remove(id).is_some()
    }
}

/// The caller's side of a registered call
#[derive(Debug)]
pub struct ResponseWaiter {
    id: RequestId,
    method: String,
    timeout: Duration,
    deadline: tokio::time::Instant,
    rx: oneshot::Receiver<Outcome>,
    table: PendingCalls,
}

impl ResponseWaiter {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the response, the deadline, or a disconnect
    pub async fn wait(mut self) -> Result<Value, ClientError> {
        let method = std::mem::take(&mut self.method);
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome.map_err(Into::into),
            Ok(Err(_)) => Err(ClientError::Disconnected {
                reason: "pending call dropped".to_string(),
            }),
            Err(_) => {
                if self.table.expire(&self.id) {
                    tracing::warn!(
                        id = %self.id,
                        method = %method,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "request timed out"
                    );
                    return Err(ClientError::Timeout {
                        method,
                        timeout: self.timeout,
                    });
                }
                // Someone else removed the entry first and delivered under
                // the lock, so the outcome is already in the channel.
                match self.rx.try_recv() {
                    Ok(outcome) => outcome.map_err(Into::into),
                    Err(_) => Err(ClientError::Timeout {
                        method,
                        timeout: self.timeout,
                    }),
                }
            }
        }
    }
}

impl Drop for ResponseWaiter {
    fn drop(&mut self) {
        // An abandoned waiter must not leave its entry behind.
        self.table.remove(&self.id);
    }
}

impl From<CallFailure> for ClientError {
    fn from(failure: CallFailure) -> Self {
        match failure {
            CallFailure::Rpc(error) => ClientError::Rpc(error),
            CallFailure::Disconnected(reason) => ClientError::Disconnected { reason },
        }
    }
}
