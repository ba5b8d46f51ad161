//! Batch execution
//!
//! Sequential batches stop at the first failure and mark the rest as
//! skipped. Parallel batches issue every call at once and report every
//! outcome.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use super::RpcClient;
use crate::error::ClientError;

/// One call in a batch
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawBatchItem")]
pub struct BatchItem {
    pub method: String,
    pub params: Option<Value>,
    /// Overrides the client's default call timeout
    pub timeout: Option<Duration>,
}

/// On-disk form: `{method, params?, timeout_ms?}`
#[derive(Deserialize)]
struct RawBatchItem {
    method: String,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

impl From<RawBatchItem> for BatchItem {
    fn from(raw: RawBatchItem) -> Self {
        Self {
            method: raw.method,
            params: raw.params,
            timeout: raw.timeout_ms.map(Duration::from_millis),
        }
    }
}

impl BatchItem {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug)]
pub enum BatchOutcome {
    Succeeded(Value),
    Failed(ClientError),
    /// Not attempted because an earlier item failed
    Skipped,
}

impl BatchOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, BatchOutcome::Failed(_))
    }

    fn from_result(result: Result<Value, ClientError>) -> Self {
        match result {
            Ok(value) => BatchOutcome::Succeeded(value),
            Err(error) => BatchOutcome::Failed(error),
        }
    }

    fn to_json(&self, index: usize) -> Value {
        match self {
            BatchOutcome::Succeeded(result) => {
                json!({"index": index, "status": "ok", "result": result})
            }
            BatchOutcome::Failed(error) => {
                json!({"index": index, "status": "error", "error": error.report()})
            }
            BatchOutcome::Skipped => json!({"index": index, "status": "skipped"}),
        }
    }
}

/// Outcome of every item, in input order
#[derive(Debug)]
pub struct BatchResult {
    pub mode: BatchMode,
    pub outcomes: Vec<BatchOutcome>,
    /// First failing index, if any
    pub failed_index: Option<usize>,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.failed_index.is_none()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, BatchOutcome::Succeeded(_)))
            .count()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "mode": self.mode,
            "ok": self.is_success(),
            "failed_index": self.failed_index,
            "results": self
                .outcomes
                .iter()
                .enumerate()
                .map(|(index, outcome)| outcome.to_json(index))
                .collect::<Vec<_>>(),
        })
    }
}

impl RpcClient {
    /// Run a batch of calls
    pub async fn execute_batch(&self, items: &[BatchItem], mode: BatchMode) -> BatchResult {
        let outcomes = match mode {
            BatchMode::Sequential => {
                let mut outcomes = Vec::with_capacity(items.len());
                let mut failed = false;
                for item in items {
                    if failed {
                        outcomes.push(BatchOutcome::Skipped);
                        continue;
                    }
                    let outcome = BatchOutcome::from_result(self.call_item(item).await);
                    failed = outcome.is_failure();
                    outcomes.push(outcome);
                }
                outcomes
            }
            BatchMode::Parallel => {
                join_all(items.iter().map(|item| async move {
                    BatchOutcome::from_result(self.call_item(item).await)
                }))
                .await
            }
        };

        let failed_index = outcomes.iter().position(BatchOutcome::is_failure);
        if let Some(index) = failed_index {
            tracing::debug!(index, ?mode, "batch item failed");
        }
        BatchResult {
            mode,
            outcomes,
            failed_index,
        }
    }

    async fn call_item(&self, item: &BatchItem) -> Result<Value, ClientError> {
        let timeout = item.timeout.unwrap_or(self.options().call_timeout);
        self.call_with_timeout(&item.method, item.params.clone(), timeout)
            .await
    }
}
