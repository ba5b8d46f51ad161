// Library interface for agentlink
// The binary, benchmarks and integration tests all go through these modules

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod transport;

pub use client::{BatchItem, BatchMode, BatchOutcome, BatchResult, ClientStatus, RpcClient};
pub use config::{ClientOptions, ConfigError, Settings};
pub use error::{ClientError, ErrorReport, LaunchError};
pub use events::{ClientEvent, EventBus, SubscriptionHandle};
pub use transport::{ExitInfo, LaunchSpec, RetryPolicy, RpcError, WorkerState};
