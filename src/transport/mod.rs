//! Supervised JSON-RPC 2.0 transport over a worker's stdio
//!
//! Layers, bottom up:
//! - [`protocol`]: message types, line encode/decode
//! - [`framer`]: byte chunks to complete lines
//! - [`pending`]: request id to waiting caller
//! - [`supervisor`]: process lifecycle and stdio tasks
//! - [`resolver`], [`platform`], [`retry`]: launch-time collaborators

pub mod framer;
pub mod pending;
pub mod platform;
pub mod protocol;
pub mod resolver;
pub mod retry;
pub mod supervisor;

pub use framer::{LineFramer, MessageDecoder};
pub use pending::PendingCalls;
pub use platform::{LineEnding, PlatformProfile, Termination};
pub use protocol::{Message, Notification, Request, RequestId, Response, RpcError};
pub use resolver::{ExecutableResolver, LaunchSpec, LocalResolver, ResolvedCommand};
pub use retry::RetryPolicy;
pub use supervisor::{ExitInfo, Worker, WorkerState};
