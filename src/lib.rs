//! Execution service for untrusted snaps.
//!
//! Every snap runs as a job inside one shared sandbox environment. The host
//! talks to a job through a [`ProxyChannel`](channel::ProxyChannel) that tags
//! and filters messages on the environment's single transport.
pub mod backoff;
pub mod channel;
pub mod config;
mod engine;
pub mod error;
pub mod hooks;
pub mod permissions;
pub mod protocol;
pub mod provisioner;
mod registry;
pub mod service;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use error::{EnvironmentError, ExecutionError, ProtocolViolation, TransportError};
pub use hooks::{HookContext, ProviderHook, ProviderHooks};
pub use permissions::{AllowAll, OriginAllowList, PermissionGate};
pub use protocol::{Command, Envelope, JobId, RpcError, RpcMessage};
pub use registry::{JobInfo, JobStatus, ServiceEvent};
pub use service::{ExecutionPayload, ExecutionService};

/// Locks a std mutex. A panic while holding one of our locks leaves the
/// guarded state consistent, so poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
