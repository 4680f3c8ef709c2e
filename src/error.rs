//! Error taxonomy for the execution service.
//!
//! Job-local conditions (`UnknownJob`, `ChannelClosed`) are returned to the
//! immediate caller and never affect other jobs. Environment failures are
//! shared by every caller waiting on the same provisioning attempt, which is
//! why [`EnvironmentError`] is `Clone`.
use std::time::Duration;

use thiserror::Error;

use crate::protocol::{JobId, RpcError};

/// Failure to stand up the shared sandbox environment.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnvironmentError {
    /// The sandbox host process could not be started
    #[error("failed to spawn sandbox host: {0}")]
    Spawn(String),

    /// The sandbox host started but is not usable (resource limits, crashed during setup)
    #[error("sandbox host unavailable: {0}")]
    Unavailable(String),

    /// The environment was torn down while it was still being created
    #[error("environment creation cancelled by teardown")]
    Cancelled,

    /// The environment description itself is invalid; retrying will not help
    #[error("invalid environment configuration: {0}")]
    Config(String),
}

impl EnvironmentError {
    /// Returns true if a later provisioning attempt may succeed.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, EnvironmentError::Config(_))
    }
}

/// Failure to hand an envelope to the physical transport.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport write failed: {0}")]
    Write(String),
}

/// An inbound or outbound message that breaks the control protocol.
///
/// Violations are dropped with a diagnostic; they never tear down the
/// transport or the job they were addressed to.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolViolation {
    #[error("envelope for job {actual} delivered to channel bound to job {expected}")]
    JobMismatch { expected: JobId, actual: JobId },

    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("command `{0}` may not be sent by the sandbox")]
    UnexpectedCommand(String),

    #[error("unsupported JSON-RPC version `{0}`")]
    UnsupportedVersion(String),

    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Main error type returned by [`crate::ExecutionService`] operations.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("failed to create execution environment: {0}")]
    EnvironmentCreation(#[from] EnvironmentError),

    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    #[error("channel for job {0} is closed")]
    ChannelClosed(JobId),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Termination was attempted for a job whose environment no longer exists.
    #[error("no execution environment exists for job {0}")]
    EnvironmentMissing(JobId),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("snap {0} is already running")]
    SnapAlreadyRunning(String),

    #[error("snap {0} is not running")]
    SnapNotRunning(String),

    #[error("job {0} already has a message subscriber")]
    AlreadySubscribed(JobId),

    #[error("request to job {job_id} timed out after {}ms", .timeout.as_millis())]
    Timeout { job_id: JobId, timeout: Duration },

    #[error("request rejected: {0}")]
    Unauthorized(String),

    #[error("snap returned an error: {0}")]
    Rpc(RpcError),
}

impl ExecutionError {
    /// True for conditions that only mean "the job is already gone".
    pub fn is_job_gone(&self) -> bool {
        matches!(
            self,
            ExecutionError::UnknownJob(_) | ExecutionError::ChannelClosed(_)
        )
    }
}

/// Type alias for Results that return ExecutionError
pub type Result<T> = std::result::Result<T, ExecutionError>;
