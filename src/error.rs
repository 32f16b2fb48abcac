//! Error types shared across the interception engine.

use thiserror::Error;

use crate::host::{ConnectionId, Identity};

/// The host adapter does not expose the shape the engine was built against.
///
/// Returned only while constructing an [`Interceptor`](crate::Interceptor);
/// there is no degraded mode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindingError {
    /// Adapter speaks a different contract version.
    #[error("host adapter contract v{found} is not supported (expected v{expected})")]
    UnsupportedContract { found: u32, expected: u32 },

    /// Adapter did not name the stage interceptors are anchored before.
    #[error("host adapter does not name a message handler anchor stage")]
    MissingAnchor,

    /// Owner name cannot be used as a stage name prefix.
    #[error("invalid owner name {0:?}: use ASCII letters, digits, '-' or '_'")]
    InvalidOwner(String),
}

/// Failures raised by a pipeline while inserting, removing or forwarding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A stage received a call it has no forwarding target for.
    #[error("stage {stage:?} cannot forward `{call}`")]
    ForwardingUnsupported { stage: String, call: &'static str },

    /// No stage with this name is present.
    #[error("no stage named {0:?} in pipeline")]
    StageNotFound(String),

    /// A stage with this name is already present.
    #[error("stage {0:?} is already present in pipeline")]
    DuplicateStage(String),

    /// The anchor an insert was positioned against is missing.
    #[error("anchor stage {0:?} is not present in pipeline")]
    AnchorNotFound(String),

    /// The connection's executor no longer accepts work.
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// The serial executor of a connection rejected a task.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("connection executor has shut down")]
    Shutdown,
}

/// Outcome of a write that did not reach the transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// An outbound transform suppressed the message.
    #[error("write was suppressed before reaching the transport")]
    Suppressed,

    /// The connection closed before the write could complete.
    #[error("connection is closed")]
    Closed,

    /// A stage refused the message.
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// A transform returned an error. The message it was handed is dropped.
#[derive(Debug, Error)]
#[error("{direction} handler failed on {connection}: {source}")]
pub struct HandlerFault {
    pub direction: &'static str,
    pub connection: ConnectionId,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

/// Errors surfaced by the public interception API.
#[derive(Debug, Error)]
pub enum TapError {
    /// No live connection is bound to this identity (yet).
    #[error("no connection available for identity {0}")]
    NotFound(Identity),

    /// The handle has no bound identity.
    #[error("connection has no bound identity")]
    Unbound,

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
