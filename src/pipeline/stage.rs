//! Stage roles, pipeline calls and the write completion object.

use std::error::Error;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::{PipelineError, WriteError};
use crate::host::ConnectionRef;
use crate::pipeline::forward;
use crate::pipeline::message::Message;

/// A fault travelling through a pipeline.
pub type Fault = Arc<dyn Error + Send + Sync>;

/// Which traffic a stage takes part in.
///
/// The pipeline only delivers inbound calls to inbound stages and outbound
/// calls to outbound stages; registration and faults reach every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    /// Only registration callbacks (e.g. one-shot initializers).
    Lifecycle,
    /// Reads and inbound events, head → tail.
    Inbound,
    /// Writes and outbound operations, tail → head.
    Outbound,
}

impl StageRole {
    pub fn handles_inbound(self) -> bool {
        matches!(self, StageRole::Inbound)
    }

    pub fn handles_outbound(self) -> bool {
        matches!(self, StageRole::Outbound)
    }
}

/// Lifecycle and control calls a pipeline makes on a stage.
///
/// Message reads and writes have their own entry points on [`Stage`].
#[derive(Debug)]
pub enum StageCall {
    /// The stage was attached to a pipeline.
    HandlerAdded,
    /// The stage was detached from a pipeline.
    HandlerRemoved,

    Registered,
    Unregistered,
    Active,
    Inactive,
    ReadComplete,
    WritabilityChanged,
    UserEvent(Message),

    Read,
    Flush,
    Close,
    Disconnect,
    Deregister,

    /// An error raised further up the pipeline.
    Fault(Fault),
}

/// Broad class of a [`StageCall`], used to route forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Registration,
    Inbound,
    Outbound,
    Fault,
}

impl StageCall {
    pub fn name(&self) -> &'static str {
        match self {
            StageCall::HandlerAdded => "handler_added",
            StageCall::HandlerRemoved => "handler_removed",
            StageCall::Registered => "channel_registered",
            StageCall::Unregistered => "channel_unregistered",
            StageCall::Active => "channel_active",
            StageCall::Inactive => "channel_inactive",
            StageCall::ReadComplete => "channel_read_complete",
            StageCall::WritabilityChanged => "channel_writability_changed",
            StageCall::UserEvent(_) => "user_event_triggered",
            StageCall::Read => "read",
            StageCall::Flush => "flush",
            StageCall::Close => "close",
            StageCall::Disconnect => "disconnect",
            StageCall::Deregister => "deregister",
            StageCall::Fault(_) => "exception_caught",
        }
    }

    pub fn kind(&self) -> CallKind {
        match self {
            StageCall::HandlerAdded | StageCall::HandlerRemoved => CallKind::Registration,
            StageCall::Registered
            | StageCall::Unregistered
            | StageCall::Active
            | StageCall::Inactive
            | StageCall::ReadComplete
            | StageCall::WritabilityChanged
            | StageCall::UserEvent(_) => CallKind::Inbound,
            StageCall::Read
            | StageCall::Flush
            | StageCall::Close
            | StageCall::Disconnect
            | StageCall::Deregister => CallKind::Outbound,
            StageCall::Fault(_) => CallKind::Fault,
        }
    }
}

/// A stage's view of its position in a pipeline.
///
/// Every method continues the traversal from this stage: inbound calls move
/// towards the tail, outbound calls towards the head.
pub trait StageContext: Send + Sync {
    /// Name the stage was registered under.
    fn name(&self) -> &str;

    /// Connection owning the pipeline; `None` for listening sockets.
    fn connection(&self) -> Option<ConnectionRef>;

    /// Pass a message to the next inbound stage.
    fn fire_read(&self, msg: Message) -> Result<(), PipelineError>;

    /// Pass an inbound event (or a fault) to the next inbound stage.
    fn fire(&self, call: StageCall) -> Result<(), PipelineError>;

    /// Pass a write to the previous outbound stage.
    fn write(&self, msg: Message, ack: WriteAck) -> Result<(), PipelineError>;

    /// Pass an outbound operation to the previous outbound stage.
    fn invoke(&self, call: StageCall) -> Result<(), PipelineError>;
}

/// A named, removable pipeline participant.
///
/// Defaults relay every call unchanged, so an implementation only overrides
/// what it actually handles.
pub trait Stage: Send + Sync + 'static {
    fn role(&self) -> StageRole;

    /// Whether one instance may sit in several pipelines.
    fn is_sharable(&self) -> bool {
        false
    }

    fn on_call(&self, ctx: &dyn StageContext, call: StageCall) -> Result<(), PipelineError> {
        forward::pass_through(self.role(), ctx, call)
    }

    fn on_read(&self, ctx: &dyn StageContext, msg: Message) -> Result<(), PipelineError> {
        forward::read(self.role(), ctx, msg)
    }

    fn on_write(
        &self,
        ctx: &dyn StageContext,
        msg: Message,
        ack: WriteAck,
    ) -> Result<(), PipelineError> {
        forward::write(self.role(), ctx, msg, ack)
    }
}

/// Completion handle that travels with a write.
///
/// Dropping it unresolved resolves the matching [`WriteReceipt`] to
/// [`WriteError::Suppressed`].
#[derive(Debug)]
pub struct WriteAck {
    tx: Option<oneshot::Sender<Result<(), WriteError>>>,
}

impl WriteAck {
    /// Create an ack and the receipt that observes it.
    pub fn channel() -> (WriteAck, WriteReceipt) {
        let (tx, rx) = oneshot::channel();
        (WriteAck { tx: Some(tx) }, WriteReceipt { rx })
    }

    /// An ack nobody waits on.
    pub fn detached() -> WriteAck {
        WriteAck { tx: None }
    }

    /// The message reached the transport.
    pub fn succeed(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(()));
        }
    }

    pub fn fail(mut self, err: WriteError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }
}

/// The writer's side of a [`WriteAck`].
#[derive(Debug)]
pub struct WriteReceipt {
    rx: oneshot::Receiver<Result<(), WriteError>>,
}

impl WriteReceipt {
    /// A receipt that has already failed.
    pub fn failed(err: WriteError) -> WriteReceipt {
        let (ack, receipt) = WriteAck::channel();
        ack.fail(err);
        receipt
    }

    /// Wait for the write to complete.
    pub async fn wait(self) -> Result<(), WriteError> {
        self.rx.await.unwrap_or(Err(WriteError::Suppressed))
    }

    /// Non-blocking poll; `None` while the write is still in flight.
    pub fn try_result(&mut self) -> Option<Result<(), WriteError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(WriteError::Suppressed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_ack_reads_as_suppressed() {
        let (ack, mut receipt) = WriteAck::channel();
        assert_eq!(receipt.try_result(), None);
        drop(ack);
        assert_eq!(receipt.try_result(), Some(Err(WriteError::Suppressed)));
    }

    #[tokio::test]
    async fn succeeded_ack_resolves_receipt() {
        let (ack, receipt) = WriteAck::channel();
        ack.succeed();
        assert_eq!(receipt.wait().await, Ok(()));
    }

    #[test]
    fn call_kinds() {
        assert_eq!(StageCall::HandlerAdded.kind(), CallKind::Registration);
        assert_eq!(StageCall::Inactive.kind(), CallKind::Inbound);
        assert_eq!(StageCall::Flush.kind(), CallKind::Outbound);
        assert_eq!(StageCall::Flush.name(), "flush");
    }
}
