//! The stage-chain contract a host exposes, and the engine's thin wrapper
//! over it.

use std::sync::Arc;

use crate::error::{ExecutorError, PipelineError};
use crate::host::{ConnectionRef, ListenerRef};
use crate::pipeline::stage::Stage;

/// Unit of work queued on a connection's executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// One logical serial execution context per connection.
///
/// Tasks run one at a time, in submission order.
pub trait SerialExecutor: Send + Sync {
    fn execute(&self, task: Task) -> Result<(), ExecutorError>;
}

/// Ordered chain of named stages owned by a connection or listening socket.
///
/// Stage names are unique within one pipeline.
pub trait Pipeline: Send + Sync {
    fn insert_first(&self, name: &str, stage: Arc<dyn Stage>) -> Result<(), PipelineError>;

    fn insert_last(&self, name: &str, stage: Arc<dyn Stage>) -> Result<(), PipelineError>;

    /// Insert `stage` immediately before the stage named `anchor`.
    fn insert_before(
        &self,
        anchor: &str,
        name: &str,
        stage: Arc<dyn Stage>,
    ) -> Result<(), PipelineError>;

    /// Detach the named stage, returning it.
    fn remove(&self, name: &str) -> Result<Arc<dyn Stage>, PipelineError>;

    fn contains(&self, name: &str) -> bool;

    /// Stage names, head to tail.
    fn names(&self) -> Vec<String>;
}

/// Result of a removal that tolerates absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// Stage was not there (peer already gone, never installed).
    AlreadyRemoved,
    /// The pipeline refused the removal; the stage may still be attached.
    Failed,
}

/// Pipeline plus the executor structural changes are deferred onto.
#[derive(Clone)]
pub struct PipelineBridge {
    pipeline: Arc<dyn Pipeline>,
    executor: Option<Arc<dyn SerialExecutor>>,
}

impl PipelineBridge {
    pub fn for_connection(connection: &ConnectionRef) -> Self {
        Self {
            pipeline: connection.pipeline(),
            executor: Some(connection.executor()),
        }
    }

    /// Listening sockets have no executor; nothing is scheduled on them.
    pub fn for_listener(listener: &ListenerRef) -> Self {
        Self {
            pipeline: listener.pipeline(),
            executor: None,
        }
    }

    pub fn insert_first(&self, name: &str, stage: Arc<dyn Stage>) -> Result<(), PipelineError> {
        self.pipeline.insert_first(name, stage)?;
        tracing::trace!(stage = name, "Stage inserted first");
        Ok(())
    }

    pub fn insert_last(&self, name: &str, stage: Arc<dyn Stage>) -> Result<(), PipelineError> {
        self.pipeline.insert_last(name, stage)?;
        tracing::trace!(stage = name, "Stage inserted last");
        Ok(())
    }

    pub fn insert_before(
        &self,
        anchor: &str,
        name: &str,
        stage: Arc<dyn Stage>,
    ) -> Result<(), PipelineError> {
        self.pipeline.insert_before(anchor, name, stage)?;
        tracing::trace!(stage = name, anchor, "Stage inserted before anchor");
        Ok(())
    }

    /// Remove a stage; absence is not an error, and other failures are logged
    /// and reported as [`RemoveOutcome::Failed`].
    pub fn remove_quietly(&self, name: &str) -> RemoveOutcome {
        match self.pipeline.remove(name) {
            Ok(_) => RemoveOutcome::Removed,
            Err(PipelineError::StageNotFound(_)) => {
                tracing::trace!(stage = name, "Stage already removed");
                RemoveOutcome::AlreadyRemoved
            }
            Err(e) => {
                tracing::warn!(stage = name, error = %e, "Stage removal failed, skipping");
                RemoveOutcome::Failed
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pipeline.contains(name)
    }

    /// Run `work` on the owning connection's executor, after everything
    /// already queued there.
    pub fn schedule<F>(&self, work: F) -> Result<(), PipelineError>
    where
        F: FnOnce() + Send + 'static,
    {
        let executor = self.executor.as_ref().ok_or(ExecutorError::Shutdown)?;
        executor.execute(Box::new(work))?;
        Ok(())
    }
}
