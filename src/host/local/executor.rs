//! Serial executor backed by a Tokio task.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::ExecutorError;
use crate::pipeline::{SerialExecutor, Task};

/// Runs queued tasks one at a time on a dedicated Tokio task.
#[derive(Debug)]
pub struct LocalExecutor {
    label: String,
    tx: mpsc::UnboundedSender<Task>,
    /// Tasks submitted but not yet started.
    queued: Arc<AtomicUsize>,
}

impl LocalExecutor {
    /// Spawn the executor loop. Must be called from within a Tokio runtime.
    pub fn spawn(label: impl Into<String>) -> Arc<Self> {
        let label = label.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let queued = Arc::new(AtomicUsize::new(0));

        let loop_label = label.clone();
        let loop_queued = Arc::clone(&queued);
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                loop_queued.fetch_sub(1, Ordering::SeqCst);
                if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    tracing::error!(executor = %loop_label, "Executor task panicked");
                }
            }
            tracing::trace!(executor = %loop_label, "Executor stopped");
        });

        Arc::new(Self { label, tx, queued })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Resolve once the queue is empty, including work queued by queued work.
    pub async fn idle(&self) {
        loop {
            let (done_tx, done_rx) = oneshot::channel();
            let queued = Arc::clone(&self.queued);
            let marker = Box::new(move || {
                let _ = done_tx.send(queued.load(Ordering::SeqCst) == 0);
            });
            if self.execute(marker).is_err() {
                return;
            }
            match done_rx.await {
                Ok(false) => continue,
                Ok(true) | Err(_) => return,
            }
        }
    }
}

impl SerialExecutor for LocalExecutor {
    fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.tx.send(task).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            ExecutorError::Shutdown
        })
    }
}
