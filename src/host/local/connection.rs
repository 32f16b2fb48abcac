//! Connection of the local host.
//!
//! # Lifecycle
//! ```text
//! accept → register (deferred attach callbacks run) → activate (buffered reads replayed)
//!        → receive* → close (inactive, unregistered)
//! ```
//!
//! Every pipeline traversal runs on the connection's executor, so a connection
//! observes its own traffic strictly in order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{PipelineError, WriteError};
use crate::host::local::executor::LocalExecutor;
use crate::host::local::pipeline::{Endpoint, LocalPipeline};
use crate::host::{Connection, ConnectionId};
use crate::pipeline::{Message, Pipeline, SerialExecutor, StageCall, WriteAck, WriteReceipt};

/// Head of a connection pipeline: writes that get here go on the wire.
struct Transport {
    open: AtomicBool,
    outbox: mpsc::UnboundedSender<Message>,
}

impl Endpoint for Transport {
    fn write(&self, msg: Message, ack: WriteAck) {
        if !self.open.load(Ordering::SeqCst) {
            ack.fail(WriteError::Closed);
            return;
        }
        match self.outbox.send(msg) {
            Ok(()) => ack.succeed(),
            Err(_) => ack.fail(WriteError::Closed),
        }
    }

    fn invoke(&self, call: StageCall) {
        match call {
            StageCall::Close | StageCall::Disconnect => {
                self.open.store(false, Ordering::SeqCst);
            }
            other => tracing::trace!(call = other.name(), "Transport operation"),
        }
    }
}

/// Reads arriving before activation are held back.
#[derive(Default)]
struct ReadGate {
    active: bool,
    pending: Vec<Message>,
}

/// In-process connection with its own pipeline, executor and outbox.
pub struct LocalConnection {
    id: ConnectionId,
    remote: SocketAddr,
    pipeline: Arc<LocalPipeline>,
    executor: Arc<LocalExecutor>,
    transport: Arc<Transport>,
    outbox: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    gate: Mutex<ReadGate>,
    weak: Weak<LocalConnection>,
}

impl LocalConnection {
    /// Must be called from within a Tokio runtime.
    pub fn new(remote: SocketAddr) -> Arc<Self> {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Transport {
            open: AtomicBool::new(true),
            outbox: tx,
        });

        Arc::new_cyclic(|weak: &Weak<LocalConnection>| {
            let owner: Weak<dyn Connection> = weak.clone();
            Self {
                id,
                remote,
                pipeline: LocalPipeline::new(Some(owner), transport.clone(), false),
                executor: LocalExecutor::spawn(id.to_string()),
                transport,
                outbox: Mutex::new(Some(rx)),
                gate: Mutex::new(ReadGate::default()),
                weak: weak.clone(),
            }
        })
    }

    pub fn local_pipeline(&self) -> &Arc<LocalPipeline> {
        &self.pipeline
    }

    /// Register the pipeline, then activate it once everything queued while
    /// registering has run.
    pub fn register(&self) -> Result<(), PipelineError> {
        let weak = self.weak.clone();
        self.executor.execute(Box::new(move || {
            let Some(conn) = weak.upgrade() else { return };
            conn.pipeline.register();
            conn.log(conn.pipeline.fire(StageCall::Registered));

            let weak = conn.weak.clone();
            let queued = conn.executor.execute(Box::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.activate();
                }
            }));
            if queued.is_err() {
                tracing::debug!(connection = %conn.id, "Executor gone before activation");
            }
        }))?;
        Ok(())
    }

    fn activate(&self) {
        if !self.is_open() {
            return;
        }
        self.log(self.pipeline.fire(StageCall::Active));
        let pending = {
            let mut gate = self.gate.lock();
            gate.active = true;
            std::mem::take(&mut gate.pending)
        };
        for msg in pending {
            self.log(self.pipeline.fire_read(msg));
        }
        tracing::debug!(connection = %self.id, "Connection active");
    }

    /// Feed an inbound message as if it had been decoded off the wire.
    pub fn receive(&self, msg: Message) -> Result<(), PipelineError> {
        let weak = self.weak.clone();
        self.executor.execute(Box::new(move || {
            let Some(conn) = weak.upgrade() else { return };
            let msg = {
                let mut gate = conn.gate.lock();
                if !gate.active {
                    gate.pending.push(msg);
                    return;
                }
                msg
            };
            conn.log(conn.pipeline.fire_read(msg));
        }))?;
        Ok(())
    }

    /// Close the transport and tell the pipeline. Returns `false` if the
    /// connection was already closed.
    pub fn close(&self) -> bool {
        if !self.transport.open.swap(false, Ordering::SeqCst) {
            return false;
        }
        let weak = self.weak.clone();
        let queued = self.executor.execute(Box::new(move || {
            let Some(conn) = weak.upgrade() else { return };
            conn.gate.lock().pending.clear();
            conn.log(conn.pipeline.fire(StageCall::Inactive));
            conn.log(conn.pipeline.fire(StageCall::Unregistered));
            tracing::debug!(connection = %conn.id, "Connection closed");
        }));
        if queued.is_err() {
            tracing::debug!(connection = %self.id, "Executor gone before close");
        }
        true
    }

    /// Receiver for everything that reached the transport. Can be taken once.
    pub fn take_outbox(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.outbox.lock().take()
    }

    /// Resolve once the connection's executor has drained.
    pub async fn idle(&self) {
        self.executor.idle().await;
    }

    fn log(&self, result: Result<(), PipelineError>) {
        if let Err(e) = result {
            tracing::error!(connection = %self.id, error = %e, "Pipeline traversal failed");
        }
    }
}

impl Connection for LocalConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn pipeline(&self) -> Arc<dyn Pipeline> {
        self.pipeline.clone()
    }

    fn executor(&self) -> Arc<dyn SerialExecutor> {
        self.executor.clone()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    fn is_open(&self) -> bool {
        self.transport.open.load(Ordering::SeqCst)
    }

    fn send(&self, msg: Message) -> WriteReceipt {
        if !self.is_open() {
            return WriteReceipt::failed(WriteError::Closed);
        }
        let (ack, receipt) = WriteAck::channel();
        let weak = self.weak.clone();
        let queued = self.executor.execute(Box::new(move || {
            let Some(conn) = weak.upgrade() else { return };
            conn.log(conn.pipeline.write(msg, ack));
            conn.log(conn.pipeline.invoke(StageCall::Flush));
        }));
        match queued {
            Ok(()) => receipt,
            Err(_) => WriteReceipt::failed(WriteError::Closed),
        }
    }
}

impl std::fmt::Debug for LocalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Stage, StageContext, StageRole};

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    /// Tail stage that records reads.
    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Stage for Recorder {
        fn role(&self) -> StageRole {
            StageRole::Inbound
        }

        fn on_call(&self, _ctx: &dyn StageContext, _call: StageCall) -> Result<(), PipelineError> {
            Ok(())
        }

        fn on_read(&self, _ctx: &dyn StageContext, msg: Message) -> Result<(), PipelineError> {
            self.0.lock().push(msg.downcast::<String>().unwrap_or_default());
            Ok(())
        }
    }

    #[tokio::test]
    async fn reads_are_held_until_activation() {
        let conn = LocalConnection::new(addr());
        let recorder = Arc::new(Recorder::default());
        conn.pipeline.insert_last("recorder", recorder.clone()).unwrap();

        conn.receive(Message::new(String::from("early"))).unwrap();
        conn.idle().await;
        assert!(recorder.0.lock().is_empty());

        conn.register().unwrap();
        conn.receive(Message::new(String::from("late"))).unwrap();
        conn.idle().await;
        assert_eq!(*recorder.0.lock(), vec!["early", "late"]);
    }

    #[tokio::test]
    async fn send_reaches_outbox_until_closed() {
        let conn = LocalConnection::new(addr());
        conn.register().unwrap();
        let mut outbox = conn.take_outbox().unwrap();
        assert!(conn.take_outbox().is_none());

        let receipt = conn.send(Message::new(String::from("hello")));
        assert_eq!(receipt.wait().await, Ok(()));
        let sent = outbox.recv().await.unwrap();
        assert_eq!(sent.downcast_ref::<String>().map(String::as_str), Some("hello"));

        assert!(conn.close());
        assert!(!conn.close());
        assert_eq!(
            conn.send(Message::new(String::from("late"))).wait().await,
            Err(WriteError::Closed)
        );
    }
}
