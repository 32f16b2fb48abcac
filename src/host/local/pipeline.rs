//! Copy-on-write stage chain.
//!
//! Traversals load one snapshot of the chain and walk it without locks, so
//! stages may insert or remove stages (including themselves) while a message
//! is in flight; the change is seen by the next traversal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::error::PipelineError;
use crate::host::{Connection, ConnectionRef};
use crate::pipeline::{Message, Pipeline, Stage, StageCall, StageContext, WriteAck};

#[derive(Clone)]
struct Entry {
    name: Arc<str>,
    stage: Arc<dyn Stage>,
}

type Chain = Arc<Vec<Entry>>;

/// Receives traffic that runs off either end of a pipeline.
pub trait Endpoint: Send + Sync {
    /// A write passed the head stage.
    fn write(&self, msg: Message, ack: WriteAck);

    /// An outbound operation passed the head stage.
    fn invoke(&self, _call: StageCall) {}

    /// A read passed the tail stage.
    fn read(&self, msg: Message) {
        tracing::trace!(message = msg.type_name(), "Read reached pipeline tail unhandled");
    }

    /// An inbound event passed the tail stage.
    fn fire(&self, call: StageCall) {
        if let StageCall::Fault(fault) = call {
            tracing::warn!(error = %fault, "Fault reached pipeline tail unhandled");
        }
    }
}

/// Pipeline used by every connection and listener of the local host.
pub struct LocalPipeline {
    chain: ArcSwap<Vec<Entry>>,
    /// Serializes structural changes; traversals never take it.
    structure: Mutex<()>,
    registered: AtomicBool,
    /// Stages whose `HandlerAdded` waits for registration, in insertion order.
    deferred: Mutex<Vec<Arc<str>>>,
    owner: Option<Weak<dyn Connection>>,
    endpoint: Arc<dyn Endpoint>,
}

impl LocalPipeline {
    /// Pipelines of listeners start registered; connection pipelines defer
    /// attach callbacks until [`register`](Self::register).
    pub fn new(
        owner: Option<Weak<dyn Connection>>,
        endpoint: Arc<dyn Endpoint>,
        registered: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            chain: ArcSwap::from_pointee(Vec::new()),
            structure: Mutex::new(()),
            registered: AtomicBool::new(registered),
            deferred: Mutex::new(Vec::new()),
            owner,
            endpoint,
        })
    }

    /// Mark the pipeline registered and run deferred attach callbacks.
    pub fn register(&self) {
        let pending = {
            let mut deferred = self.deferred.lock();
            self.registered.store(true, Ordering::SeqCst);
            std::mem::take(&mut *deferred)
        };
        for name in pending {
            self.notify(&name, StageCall::HandlerAdded);
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Deliver a read at the head.
    pub fn fire_read(&self, msg: Message) -> Result<(), PipelineError> {
        self.read_from(self.chain.load_full(), 0, msg)
    }

    /// Deliver an inbound event at the head.
    pub fn fire(&self, call: StageCall) -> Result<(), PipelineError> {
        self.fire_from(self.chain.load_full(), 0, call)
    }

    /// Deliver a write at the tail.
    pub fn write(&self, msg: Message, ack: WriteAck) -> Result<(), PipelineError> {
        let chain = self.chain.load_full();
        let len = chain.len();
        self.write_from(chain, len, msg, ack)
    }

    /// Deliver an outbound operation at the tail.
    pub fn invoke(&self, call: StageCall) -> Result<(), PipelineError> {
        let chain = self.chain.load_full();
        let len = chain.len();
        self.invoke_from(chain, len, call)
    }

    fn read_from(&self, chain: Chain, from: usize, msg: Message) -> Result<(), PipelineError> {
        match next_inbound(&chain, from) {
            Some(index) => {
                let stage = Arc::clone(&chain[index].stage);
                stage.on_read(&self.context(chain, index), msg)
            }
            None => {
                self.endpoint.read(msg);
                Ok(())
            }
        }
    }

    fn fire_from(&self, chain: Chain, from: usize, call: StageCall) -> Result<(), PipelineError> {
        match next_inbound(&chain, from) {
            Some(index) => {
                let stage = Arc::clone(&chain[index].stage);
                stage.on_call(&self.context(chain, index), call)
            }
            None => {
                self.endpoint.fire(call);
                Ok(())
            }
        }
    }

    fn write_from(
        &self,
        chain: Chain,
        before: usize,
        msg: Message,
        ack: WriteAck,
    ) -> Result<(), PipelineError> {
        match prev_outbound(&chain, before) {
            Some(index) => {
                let stage = Arc::clone(&chain[index].stage);
                stage.on_write(&self.context(chain, index), msg, ack)
            }
            None => {
                self.endpoint.write(msg, ack);
                Ok(())
            }
        }
    }

    fn invoke_from(&self, chain: Chain, before: usize, call: StageCall) -> Result<(), PipelineError> {
        match prev_outbound(&chain, before) {
            Some(index) => {
                let stage = Arc::clone(&chain[index].stage);
                stage.on_call(&self.context(chain, index), call)
            }
            None => {
                self.endpoint.invoke(call);
                Ok(())
            }
        }
    }

    fn context(&self, chain: Chain, index: usize) -> LocalContext<'_> {
        LocalContext {
            pipeline: self,
            chain,
            index,
        }
    }

    /// Deliver a registration callback to one stage of the current chain.
    fn notify(&self, name: &str, call: StageCall) {
        let chain = self.chain.load_full();
        if let Some(index) = chain.iter().position(|e| &*e.name == name) {
            self.notify_at(chain, index, call);
        }
    }

    fn notify_at(&self, chain: Chain, index: usize, call: StageCall) {
        let stage = Arc::clone(&chain[index].stage);
        let call_name = call.name();
        let ctx = self.context(chain, index);
        if let Err(e) = stage.on_call(&ctx, call) {
            tracing::warn!(stage = ctx.name(), call = call_name, error = %e, "Stage callback failed");
        }
    }

    fn attached(&self, name: &str) {
        {
            let mut deferred = self.deferred.lock();
            if !self.registered.load(Ordering::SeqCst) {
                deferred.push(Arc::from(name));
                return;
            }
        }
        self.notify(name, StageCall::HandlerAdded);
    }

    fn insert_with<F>(&self, name: &str, stage: Arc<dyn Stage>, position: F) -> Result<(), PipelineError>
    where
        F: FnOnce(&[Entry]) -> Result<usize, PipelineError>,
    {
        {
            let _guard = self.structure.lock();
            let current = self.chain.load();
            if current.iter().any(|e| &*e.name == name) {
                return Err(PipelineError::DuplicateStage(name.to_string()));
            }
            let index = position(&current)?;
            let mut next = Vec::clone(&current);
            next.insert(
                index,
                Entry {
                    name: Arc::from(name),
                    stage,
                },
            );
            self.chain.store(Arc::new(next));
        }
        self.attached(name);
        Ok(())
    }
}

impl Pipeline for LocalPipeline {
    fn insert_first(&self, name: &str, stage: Arc<dyn Stage>) -> Result<(), PipelineError> {
        self.insert_with(name, stage, |_| Ok(0))
    }

    fn insert_last(&self, name: &str, stage: Arc<dyn Stage>) -> Result<(), PipelineError> {
        self.insert_with(name, stage, |entries| Ok(entries.len()))
    }

    fn insert_before(
        &self,
        anchor: &str,
        name: &str,
        stage: Arc<dyn Stage>,
    ) -> Result<(), PipelineError> {
        self.insert_with(name, stage, |entries| {
            entries
                .iter()
                .position(|e| &*e.name == anchor)
                .ok_or_else(|| PipelineError::AnchorNotFound(anchor.to_string()))
        })
    }

    fn remove(&self, name: &str) -> Result<Arc<dyn Stage>, PipelineError> {
        let (before, index) = {
            let _guard = self.structure.lock();
            let current = self.chain.load_full();
            let index = current
                .iter()
                .position(|e| &*e.name == name)
                .ok_or_else(|| PipelineError::StageNotFound(name.to_string()))?;
            let mut next = Vec::clone(&current);
            next.remove(index);
            self.chain.store(Arc::new(next));
            (current, index)
        };
        self.deferred.lock().retain(|pending| &**pending != name);

        let stage = Arc::clone(&before[index].stage);
        if self.is_registered() {
            self.notify_at(before, index, StageCall::HandlerRemoved);
        }
        Ok(stage)
    }

    fn contains(&self, name: &str) -> bool {
        self.chain.load().iter().any(|e| &*e.name == name)
    }

    fn names(&self) -> Vec<String> {
        self.chain.load().iter().map(|e| e.name.to_string()).collect()
    }
}

fn next_inbound(chain: &[Entry], from: usize) -> Option<usize> {
    (from..chain.len()).find(|&i| chain[i].stage.role().handles_inbound())
}

fn prev_outbound(chain: &[Entry], before: usize) -> Option<usize> {
    (0..before.min(chain.len()))
        .rev()
        .find(|&i| chain[i].stage.role().handles_outbound())
}

/// A stage's position within one snapshot of the chain.
struct LocalContext<'a> {
    pipeline: &'a LocalPipeline,
    chain: Chain,
    index: usize,
}

impl StageContext for LocalContext<'_> {
    fn name(&self) -> &str {
        &self.chain[self.index].name
    }

    fn connection(&self) -> Option<ConnectionRef> {
        self.pipeline.owner.as_ref().and_then(Weak::upgrade)
    }

    fn fire_read(&self, msg: Message) -> Result<(), PipelineError> {
        self.pipeline
            .read_from(Arc::clone(&self.chain), self.index + 1, msg)
    }

    fn fire(&self, call: StageCall) -> Result<(), PipelineError> {
        self.pipeline
            .fire_from(Arc::clone(&self.chain), self.index + 1, call)
    }

    fn write(&self, msg: Message, ack: WriteAck) -> Result<(), PipelineError> {
        self.pipeline
            .write_from(Arc::clone(&self.chain), self.index, msg, ack)
    }

    fn invoke(&self, call: StageCall) -> Result<(), PipelineError> {
        self.pipeline
            .invoke_from(Arc::clone(&self.chain), self.index, call)
    }
}
