//! Interception stages and the state they share.
//!
//! # Data Flow
//! ```text
//! listener pipeline:   [accept] → host acceptor
//!                         │ hijack: remember pending address, insert [init] first
//!                         ▼
//! connection pipeline: [init] ... [anchor]
//!                         │ attached: schedule install, remove self
//!                         ▼
//!                      ... [in] [out] [anchor]
//! ```
//!
//! # Design Decisions
//! - Stages are private to one pipeline; none is sharable
//! - Installs run on the connection's executor, after the host's own wiring
//! - Hijacks and installs re-check that interception is still active
//!   afterwards, so one racing `close()` undoes itself
//! - Stage presence in the pipeline, not handle state, marks a connection as
//!   intercepted

pub mod slots;
pub mod stages;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::PipelineError;
use crate::host::{Connection, ConnectionRef, HostAdapter};
use crate::observability::metrics;
use crate::pipeline::{PipelineBridge, Stage};
use crate::registry::{ConnectionRegistry, InjectionState};

pub use slots::{Direction, HandlerError, HandlerResult, HandlerSlot, HandlerSlots, Transform};
pub use stages::{AcceptStage, InboundStage, InitStage, OutboundStage};

/// Monotonic, process-wide; one value per interceptor instance. Never reset.
static STAGE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Stage names of one interceptor instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageNames {
    pub inbound: String,
    pub outbound: String,
    pub init: String,
    pub accept: String,
}

impl StageNames {
    pub fn new(owner: &str) -> Self {
        let n = STAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            inbound: format!("{owner}_tap_in_{n}"),
            outbound: format!("{owner}_tap_out_{n}"),
            init: format!("{owner}_tap_init_{n}"),
            accept: format!("{owner}_tap_accept_{n}"),
        }
    }

    /// Stages that may sit in a connection pipeline.
    pub fn connection_stages(&self) -> [&str; 3] {
        [self.inbound.as_str(), self.outbound.as_str(), self.init.as_str()]
    }
}

/// State shared by an interceptor and every stage it installs.
pub(crate) struct Engine {
    pub(crate) adapter: Arc<dyn HostAdapter>,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) slots: HandlerSlots,
    pub(crate) names: StageNames,
    active: AtomicBool,
}

impl Engine {
    pub(crate) fn new(adapter: Arc<dyn HostAdapter>, names: StageNames) -> Self {
        Self {
            adapter,
            registry: ConnectionRegistry::new(),
            slots: HandlerSlots::new(),
            names,
            active: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
        metrics::record_active(active);
    }

    /// Put the init stage at the head of `conn`'s pipeline.
    ///
    /// Returns `false` when nothing was done: interception is inactive, or the
    /// connection already carries this interceptor's init or inbound stage.
    /// The pipeline, not the handle state, decides whether a connection is
    /// already intercepted, so a handle left behind by a racing `close()`
    /// never blocks a later `begin()`.
    pub(crate) fn hijack(self: &Arc<Self>, conn: &ConnectionRef) -> Result<bool, PipelineError> {
        if !self.is_active() {
            return Ok(false);
        }
        let bridge = PipelineBridge::for_connection(conn);
        if bridge.contains(&self.names.inbound) {
            tracing::trace!(connection = %conn.id(), "Connection already intercepted");
            return Ok(false);
        }

        let handle = self.registry.handle(conn);
        handle.set_state(InjectionState::InitPending);
        let init: Arc<dyn Stage> = Arc::new(InitStage::new(Arc::clone(self)));
        match bridge.insert_first(&self.names.init, init) {
            Ok(()) => {}
            Err(PipelineError::DuplicateStage(name)) => {
                tracing::debug!(connection = %conn.id(), stage = %name, "Init stage already present");
                return Ok(false);
            }
            Err(e) => {
                handle.set_state(InjectionState::Uninjected);
                return Err(e);
            }
        }

        if !self.is_active() {
            // close() ran while the init stage went in.
            bridge.remove_quietly(&self.names.init);
            handle.set_state(InjectionState::Removed);
            self.registry.evict(conn.id());
            tracing::debug!(connection = %conn.id(), "Hijack undone after close");
            if self.is_active() {
                // A later begin() may have skipped the connection meanwhile.
                return self.hijack(conn);
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Install the inbound and outbound stages before the anchor.
    ///
    /// Runs on the connection's executor, so installs of one connection never
    /// overlap.
    pub(crate) fn install(self: &Arc<Self>, conn: &ConnectionRef) {
        if !self.is_active() {
            tracing::trace!(connection = %conn.id(), "Install skipped, interception inactive");
            return;
        }
        let bridge = PipelineBridge::for_connection(conn);
        let handle = self.registry.handle(conn);
        if bridge.contains(&self.names.inbound) {
            handle.set_state(InjectionState::Active);
            tracing::trace!(connection = %conn.id(), "Install skipped, already installed");
            return;
        }

        let anchor = self.adapter.anchor();
        let inbound: Arc<dyn Stage> = Arc::new(InboundStage::new(Arc::clone(self)));
        let outbound: Arc<dyn Stage> = Arc::new(OutboundStage::new(Arc::clone(self)));

        let installed = bridge
            .insert_before(anchor, &self.names.inbound, inbound)
            .and_then(|()| bridge.insert_before(anchor, &self.names.outbound, outbound));
        if let Err(e) = installed {
            tracing::warn!(connection = %conn.id(), error = %e, "Failed to install interceptor stages");
            bridge.remove_quietly(&self.names.inbound);
            bridge.remove_quietly(&self.names.outbound);
            handle.set_state(InjectionState::Uninjected);
            return;
        }
        handle.set_state(InjectionState::Active);

        if !self.is_active() {
            // close() ran while the install was in flight.
            bridge.remove_quietly(&self.names.inbound);
            bridge.remove_quietly(&self.names.outbound);
            handle.set_state(InjectionState::Removed);
            self.registry.evict(conn.id());
            tracing::debug!(connection = %conn.id(), "Install undone after close");
            if self.is_active() {
                self.install(conn);
            }
            return;
        }

        metrics::record_install();
        tracing::debug!(connection = %conn.id(), "Interceptor installed");
    }
}
