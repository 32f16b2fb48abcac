//! Per-connection handle.
//!
//! # States
//! ```text
//! Uninjected → InitPending   hijacked (begin or accept)
//! InitPending → Active       inbound/outbound stages installed
//! * → Removed                close()
//! Removed → InitPending      hijacked again after a later begin
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::error::{TapError, WriteError};
use crate::host::{ConnectionId, ConnectionRef, Identity, SessionSender};
use crate::pipeline::{Message, WriteReceipt};

/// Interception state of one connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionState {
    Uninjected = 0,
    InitPending = 1,
    Active = 2,
    Removed = 3,
}

impl From<u8> for InjectionState {
    fn from(val: u8) -> Self {
        match val {
            1 => InjectionState::InitPending,
            2 => InjectionState::Active,
            3 => InjectionState::Removed,
            _ => InjectionState::Uninjected,
        }
    }
}

struct HandleInner {
    id: ConnectionId,
    connection: ConnectionRef,
    identity: ArcSwapOption<Identity>,
    session: ArcSwapOption<Arc<dyn SessionSender>>,
    state: AtomicU8,
}

/// The engine's view of one connection.
///
/// Clones share state. Two handles are equal exactly when they wrap the same
/// connection.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    pub(crate) fn new(connection: ConnectionRef) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: connection.id(),
                connection,
                identity: ArcSwapOption::empty(),
                session: ArcSwapOption::empty(),
                state: AtomicU8::new(InjectionState::Uninjected as u8),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The host connection itself.
    pub fn raw_connection(&self) -> &ConnectionRef {
        &self.inner.connection
    }

    pub fn has_identity(&self) -> bool {
        self.inner.identity.load().is_some()
    }

    /// Bound identity; fails with [`TapError::Unbound`] before login.
    pub fn identity(&self) -> Result<Identity, TapError> {
        self.inner
            .identity
            .load()
            .as_deref()
            .copied()
            .ok_or(TapError::Unbound)
    }

    /// Whether sends go through the host's session send path.
    pub fn has_session(&self) -> bool {
        self.inner.session.load().is_some()
    }

    pub fn injection_state(&self) -> InjectionState {
        InjectionState::from(self.inner.state.load(Ordering::SeqCst))
    }

    /// Send a message to the peer.
    ///
    /// Once the identity has joined, the host's session send path is used;
    /// before that the message is written at the tail of the connection's
    /// pipeline. Either way it passes the outbound interceptor.
    pub fn send(&self, msg: Message) -> WriteReceipt {
        if let Some(session) = self.inner.session.load_full() {
            return session.send(msg);
        }
        if !self.inner.connection.is_open() {
            return WriteReceipt::failed(WriteError::Closed);
        }
        self.inner.connection.send(msg)
    }

    pub(crate) fn bind_identity(&self, identity: Identity) {
        self.inner.identity.store(Some(Arc::new(identity)));
    }

    pub(crate) fn attach_session(&self, session: Arc<dyn SessionSender>) {
        self.inner.session.store(Some(Arc::new(session)));
    }

    pub(crate) fn detach_session(&self) {
        self.inner.session.store(None);
    }

    pub(crate) fn set_state(&self, state: InjectionState) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.inner.id)
            .field("identity", &self.inner.identity.load().as_deref().copied())
            .field("state", &self.injection_state())
            .finish()
    }
}
