//! Host boundary.
//!
//! # Data Flow
//! ```text
//! Host server (owns listeners, connections, pipelines, executors)
//!     → HostAdapter (versioned view, resolved once at construction)
//!     → Interceptor (begin/close, registry, stages)
//!
//! Host event feed:
//!     Login / Join / Quit / Shutdown → HostListener::on_event
//! ```
//!
//! # Design Decisions
//! - The engine only sees these traits; nothing is discovered lazily on the
//!   message path
//! - Collections are walked through `for_each_*`, so the host keeps its own
//!   locking discipline while listeners and connections come and go
//! - `local` is an in-process host implementing the contract; `tcp` puts it
//!   on real sockets

pub mod local;
pub mod tcp;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::{Fault, Message, Pipeline, SerialExecutor, WriteReceipt};

/// Adapter contract version this engine is built against.
pub const CONTRACT_VERSION: u32 = 1;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough: only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Session identity bound to a connection after it is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(Uuid);

impl Identity {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// A fresh random identity.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for Identity {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for Identity {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A host-owned transport session.
pub trait Connection: Send + Sync + 'static {
    fn id(&self) -> ConnectionId;

    fn pipeline(&self) -> Arc<dyn Pipeline>;

    fn executor(&self) -> Arc<dyn SerialExecutor>;

    fn remote_addr(&self) -> Option<SocketAddr>;

    fn is_open(&self) -> bool;

    /// Write `msg` from the tail of the pipeline and flush it.
    fn send(&self, msg: Message) -> WriteReceipt;
}

pub type ConnectionRef = Arc<dyn Connection>;

/// A listening socket; each accepted connection is read through its pipeline
/// as a [`Message`] wrapping the new [`ConnectionRef`].
pub trait ListenerSocket: Send + Sync + 'static {
    fn local_addr(&self) -> SocketAddr;

    fn pipeline(&self) -> Arc<dyn Pipeline>;
}

pub type ListenerRef = Arc<dyn ListenerSocket>;

/// Session-level send path, available once an identity has fully joined.
pub trait SessionSender: Send + Sync {
    fn send(&self, msg: Message) -> WriteReceipt;
}

/// Events from the host's session layer.
#[derive(Clone)]
pub enum HostEvent {
    /// An identity was confirmed for the connection from `address`.
    Login { identity: Identity, address: SocketAddr },
    /// The identity finished joining; `session` is its direct send path.
    Join {
        identity: Identity,
        session: Arc<dyn SessionSender>,
    },
    /// The identity disconnected.
    Quit { identity: Identity },
    /// The host (or the component owning the interceptor) is shutting down.
    Shutdown,
}

impl fmt::Debug for HostEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostEvent::Login { identity, address } => f
                .debug_struct("Login")
                .field("identity", identity)
                .field("address", address)
                .finish(),
            HostEvent::Join { identity, .. } => f
                .debug_struct("Join")
                .field("identity", identity)
                .finish_non_exhaustive(),
            HostEvent::Quit { identity } => {
                f.debug_struct("Quit").field("identity", identity).finish()
            }
            HostEvent::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Subscriber to the host event feed.
pub trait HostListener: Send + Sync {
    fn on_event(&self, event: &HostEvent);
}

/// Registration token returned by [`HostAdapter::register_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(pub u64);

/// Versioned view of a host server.
pub trait HostAdapter: Send + Sync + 'static {
    fn contract_version(&self) -> u32;

    /// Name of the host's own message handling stage.
    fn anchor(&self) -> &str;

    /// Visit every listening socket while holding the host's list lock.
    fn for_each_listener(&self, f: &mut dyn FnMut(&ListenerRef));

    /// Visit every live connection while holding the host's list lock.
    fn for_each_connection(&self, f: &mut dyn FnMut(&ConnectionRef));

    fn register_listener(&self, listener: Arc<dyn HostListener>) -> ListenerKey;

    fn unregister_listener(&self, key: ListenerKey);

    /// Connection currently bound to `identity`, if it is available.
    fn connection_for(&self, identity: &Identity) -> Option<ConnectionRef>;

    /// Session send path of a joined `identity`, for hosts that expose one.
    fn session_for(&self, _identity: &Identity) -> Option<Arc<dyn SessionSender>> {
        None
    }

    /// Logging sink for faults raised inside stages.
    fn report_fault(&self, origin: &str, call: &str, fault: &Fault) {
        tracing::error!(stage = origin, call, error = %fault, "Fault raised in pipeline stage");
    }
}
