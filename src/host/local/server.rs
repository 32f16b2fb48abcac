//! In-process host server.
//!
//! # Responsibilities
//! - Own listening sockets and live connections behind list locks
//! - Wire each accepted connection: host initializer → core stage at the anchor
//! - Track logins and joins, and publish them on the event feed
//! - Implement [`HostAdapter`] over all of the above

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{PipelineError, WriteError};
use crate::host::local::connection::LocalConnection;
use crate::host::local::pipeline::{Endpoint, LocalPipeline};
use crate::host::{
    Connection, ConnectionId, ConnectionRef, HostAdapter, HostEvent, HostListener, Identity,
    ListenerKey, ListenerRef, ListenerSocket, SessionSender, CONTRACT_VERSION,
};
use crate::pipeline::{Message, Pipeline, Stage, StageCall, StageContext, StageRole, WriteAck, WriteReceipt};

/// Builds the host's own message handler for a new connection.
pub type CoreFactory = dyn Fn(&ConnectionRef) -> Arc<dyn Stage> + Send + Sync;

/// Name of the one-shot stage that installs the core handler.
const HOST_INIT: &str = "host_init";

/// A listening socket of the local host.
pub struct LocalListener {
    addr: SocketAddr,
    pipeline: Arc<LocalPipeline>,
}

impl LocalListener {
    pub fn local_pipeline(&self) -> &Arc<LocalPipeline> {
        &self.pipeline
    }
}

impl ListenerSocket for LocalListener {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn pipeline(&self) -> Arc<dyn Pipeline> {
        self.pipeline.clone()
    }
}

/// Login state of an identity.
struct SessionEntry {
    connection: Weak<LocalConnection>,
    joined: bool,
}

struct ServerInner {
    anchor: String,
    core: Box<CoreFactory>,
    contract_version: AtomicU32,
    listeners: Mutex<Vec<Arc<LocalListener>>>,
    connections: Mutex<Vec<Arc<LocalConnection>>>,
    /// Connections read into a listener pipeline but not yet wired.
    accepting: DashMap<ConnectionId, Arc<LocalConnection>>,
    sessions: DashMap<Identity, SessionEntry>,
    subscribers: Mutex<Vec<(ListenerKey, Arc<dyn HostListener>)>>,
    next_key: AtomicU64,
}

/// Cheaply cloneable handle to an in-process host server.
#[derive(Clone)]
pub struct LocalServer {
    inner: Arc<ServerInner>,
}

impl LocalServer {
    /// `core` builds the stage installed under `anchor` on every connection.
    pub fn new<F>(anchor: impl Into<String>, core: F) -> Self
    where
        F: Fn(&ConnectionRef) -> Arc<dyn Stage> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ServerInner {
                anchor: anchor.into(),
                core: Box::new(core),
                contract_version: AtomicU32::new(CONTRACT_VERSION),
                listeners: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
                accepting: DashMap::new(),
                sessions: DashMap::new(),
                subscribers: Mutex::new(Vec::new()),
                next_key: AtomicU64::new(1),
            }),
        }
    }

    /// Advertise a different adapter contract version.
    pub fn set_contract_version(&self, version: u32) {
        self.inner.contract_version.store(version, Ordering::SeqCst);
    }

    /// Open a listening socket.
    pub fn listen(&self, addr: SocketAddr) -> Arc<LocalListener> {
        let acceptor = Arc::new(Acceptor {
            server: Arc::downgrade(&self.inner),
        });
        let listener = Arc::new(LocalListener {
            addr,
            pipeline: LocalPipeline::new(None, acceptor, true),
        });
        self.inner.listeners.lock().push(listener.clone());
        tracing::info!(address = %addr, "Listener opened");
        listener
    }

    /// Accept a connection from `remote` on `listener`.
    ///
    /// The new connection is read through the listener's pipeline; it is
    /// wired and registered once the read reaches the end of that pipeline.
    pub fn accept(
        &self,
        listener: &LocalListener,
        remote: SocketAddr,
    ) -> Result<Arc<LocalConnection>, PipelineError> {
        let conn = LocalConnection::new(remote);
        self.inner.accepting.insert(conn.id(), conn.clone());

        let as_ref: ConnectionRef = conn.clone();
        let result = listener.pipeline.fire_read(Message::new(as_ref));
        if self.inner.accepting.remove(&conn.id()).is_some() {
            tracing::warn!(connection = %conn.id(), "Accepted connection was never wired, closing");
            conn.close();
        }
        result?;
        tracing::debug!(connection = %conn.id(), remote = %remote, "Connection accepted");
        Ok(conn)
    }

    /// Live connections, in accept order.
    pub fn connections(&self) -> Vec<Arc<LocalConnection>> {
        self.inner.connections.lock().clone()
    }

    /// Confirm `identity` for `conn` and publish the login.
    pub fn login(&self, identity: Identity, conn: &Arc<LocalConnection>) {
        self.inner.sessions.insert(
            identity,
            SessionEntry {
                connection: Arc::downgrade(conn),
                joined: false,
            },
        );
        tracing::info!(identity = %identity, connection = %conn.id(), "Login");
        self.dispatch(&HostEvent::Login {
            identity,
            address: conn.remote_addr().unwrap_or_else(unspecified_addr),
        });
    }

    /// Finish joining a logged-in identity. Returns `false` if it never
    /// logged in or its connection is gone.
    pub fn join(&self, identity: Identity) -> bool {
        let connection = match self.inner.sessions.get_mut(&identity) {
            Some(mut entry) => match entry.connection.upgrade() {
                Some(conn) => {
                    entry.joined = true;
                    conn
                }
                None => return false,
            },
            None => return false,
        };

        tracing::info!(identity = %identity, connection = %connection.id(), "Join");
        let session: Arc<dyn SessionSender> = Arc::new(LocalSession {
            connection: Arc::downgrade(&connection),
        });
        self.dispatch(&HostEvent::Join { identity, session });
        true
    }

    /// Drop a connection: publish quits for its identities and close it.
    pub fn disconnect(&self, conn: &Arc<LocalConnection>) {
        self.inner
            .connections
            .lock()
            .retain(|c| c.id() != conn.id());

        let mut gone = Vec::new();
        self.inner.sessions.retain(|identity, entry| {
            let same = entry
                .connection
                .upgrade()
                .map_or(true, |c| c.id() == conn.id());
            if same {
                gone.push(*identity);
            }
            !same
        });
        for identity in gone {
            self.dispatch(&HostEvent::Quit { identity });
        }

        if conn.close() {
            tracing::debug!(connection = %conn.id(), "Connection disconnected");
        }
    }

    /// Publish shutdown, then close every connection.
    pub fn shutdown(&self) {
        tracing::info!("Host shutting down");
        self.dispatch(&HostEvent::Shutdown);
        let connections = std::mem::take(&mut *self.inner.connections.lock());
        for conn in connections {
            conn.close();
        }
        self.inner.sessions.clear();
    }

    fn dispatch(&self, event: &HostEvent) {
        // Subscribers may unregister themselves while handling the event.
        let subscribers: Vec<_> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in subscribers {
            listener.on_event(event);
        }
    }
}

fn unspecified_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

impl HostAdapter for LocalServer {
    fn contract_version(&self) -> u32 {
        self.inner.contract_version.load(Ordering::SeqCst)
    }

    fn anchor(&self) -> &str {
        &self.inner.anchor
    }

    fn for_each_listener(&self, f: &mut dyn FnMut(&ListenerRef)) {
        let listeners = self.inner.listeners.lock();
        for listener in listeners.iter() {
            let listener: ListenerRef = listener.clone();
            f(&listener);
        }
    }

    fn for_each_connection(&self, f: &mut dyn FnMut(&ConnectionRef)) {
        let connections = self.inner.connections.lock();
        for conn in connections.iter() {
            let conn: ConnectionRef = conn.clone();
            f(&conn);
        }
    }

    fn register_listener(&self, listener: Arc<dyn HostListener>) -> ListenerKey {
        let key = ListenerKey(self.inner.next_key.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.lock().push((key, listener));
        key
    }

    fn unregister_listener(&self, key: ListenerKey) {
        self.inner.subscribers.lock().retain(|(k, _)| *k != key);
    }

    fn connection_for(&self, identity: &Identity) -> Option<ConnectionRef> {
        let entry = self.inner.sessions.get(identity)?;
        if !entry.joined {
            return None;
        }
        let conn = entry.connection.upgrade()?;
        if !conn.is_open() {
            return None;
        }
        Some(conn)
    }

    fn session_for(&self, identity: &Identity) -> Option<Arc<dyn SessionSender>> {
        let entry = self.inner.sessions.get(identity)?;
        if !entry.joined {
            return None;
        }
        let conn = entry.connection.upgrade()?;
        if !conn.is_open() {
            return None;
        }
        Some(Arc::new(LocalSession {
            connection: Arc::downgrade(&conn),
        }))
    }
}

/// End of a listener pipeline: wires and registers accepted connections.
struct Acceptor {
    server: Weak<ServerInner>,
}

impl Endpoint for Acceptor {
    fn write(&self, _msg: Message, ack: WriteAck) {
        ack.fail(WriteError::Rejected("listening sockets do not write".into()));
    }

    fn read(&self, msg: Message) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let accepted = match msg.downcast::<ConnectionRef>() {
            Ok(accepted) => accepted,
            Err(other) => {
                tracing::warn!(message = other.type_name(), "Listener read a non-connection message");
                return;
            }
        };
        let Some((_, conn)) = server.accepting.remove(&accepted.id()) else {
            tracing::warn!(connection = %accepted.id(), "Accepted connection is unknown");
            return;
        };

        let initializer = Arc::new(HostInitializer {
            anchor: server.anchor.clone(),
            core: (server.core)(&accepted),
        });
        if let Err(e) = conn.local_pipeline().insert_last(HOST_INIT, initializer) {
            tracing::error!(connection = %conn.id(), error = %e, "Failed to wire connection");
            conn.close();
            return;
        }
        server.connections.lock().push(conn.clone());
        if let Err(e) = conn.register() {
            tracing::error!(connection = %conn.id(), error = %e, "Failed to register connection");
        }
    }
}

/// Installs the core handler under the anchor name, then removes itself.
struct HostInitializer {
    anchor: String,
    core: Arc<dyn Stage>,
}

impl Stage for HostInitializer {
    fn role(&self) -> StageRole {
        StageRole::Lifecycle
    }

    fn on_call(&self, ctx: &dyn StageContext, call: StageCall) -> Result<(), PipelineError> {
        match call {
            StageCall::HandlerAdded => {
                let Some(conn) = ctx.connection() else {
                    return Ok(());
                };
                let pipeline = conn.pipeline();
                pipeline.insert_last(&self.anchor, self.core.clone())?;
                pipeline.remove(ctx.name())?;
                Ok(())
            }
            other => crate::pipeline::forward::pass_through(self.role(), ctx, other),
        }
    }
}

/// Direct send path of a joined identity.
struct LocalSession {
    connection: Weak<LocalConnection>,
}

impl SessionSender for LocalSession {
    fn send(&self, msg: Message) -> WriteReceipt {
        match self.connection.upgrade() {
            Some(conn) => conn.send(msg),
            None => WriteReceipt::failed(WriteError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Core stage that echoes strings back.
    struct Echo;

    impl Stage for Echo {
        fn role(&self) -> StageRole {
            StageRole::Inbound
        }

        fn on_call(&self, _ctx: &dyn StageContext, _call: StageCall) -> Result<(), PipelineError> {
            Ok(())
        }

        fn on_read(&self, ctx: &dyn StageContext, msg: Message) -> Result<(), PipelineError> {
            ctx.write(msg, WriteAck::detached())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl HostListener for Recorder {
        fn on_event(&self, event: &HostEvent) {
            let tag = match event {
                HostEvent::Login { .. } => "login",
                HostEvent::Join { .. } => "join",
                HostEvent::Quit { .. } => "quit",
                HostEvent::Shutdown => "shutdown",
            };
            self.0.lock().push(tag.to_string());
        }
    }

    fn server() -> (LocalServer, Arc<LocalListener>) {
        let server = LocalServer::new("core", |_: &ConnectionRef| -> Arc<dyn Stage> { Arc::new(Echo) });
        let listener = server.listen("127.0.0.1:25565".parse().unwrap());
        (server, listener)
    }

    #[tokio::test]
    async fn accepted_connection_is_wired_with_core() {
        let (server, listener) = server();
        let conn = server.accept(&listener, "10.0.0.1:5000".parse().unwrap()).unwrap();
        let mut outbox = conn.take_outbox().unwrap();

        conn.receive(Message::new(String::from("hi"))).unwrap();
        conn.idle().await;

        assert_eq!(conn.local_pipeline().names(), vec!["core"]);
        let echoed = outbox.recv().await.unwrap();
        assert_eq!(echoed.downcast_ref::<String>().map(String::as_str), Some("hi"));
        assert_eq!(server.connections().len(), 1);
    }

    #[tokio::test]
    async fn identity_is_available_only_after_join() {
        let (server, listener) = server();
        let recorder = Arc::new(Recorder::default());
        let key = server.register_listener(recorder.clone());
        let conn = server.accept(&listener, "10.0.0.2:5000".parse().unwrap()).unwrap();
        let identity = Identity::random();

        server.login(identity, &conn);
        assert!(server.connection_for(&identity).is_none());
        assert!(server.join(identity));
        let found = server.connection_for(&identity).unwrap();
        assert_eq!(found.id(), conn.id());

        server.disconnect(&conn);
        assert!(server.connection_for(&identity).is_none());
        assert!(server.connections().is_empty());

        server.unregister_listener(key);
        server.shutdown();
        assert_eq!(*recorder.0.lock(), vec!["login", "join", "quit"]);
    }

    #[tokio::test]
    async fn adapter_walks_listeners_and_connections() {
        let (server, listener) = server();
        server.accept(&listener, "10.0.0.3:5000".parse().unwrap()).unwrap();
        server.accept(&listener, "10.0.0.4:5000".parse().unwrap()).unwrap();

        let mut listeners = 0;
        server.for_each_listener(&mut |_: &ListenerRef| listeners += 1);
        let mut connections = 0;
        server.for_each_connection(&mut |_: &ConnectionRef| connections += 1);

        assert_eq!((listeners, connections), (1, 2));
        assert_eq!(server.contract_version(), CONTRACT_VERSION);
        assert_eq!(server.anchor(), "core");
    }
}
