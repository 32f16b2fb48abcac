//! Connection, pending-address and identity maps.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::TapError;
use crate::host::{Connection, ConnectionId, ConnectionRef, HostAdapter, Identity, SessionSender};
use crate::registry::handle::{Handle, InjectionState};

/// Shared registry of every connection the engine has seen.
///
/// Hot paths take the gate shared; only [`drain`](Self::drain) takes it
/// exclusively, so a drain never interleaves with a half-finished insert.
#[derive(Default)]
pub struct ConnectionRegistry {
    gate: RwLock<()>,
    handles: DashMap<ConnectionId, Handle>,
    /// Accepted connections waiting for a login, keyed by peer address.
    pending: DashMap<SocketAddr, Weak<dyn Connection>>,
    identities: DashMap<Identity, ConnectionRef>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handle for `conn`, created on first use.
    pub fn handle(&self, conn: &ConnectionRef) -> Handle {
        let _gate = self.gate.read();
        self.handle_locked(conn)
    }

    fn handle_locked(&self, conn: &ConnectionRef) -> Handle {
        self.handles
            .entry(conn.id())
            .or_insert_with(|| Handle::new(conn.clone()))
            .clone()
    }

    /// Existing handle by connection id.
    pub fn get(&self, id: ConnectionId) -> Option<Handle> {
        self.handles.get(&id).map(|h| h.clone())
    }

    /// Remember a freshly accepted connection until its login arrives.
    pub fn remember_pending(&self, conn: &ConnectionRef) {
        let Some(addr) = conn.remote_addr() else {
            return;
        };
        let _gate = self.gate.read();
        self.pending.insert(addr, Arc::downgrade(conn));
    }

    /// Correlate a login from `address` with the connection that address
    /// was accepted on, binding `identity` to its handle.
    pub fn bind_pending(&self, address: SocketAddr, identity: Identity) -> Option<Handle> {
        let _gate = self.gate.read();
        let (_, weak) = self.pending.remove(&address)?;
        let conn = weak.upgrade()?;
        self.identities.insert(identity, conn.clone());
        let handle = self.handle_locked(&conn);
        handle.bind_identity(identity);
        tracing::debug!(identity = %identity, connection = %conn.id(), "Identity bound");
        Some(handle)
    }

    /// Resolve `identity` to a live connection.
    ///
    /// Bound identities are answered from the cache; anything else is asked
    /// of the host, which only knows identities that have fully joined. A
    /// connection found through the host also gets the host's session send
    /// path attached.
    pub fn handle_by_identity(
        &self,
        identity: &Identity,
        adapter: &dyn HostAdapter,
    ) -> Result<Handle, TapError> {
        let cached = self
            .identities
            .get(identity)
            .map(|c| c.clone())
            .filter(|c| c.is_open());
        let (conn, from_host) = match cached {
            Some(conn) => (conn, false),
            None => {
                let conn = adapter
                    .connection_for(identity)
                    .ok_or(TapError::NotFound(*identity))?;
                (conn, true)
            }
        };

        let _gate = self.gate.read();
        self.identities.insert(*identity, conn.clone());
        let handle = self.handle_locked(&conn);
        handle.bind_identity(*identity);
        if from_host {
            // A joined identity whose Join event we never saw.
            if let Some(session) = adapter.session_for(identity) {
                handle.attach_session(session);
            }
        }
        Ok(handle)
    }

    /// Attach the direct send path of a joined identity.
    pub fn attach_session(
        &self,
        identity: &Identity,
        session: Arc<dyn SessionSender>,
        adapter: &dyn HostAdapter,
    ) -> Result<Handle, TapError> {
        let handle = self.handle_by_identity(identity, adapter)?;
        handle.attach_session(session);
        Ok(handle)
    }

    /// Forget an identity binding (the identity quit).
    pub fn unbind(&self, identity: &Identity) -> Option<Handle> {
        let (_, conn) = self.identities.remove(identity)?;
        let handle = self.get(conn.id())?;
        handle.detach_session();
        Some(handle)
    }

    /// Drop every trace of one connection.
    pub fn evict(&self, id: ConnectionId) -> Option<Handle> {
        let (_, handle) = self.handles.remove(&id)?;
        self.identities.retain(|_, conn| conn.id() != id);
        self.pending
            .retain(|_, weak| weak.upgrade().is_some_and(|conn| conn.id() != id));
        tracing::trace!(connection = %id, "Handle evicted");
        Some(handle)
    }

    /// Evict entries whose connection is confirmed closed or gone. Returns the
    /// number of handles evicted.
    pub fn sweep(&self) -> usize {
        let before = self.handles.len();
        self.handles.retain(|_, handle| handle.raw_connection().is_open());
        self.identities.retain(|_, conn| conn.is_open());
        self.pending
            .retain(|_, weak| weak.upgrade().is_some_and(|conn| conn.is_open()));
        let evicted = before.saturating_sub(self.handles.len());
        if evicted > 0 {
            tracing::debug!(evicted, "Swept closed connections");
        }
        evicted
    }

    /// Clear every map, marking each handle removed. Returns the handles.
    pub fn drain(&self) -> Vec<Handle> {
        let _gate = self.gate.write();
        let handles: Vec<Handle> = self.handles.iter().map(|h| h.clone()).collect();
        self.handles.clear();
        self.pending.clear();
        self.identities.clear();
        for handle in &handles {
            handle.set_state(InjectionState::Removed);
        }
        handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::local::{LocalConnection, LocalServer};
    use crate::pipeline::{Message, Stage, StageRole};

    struct Core;

    impl Stage for Core {
        fn role(&self) -> StageRole {
            StageRole::Inbound
        }
    }

    fn server() -> LocalServer {
        LocalServer::new("core", |_: &ConnectionRef| -> Arc<dyn Stage> { Arc::new(Core) })
    }

    fn conn_ref(conn: &Arc<LocalConnection>) -> ConnectionRef {
        conn.clone()
    }

    #[tokio::test]
    async fn one_handle_per_connection() {
        let registry = ConnectionRegistry::new();
        let conn = conn_ref(&LocalConnection::new("10.0.0.1:1".parse().unwrap()));

        let first = registry.handle(&conn);
        let second = registry.handle(&conn);
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(first.injection_state(), InjectionState::Uninjected);
        assert!(matches!(first.identity(), Err(TapError::Unbound)));
    }

    #[tokio::test]
    async fn login_binds_pending_connection() {
        let registry = ConnectionRegistry::new();
        let addr: SocketAddr = "10.0.0.2:2".parse().unwrap();
        let conn = conn_ref(&LocalConnection::new(addr));
        let identity = Identity::random();

        registry.remember_pending(&conn);
        let handle = registry.bind_pending(addr, identity).unwrap();
        assert_eq!(handle.identity().unwrap(), identity);
        assert!(registry.bind_pending(addr, identity).is_none());

        let found = registry.handle_by_identity(&identity, &server()).unwrap();
        assert_eq!(found, handle);

        assert_eq!(registry.unbind(&identity), Some(handle));
        assert!(matches!(
            registry.handle_by_identity(&identity, &server()),
            Err(TapError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn pending_entry_vanishes_with_connection() {
        let registry = ConnectionRegistry::new();
        let addr: SocketAddr = "10.0.0.3:3".parse().unwrap();
        let conn = LocalConnection::new(addr);
        registry.remember_pending(&conn_ref(&conn));
        drop(conn);
        assert!(registry.bind_pending(addr, Identity::random()).is_none());
    }

    #[tokio::test]
    async fn sweep_and_evict() {
        let registry = ConnectionRegistry::new();
        let open = LocalConnection::new("10.0.0.4:4".parse().unwrap());
        let closed = LocalConnection::new("10.0.0.5:5".parse().unwrap());
        let kept = registry.handle(&conn_ref(&open));
        registry.handle(&conn_ref(&closed));

        closed.close();
        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.evict(open.id()), Some(kept));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn drain_marks_handles_removed() {
        let registry = ConnectionRegistry::new();
        let conn = conn_ref(&LocalConnection::new("10.0.0.6:6".parse().unwrap()));
        let handle = registry.handle(&conn);
        handle.set_state(InjectionState::InitPending);

        let drained = registry.drain();
        assert_eq!(drained, vec![handle.clone()]);
        assert_eq!(handle.injection_state(), InjectionState::Removed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn host_lookup_attaches_session_send_path() {
        let server = server();
        let listener = server.listen("127.0.0.1:25567".parse().unwrap());
        let conn = server.accept(&listener, "10.0.0.7:7".parse().unwrap()).unwrap();
        conn.idle().await;
        let identity = Identity::random();
        server.login(identity, &conn);
        assert!(server.join(identity));

        let registry = ConnectionRegistry::new();
        let handle = registry.handle_by_identity(&identity, &server).unwrap();
        assert!(handle.has_session());
        assert_eq!(handle.send(Message::new(String::from("hi"))).wait().await, Ok(()));

        // Cached lookups keep the attached session.
        let again = registry.handle_by_identity(&identity, &server).unwrap();
        assert!(again.has_session());
    }
}
