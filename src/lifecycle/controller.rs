//! The public interceptor.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::validation::is_valid_owner;
use crate::config::TapConfig;
use crate::error::{BindingError, PipelineError, TapError};
use crate::host::{
    Connection, ConnectionRef, HostAdapter, Identity, ListenerKey, ListenerRef, ListenerSocket,
    CONTRACT_VERSION,
};
use crate::intercept::{AcceptStage, Direction, Engine, HandlerResult, StageNames, Transform};
use crate::lifecycle::events::SupportListener;
use crate::pipeline::{Message, PipelineBridge, RemoveOutcome, Stage};
use crate::registry::Handle;

/// Lifecycle state guarded by the lifecycle lock.
#[derive(Default)]
struct Lifecycle {
    /// Present exactly while interception is begun.
    listener: Option<ListenerKey>,
}

pub(crate) struct Shared {
    pub(crate) engine: Arc<Engine>,
    lifecycle: Mutex<Lifecycle>,
}

impl Shared {
    fn begin(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.listener.is_some() {
            tracing::debug!("Interception already begun");
            return;
        }

        let engine = &self.engine;
        let adapter = &engine.adapter;
        engine.set_active(true);

        let support = Arc::new(SupportListener::new(Arc::downgrade(self)));
        lifecycle.listener = Some(adapter.register_listener(support));

        // Listening sockets first: a connection accepted from here on is
        // hijacked by the accept stage, so none slips between the two walks.
        let mut listeners = 0usize;
        adapter.for_each_listener(&mut |listener: &ListenerRef| {
            let bridge = PipelineBridge::for_listener(listener);
            let stage: Arc<dyn Stage> = Arc::new(AcceptStage::new(Arc::clone(engine)));
            match bridge.insert_first(&engine.names.accept, stage) {
                Ok(()) => listeners += 1,
                Err(PipelineError::DuplicateStage(_)) => {
                    tracing::debug!(address = %listener.local_addr(), "Accept stage already present");
                }
                Err(e) => {
                    tracing::warn!(address = %listener.local_addr(), error = %e, "Failed to inject accept stage");
                }
            }
        });

        let mut hijacked = 0usize;
        adapter.for_each_connection(&mut |conn: &ConnectionRef| match engine.hijack(conn) {
            Ok(true) => hijacked += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(connection = %conn.id(), error = %e, "Failed to hijack live connection");
            }
        });

        tracing::info!(
            listeners,
            connections = hijacked,
            "Interception begun"
        );
    }

    pub(crate) fn close(&self) {
        let mut lifecycle = self.lifecycle.lock();
        let Some(key) = lifecycle.listener.take() else {
            tracing::debug!("Interception not begun, nothing to close");
            return;
        };

        let engine = &self.engine;
        let adapter = &engine.adapter;
        engine.set_active(false);
        adapter.unregister_listener(key);

        let drained = engine.registry.drain();

        adapter.for_each_listener(&mut |listener: &ListenerRef| {
            PipelineBridge::for_listener(listener).remove_quietly(&engine.names.accept);
        });

        let mut visited = HashSet::new();
        let mut removed = 0usize;
        let mut failed = 0usize;
        let mut strip = |conn: &ConnectionRef| {
            if !visited.insert(conn.id()) {
                return;
            }
            let bridge = PipelineBridge::for_connection(conn);
            for name in engine.names.connection_stages() {
                match bridge.remove_quietly(name) {
                    RemoveOutcome::Removed => removed += 1,
                    RemoveOutcome::Failed => failed += 1,
                    RemoveOutcome::AlreadyRemoved => {}
                }
            }
        };
        adapter.for_each_connection(&mut strip);
        for handle in &drained {
            strip(handle.raw_connection());
        }

        tracing::info!(
            connections = visited.len(),
            stages_removed = removed,
            stages_failed = failed,
            "Interception closed"
        );
    }

    fn has_begun(&self) -> bool {
        self.lifecycle.lock().listener.is_some()
    }
}

/// Transparent interceptor for every connection of one host.
///
/// Construction validates the host adapter once; [`begin`](Self::begin)
/// starts intercepting live and future connections and
/// [`close`](Self::close) undoes it. Both are idempotent, and transforms
/// survive a `close`/`begin` cycle. Dropping the interceptor closes it.
pub struct Interceptor {
    shared: Arc<Shared>,
}

impl Interceptor {
    /// Bind to `adapter`, naming every installed stage after `owner`.
    pub fn new(owner: &str, adapter: Arc<dyn HostAdapter>) -> Result<Self, BindingError> {
        let found = adapter.contract_version();
        if found != CONTRACT_VERSION {
            return Err(BindingError::UnsupportedContract {
                found,
                expected: CONTRACT_VERSION,
            });
        }
        if adapter.anchor().trim().is_empty() {
            return Err(BindingError::MissingAnchor);
        }
        if !is_valid_owner(owner) {
            return Err(BindingError::InvalidOwner(owner.to_string()));
        }

        let names = StageNames::new(owner);
        tracing::debug!(owner, anchor = adapter.anchor(), inbound = %names.inbound, "Interceptor bound");
        Ok(Self {
            shared: Arc::new(Shared {
                engine: Arc::new(Engine::new(adapter, names)),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        })
    }

    pub fn from_config(config: &TapConfig, adapter: Arc<dyn HostAdapter>) -> Result<Self, BindingError> {
        Self::new(&config.owner, adapter)
    }

    /// Replace the inbound transform. Takes effect for the next message.
    pub fn set_inbound_handler<F>(&self, handler: F)
    where
        F: Fn(&Handle, Message) -> HandlerResult + Send + Sync + 'static,
    {
        self.slot_set(Direction::Inbound, Transform::new(handler));
    }

    /// Replace the outbound transform. Takes effect for the next message.
    pub fn set_outbound_handler<F>(&self, handler: F)
    where
        F: Fn(&Handle, Message) -> HandlerResult + Send + Sync + 'static,
    {
        self.slot_set(Direction::Outbound, Transform::new(handler));
    }

    pub fn clear_inbound_handler(&self) {
        self.shared.engine.slots.slot(Direction::Inbound).clear();
    }

    pub fn clear_outbound_handler(&self) {
        self.shared.engine.slots.slot(Direction::Outbound).clear();
    }

    fn slot_set(&self, direction: Direction, transform: Transform) {
        self.shared.engine.slots.slot(direction).set(transform);
        tracing::debug!(%direction, "Handler replaced");
    }

    pub fn begin(&self) {
        self.shared.begin();
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn has_begun(&self) -> bool {
        self.shared.has_begun()
    }

    /// Handle of the connection bound to `identity`.
    pub fn connection(&self, identity: &Identity) -> Result<Handle, TapError> {
        let engine = &self.shared.engine;
        engine.registry.handle_by_identity(identity, engine.adapter.as_ref())
    }

    pub fn stage_names(&self) -> &StageNames {
        &self.shared.engine.names
    }

    /// Drop registry entries of connections that have closed.
    pub fn sweep(&self) -> usize {
        self.shared.engine.registry.sweep()
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("names", &self.shared.engine.names)
            .field("begun", &self.has_begun())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::local::{LocalConnection, LocalServer};
    use crate::pipeline::StageRole;

    struct Core;

    impl Stage for Core {
        fn role(&self) -> StageRole {
            StageRole::Inbound
        }
    }

    fn server() -> LocalServer {
        LocalServer::new("core", |_: &ConnectionRef| -> Arc<dyn Stage> { Arc::new(Core) })
    }

    #[test]
    fn rejects_unsupported_contract() {
        let server = server();
        server.set_contract_version(2);
        let err = Interceptor::new("tap", Arc::new(server)).unwrap_err();
        assert_eq!(err, BindingError::UnsupportedContract { found: 2, expected: 1 });
    }

    #[test]
    fn rejects_missing_anchor_and_bad_owner() {
        let anchorless = LocalServer::new("", |_: &ConnectionRef| -> Arc<dyn Stage> { Arc::new(Core) });
        assert_eq!(
            Interceptor::new("tap", Arc::new(anchorless)).unwrap_err(),
            BindingError::MissingAnchor
        );
        assert_eq!(
            Interceptor::new("a b", Arc::new(server())).unwrap_err(),
            BindingError::InvalidOwner("a b".into())
        );
    }

    #[test]
    fn stage_names_are_unique_per_instance() {
        let first = Interceptor::new("tap", Arc::new(server())).unwrap();
        let second = Interceptor::new("tap", Arc::new(server())).unwrap();
        assert_ne!(first.stage_names(), second.stage_names());
        assert!(first.stage_names().inbound.starts_with("tap_tap_in_"));
    }

    #[test]
    fn begin_and_close_are_idempotent_without_connections() {
        let interceptor = Interceptor::new("tap", Arc::new(server())).unwrap();
        assert!(!interceptor.has_begun());
        interceptor.close();
        interceptor.begin();
        interceptor.begin();
        assert!(interceptor.has_begun());
        interceptor.close();
        interceptor.close();
        assert!(!interceptor.has_begun());
    }

    #[tokio::test]
    async fn closed_connections_leave_the_registry() {
        let server = server();
        let listener = server.listen("127.0.0.1:25568".parse().unwrap());
        let interceptor = Interceptor::new("tap", Arc::new(server.clone())).unwrap();
        interceptor.begin();

        let conn = server.accept(&listener, "10.3.0.1:1".parse().unwrap()).unwrap();
        conn.idle().await;
        let registry = &interceptor.shared.engine.registry;
        assert_eq!(registry.len(), 1);

        conn.close();
        conn.idle().await;
        assert!(registry.is_empty());

        // Never intercepted, so only a sweep notices it closed.
        let quiet = LocalConnection::new("10.3.0.2:1".parse().unwrap());
        let quiet_ref: ConnectionRef = quiet.clone();
        registry.handle(&quiet_ref);
        quiet.close();
        assert_eq!(interceptor.sweep(), 1);
        assert!(registry.is_empty());
    }
}
