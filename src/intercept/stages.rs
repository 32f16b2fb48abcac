//! The four interceptor stages.
//!
//! Each stage handles only its own calls and relays everything else through
//! the default pass-through of its role.

use std::sync::Arc;

use crate::error::{HandlerFault, PipelineError, WriteError};
use crate::host::{Connection, ConnectionRef};
use crate::intercept::slots::{Direction, HandlerError};
use crate::intercept::Engine;
use crate::observability::metrics;
use crate::pipeline::forward;
use crate::pipeline::{Fault, Message, PipelineBridge, Stage, StageCall, StageContext, StageRole, WriteAck};
use crate::registry::{Handle, InjectionState};

/// Report a transform failure and send it down the pipeline as a fault.
fn raise(
    engine: &Engine,
    ctx: &dyn StageContext,
    direction: Direction,
    handle: &Handle,
    error: HandlerError,
) -> (Fault, Result<(), PipelineError>) {
    metrics::record_fault(direction);
    let fault: Fault = Arc::new(HandlerFault {
        direction: direction.as_str(),
        connection: handle.id(),
        source: error,
    });
    let call = match direction {
        Direction::Inbound => "channel_read",
        Direction::Outbound => "write",
    };
    engine.adapter.report_fault(ctx.name(), call, &fault);
    let forwarded = ctx.fire(StageCall::Fault(fault.clone()));
    (fault, forwarded)
}

/// Common handling of non-message calls: faults go to the host's sink, then
/// everything follows the role's pass-through.
fn relay(
    engine: &Engine,
    role: StageRole,
    ctx: &dyn StageContext,
    call: StageCall,
) -> Result<(), PipelineError> {
    if let StageCall::Fault(fault) = &call {
        engine.adapter.report_fault(ctx.name(), call.name(), fault);
    }
    forward::pass_through(role, ctx, call)
}

/// Sits on a listening socket; hijacks every accepted connection before the
/// host wires it.
pub struct AcceptStage {
    engine: Arc<Engine>,
}

impl AcceptStage {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

impl Stage for AcceptStage {
    fn role(&self) -> StageRole {
        StageRole::Inbound
    }

    fn on_call(&self, ctx: &dyn StageContext, call: StageCall) -> Result<(), PipelineError> {
        relay(&self.engine, self.role(), ctx, call)
    }

    fn on_read(&self, ctx: &dyn StageContext, msg: Message) -> Result<(), PipelineError> {
        if let Some(conn) = msg.downcast_ref::<ConnectionRef>() {
            self.engine.registry.remember_pending(conn);
            if let Err(e) = self.engine.hijack(conn) {
                tracing::warn!(connection = %conn.id(), error = %e, "Failed to hijack accepted connection");
            }
        }
        ctx.fire_read(msg)
    }
}

/// One-shot: once attached, schedules the install and removes itself.
pub struct InitStage {
    engine: Arc<Engine>,
}

impl InitStage {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

impl Stage for InitStage {
    fn role(&self) -> StageRole {
        StageRole::Lifecycle
    }

    fn on_call(&self, ctx: &dyn StageContext, call: StageCall) -> Result<(), PipelineError> {
        let StageCall::HandlerAdded = call else {
            return relay(&self.engine, self.role(), ctx, call);
        };
        let Some(conn) = ctx.connection() else {
            return Ok(());
        };

        let bridge = PipelineBridge::for_connection(&conn);
        let engine = Arc::clone(&self.engine);
        let target = Arc::clone(&conn);
        let scheduled = bridge.schedule(move || engine.install(&target));
        bridge.remove_quietly(ctx.name());

        if let Err(e) = scheduled {
            if let Some(handle) = self.engine.registry.get(conn.id()) {
                handle.set_state(InjectionState::Uninjected);
            }
            return Err(e);
        }
        Ok(())
    }
}

/// Applies the inbound transform to every read.
pub struct InboundStage {
    engine: Arc<Engine>,
}

impl InboundStage {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

impl Stage for InboundStage {
    fn role(&self) -> StageRole {
        StageRole::Inbound
    }

    fn on_call(&self, ctx: &dyn StageContext, call: StageCall) -> Result<(), PipelineError> {
        if let (StageCall::Inactive, Some(conn)) = (&call, ctx.connection()) {
            self.engine.registry.evict(conn.id());
        }
        relay(&self.engine, self.role(), ctx, call)
    }

    fn on_read(&self, ctx: &dyn StageContext, msg: Message) -> Result<(), PipelineError> {
        let Some(conn) = ctx.connection() else {
            return ctx.fire_read(msg);
        };
        let handle = self.engine.registry.handle(&conn);
        metrics::record_message(Direction::Inbound);

        match self.engine.slots.slot(Direction::Inbound).apply(&handle, msg) {
            Ok(Some(msg)) => ctx.fire_read(msg),
            Ok(None) => {
                metrics::record_drop(Direction::Inbound);
                tracing::trace!(connection = %handle.id(), "Inbound message dropped");
                Ok(())
            }
            Err(e) => raise(&self.engine, ctx, Direction::Inbound, &handle, e).1,
        }
    }
}

/// Applies the outbound transform to every write.
pub struct OutboundStage {
    engine: Arc<Engine>,
}

impl OutboundStage {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

impl Stage for OutboundStage {
    fn role(&self) -> StageRole {
        StageRole::Outbound
    }

    fn on_call(&self, ctx: &dyn StageContext, call: StageCall) -> Result<(), PipelineError> {
        relay(&self.engine, self.role(), ctx, call)
    }

    fn on_write(
        &self,
        ctx: &dyn StageContext,
        msg: Message,
        ack: WriteAck,
    ) -> Result<(), PipelineError> {
        let Some(conn) = ctx.connection() else {
            return ctx.write(msg, ack);
        };
        let handle = self.engine.registry.handle(&conn);
        metrics::record_message(Direction::Outbound);

        match self.engine.slots.slot(Direction::Outbound).apply(&handle, msg) {
            Ok(Some(msg)) => ctx.write(msg, ack),
            Ok(None) => {
                // The receipt resolves to `Suppressed` once the ack drops.
                metrics::record_drop(Direction::Outbound);
                tracing::trace!(connection = %handle.id(), "Outbound message dropped");
                Ok(())
            }
            Err(e) => {
                let (fault, forwarded) = raise(&self.engine, ctx, Direction::Outbound, &handle, e);
                ack.fail(WriteError::Rejected(fault.to_string()));
                forwarded
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::local::{LocalConnection, LocalServer};
    use crate::host::{HostAdapter, HostListener, Identity, ListenerKey, ListenerRef, SessionSender};
    use crate::intercept::slots::Transform;
    use crate::intercept::StageNames;
    use crate::pipeline::Pipeline;
    use parking_lot::Mutex;

    /// Context bound to one connection that records what was relayed.
    struct ConnContext {
        conn: ConnectionRef,
        seen: Mutex<Vec<String>>,
    }

    impl ConnContext {
        fn new(conn: ConnectionRef) -> Self {
            Self {
                conn,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().clone()
        }
    }

    impl StageContext for ConnContext {
        fn name(&self) -> &str {
            "tap"
        }

        fn connection(&self) -> Option<ConnectionRef> {
            Some(self.conn.clone())
        }

        fn fire_read(&self, msg: Message) -> Result<(), PipelineError> {
            let text = msg.downcast::<String>().unwrap_or_default();
            self.seen.lock().push(format!("read:{text}"));
            Ok(())
        }

        fn fire(&self, call: StageCall) -> Result<(), PipelineError> {
            self.seen.lock().push(format!("fire:{}", call.name()));
            Ok(())
        }

        fn write(&self, msg: Message, ack: WriteAck) -> Result<(), PipelineError> {
            let text = msg.downcast::<String>().unwrap_or_default();
            self.seen.lock().push(format!("write:{text}"));
            ack.succeed();
            Ok(())
        }

        fn invoke(&self, call: StageCall) -> Result<(), PipelineError> {
            self.seen.lock().push(format!("invoke:{}", call.name()));
            Ok(())
        }
    }

    struct Core;

    impl Stage for Core {
        fn role(&self) -> StageRole {
            StageRole::Inbound
        }
    }

    fn server() -> LocalServer {
        LocalServer::new("core", |_: &ConnectionRef| -> Arc<dyn Stage> { Arc::new(Core) })
    }

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::new(Arc::new(server()), StageNames::new("test")))
    }

    /// Host that records every fault reported to it.
    struct FaultSink {
        server: LocalServer,
        faults: Mutex<Vec<String>>,
    }

    impl FaultSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                server: server(),
                faults: Mutex::new(Vec::new()),
            })
        }

        fn faults(&self) -> Vec<String> {
            self.faults.lock().clone()
        }
    }

    impl HostAdapter for FaultSink {
        fn contract_version(&self) -> u32 {
            self.server.contract_version()
        }

        fn anchor(&self) -> &str {
            self.server.anchor()
        }

        fn for_each_listener(&self, f: &mut dyn FnMut(&ListenerRef)) {
            self.server.for_each_listener(f)
        }

        fn for_each_connection(&self, f: &mut dyn FnMut(&ConnectionRef)) {
            self.server.for_each_connection(f)
        }

        fn register_listener(&self, listener: Arc<dyn HostListener>) -> ListenerKey {
            self.server.register_listener(listener)
        }

        fn unregister_listener(&self, key: ListenerKey) {
            self.server.unregister_listener(key)
        }

        fn connection_for(&self, identity: &Identity) -> Option<ConnectionRef> {
            self.server.connection_for(identity)
        }

        fn session_for(&self, identity: &Identity) -> Option<Arc<dyn SessionSender>> {
            self.server.session_for(identity)
        }

        fn report_fault(&self, origin: &str, call: &str, fault: &Fault) {
            self.faults.lock().push(format!("{origin}:{call}:{fault}"));
        }
    }

    fn boom(text: &str) -> StageCall {
        StageCall::Fault(Arc::new(std::io::Error::other(text.to_string())))
    }

    fn context() -> ConnContext {
        ConnContext::new(LocalConnection::new("10.2.0.1:1".parse().unwrap()))
    }

    #[tokio::test]
    async fn inbound_rewrites_and_drops() {
        let engine = engine();
        let stage = InboundStage::new(engine.clone());
        let ctx = context();

        engine.slots.slot(Direction::Inbound).set(Transform::new(|_, msg| {
            match msg.downcast::<String>() {
                Ok(text) if text == "ping" => Ok(Some(Message::new(String::from("pong")))),
                Ok(_) => Ok(None),
                Err(other) => Ok(Some(other)),
            }
        }));

        stage.on_read(&ctx, Message::new(String::from("ping"))).unwrap();
        stage.on_read(&ctx, Message::new(String::from("other"))).unwrap();
        assert_eq!(ctx.seen(), vec!["read:pong"]);
    }

    #[tokio::test]
    async fn outbound_drop_suppresses_receipt() {
        let engine = engine();
        let stage = OutboundStage::new(engine.clone());
        let ctx = context();
        engine
            .slots
            .slot(Direction::Outbound)
            .set(Transform::new(|_, _| Ok(None)));

        let (ack, receipt) = WriteAck::channel();
        stage.on_write(&ctx, Message::new(String::from("x")), ack).unwrap();
        assert_eq!(receipt.wait().await, Err(WriteError::Suppressed));
        assert!(ctx.seen().is_empty());
    }

    #[tokio::test]
    async fn handler_fault_drops_message_and_forwards_fault() {
        let engine = engine();
        let stage = OutboundStage::new(engine.clone());
        let ctx = context();
        engine
            .slots
            .slot(Direction::Outbound)
            .set(Transform::new(|_, _| Err("encode failed".into())));

        let (ack, receipt) = WriteAck::channel();
        stage.on_write(&ctx, Message::new(String::from("x")), ack).unwrap();

        assert_eq!(ctx.seen(), vec!["fire:exception_caught"]);
        match receipt.wait().await {
            Err(WriteError::Rejected(reason)) => assert!(reason.contains("encode failed")),
            other => panic!("unexpected receipt: {other:?}"),
        }
    }

    #[tokio::test]
    async fn inactive_evicts_handle_and_forwards() {
        let engine = engine();
        let stage = InboundStage::new(engine.clone());
        let ctx = context();
        engine.registry.handle(&ctx.conn);
        assert_eq!(engine.registry.len(), 1);

        stage.on_call(&ctx, StageCall::Inactive).unwrap();
        assert!(engine.registry.is_empty());
        assert_eq!(ctx.seen(), vec!["fire:channel_inactive"]);
    }

    #[tokio::test]
    async fn unmapped_calls_are_rejected() {
        let engine = engine();
        let ctx = context();

        let err = InboundStage::new(engine.clone())
            .on_call(&ctx, StageCall::Flush)
            .unwrap_err();
        assert!(matches!(err, PipelineError::ForwardingUnsupported { call: "flush", .. }));

        let err = OutboundStage::new(engine)
            .on_read(&ctx, Message::new(String::new()))
            .unwrap_err();
        assert!(matches!(err, PipelineError::ForwardingUnsupported { call: "channel_read", .. }));
    }

    #[tokio::test]
    async fn listener_faults_reach_the_host_sink() {
        let host = FaultSink::new();
        let engine = Arc::new(Engine::new(host.clone(), StageNames::new("test")));
        let listener = host.server.listen("127.0.0.1:25566".parse().unwrap());
        listener
            .local_pipeline()
            .insert_first("accept", Arc::new(AcceptStage::new(engine)))
            .unwrap();

        listener.local_pipeline().fire(boom("listener boom")).unwrap();
        assert_eq!(host.faults(), vec!["accept:exception_caught:listener boom"]);
    }

    #[tokio::test]
    async fn init_stage_reports_faults_before_it_installs() {
        let host = FaultSink::new();
        let engine = Arc::new(Engine::new(host.clone(), StageNames::new("test")));
        let ctx = context();

        InitStage::new(engine).on_call(&ctx, boom("early boom")).unwrap();
        assert_eq!(host.faults(), vec!["tap:exception_caught:early boom"]);
        assert_eq!(ctx.seen(), vec!["fire:exception_caught"]);
    }

    #[tokio::test]
    async fn stages_are_never_sharable() {
        let engine = engine();
        let stages: [Arc<dyn Stage>; 4] = [
            Arc::new(AcceptStage::new(engine.clone())),
            Arc::new(InitStage::new(engine.clone())),
            Arc::new(InboundStage::new(engine.clone())),
            Arc::new(OutboundStage::new(engine)),
        ];
        assert!(stages.iter().all(|stage| !stage.is_sharable()));
    }
}
