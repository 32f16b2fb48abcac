//! Pass-through forwarding for stage calls.
//!
//! A stage relays whatever it does not handle to the next participant in its
//! direction. Registration callbacks are absorbed, faults always continue
//! towards the tail, and a call that has no route for the stage's role is an
//! integration error reported by name.

use crate::error::PipelineError;
use crate::pipeline::message::Message;
use crate::pipeline::stage::{CallKind, StageCall, StageContext, StageRole, WriteAck};

/// Where a relayed call goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Absorbed by the stage.
    Absorb,
    /// Continue towards the tail.
    Inbound,
    /// Continue towards the head.
    Outbound,
}

/// Resolve the forwarding target of `call` for a stage of `role`.
pub fn route(role: StageRole, call: &StageCall) -> Option<Route> {
    match call.kind() {
        CallKind::Registration => Some(Route::Absorb),
        CallKind::Fault => Some(Route::Inbound),
        CallKind::Inbound if role.handles_inbound() => Some(Route::Inbound),
        CallKind::Outbound if role.handles_outbound() => Some(Route::Outbound),
        CallKind::Inbound | CallKind::Outbound => None,
    }
}

/// Relay `call` unchanged.
pub fn pass_through(
    role: StageRole,
    ctx: &dyn StageContext,
    call: StageCall,
) -> Result<(), PipelineError> {
    match route(role, &call) {
        Some(Route::Absorb) => Ok(()),
        Some(Route::Inbound) => ctx.fire(call),
        Some(Route::Outbound) => ctx.invoke(call),
        None => Err(unsupported(ctx, call.name())),
    }
}

/// Relay a read unchanged.
pub fn read(role: StageRole, ctx: &dyn StageContext, msg: Message) -> Result<(), PipelineError> {
    if role.handles_inbound() {
        ctx.fire_read(msg)
    } else {
        Err(unsupported(ctx, "channel_read"))
    }
}

/// Relay a write unchanged, keeping its ack.
pub fn write(
    role: StageRole,
    ctx: &dyn StageContext,
    msg: Message,
    ack: WriteAck,
) -> Result<(), PipelineError> {
    if role.handles_outbound() {
        ctx.write(msg, ack)
    } else {
        Err(unsupported(ctx, "write"))
    }
}

fn unsupported(ctx: &dyn StageContext, call: &'static str) -> PipelineError {
    PipelineError::ForwardingUnsupported {
        stage: ctx.name().to_string(),
        call,
    }
}
