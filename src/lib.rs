//! Transparent per-connection message interception for pipeline servers.
//!
//! # Architecture Overview
//!
//! ```text
//!   host listener pipeline         host connection pipeline
//!   ┌──────────┐                   ┌──────┐ ┌─────┐ ┌─────┐ ┌────────┐
//!   │ [accept] │── hijack ───────▶ │[init]│ │ ... │ │[in] │ │ anchor │
//!   └──────────┘                   └──────┘ └─────┘ │[out]│ │ (core) │
//!                                                   └──┬──┘ └────────┘
//!                                                      │
//!                                  inbound / outbound transforms (HandlerSlots)
//!
//!   Interceptor ── begin/close ── ConnectionRegistry ── HostAdapter (event feed)
//! ```
//!
//! The engine only talks to the host through the traits in [`host`]; the
//! [`host::local`] module is an in-process host implementing them, and
//! [`host::tcp`] puts it on real sockets.

// Core subsystems
pub mod error;
pub mod host;
pub mod intercept;
pub mod lifecycle;
pub mod pipeline;
pub mod registry;

// Cross-cutting concerns
pub mod config;
pub mod observability;

pub use config::TapConfig;
pub use error::{BindingError, HandlerFault, PipelineError, TapError, WriteError};
pub use host::{Connection, ConnectionRef, HostAdapter, HostEvent, Identity};
pub use intercept::{HandlerError, HandlerResult, StageNames};
pub use lifecycle::Interceptor;
pub use pipeline::{Message, WriteReceipt};
pub use registry::{Handle, InjectionState};
