//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! begin():
//!     active → register support listener → accept stage on every listener
//!     → init stage on every live connection
//!
//! close():
//!     inactive → unregister listener → drain registry
//!     → remove accept stage from listeners → remove tap stages from connections
//!
//! Support listener (events.rs):
//!     Login → bind pending address    Join → attach session
//!     Quit  → unbind identity         Shutdown → close()
//! ```
//!
//! # Design Decisions
//! - begin/close share one lock and are idempotent
//! - Transforms live outside the lifecycle and survive close/begin
//! - Stage removal never fails a close; absent stages are skipped

pub mod controller;
pub(crate) mod events;

pub use controller::Interceptor;
