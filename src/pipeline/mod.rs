//! Pipeline subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound (head → tail):
//!     transport read → stage 1 → stage 2 → ... → anchor (host message handler)
//!
//! Outbound (tail → head):
//!     anchor / Connection::send → ... → stage 2 → stage 1 → transport write
//! ```
//!
//! # Design Decisions
//! - Stage roles are explicit; calls a role does not handle are relayed by
//!   `forward`, never looked up at runtime
//! - Structural changes go through `PipelineBridge`, which can defer them
//!   onto the connection's serial executor
//! - Writes carry a `WriteAck` that resolves once the transport accepts the
//!   message

pub mod bridge;
pub mod forward;
pub mod message;
pub mod stage;

pub use bridge::{Pipeline, PipelineBridge, RemoveOutcome, SerialExecutor, Task};
pub use message::Message;
pub use stage::{CallKind, Fault, Stage, StageCall, StageContext, StageRole, WriteAck, WriteReceipt};
