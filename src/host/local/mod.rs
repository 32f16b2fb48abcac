//! In-process reference host.
//!
//! # Data Flow
//! ```text
//! LocalServer::accept
//!     → listener pipeline (accept-level stages) → Acceptor
//!     → connection pipeline: [host_init] → register → [core]
//!     → activate (buffered reads replayed)
//!
//! LocalConnection::receive → executor → pipeline head → ... → core
//! Connection::send → executor → pipeline tail → ... → outbox
//! ```
//!
//! # Design Decisions
//! - Stage chains are copy-on-write; traversals never lock
//! - Attach callbacks on an unregistered pipeline wait for registration
//! - One Tokio task per connection serializes all of its pipeline work

pub mod connection;
pub mod executor;
pub mod pipeline;
pub mod server;

pub use connection::LocalConnection;
pub use executor::LocalExecutor;
pub use pipeline::{Endpoint, LocalPipeline};
pub use server::{CoreFactory, LocalListener, LocalServer};
