//! Connection registry.
//!
//! # Data Flow
//! ```text
//! accept stage   → remember_pending(addr → weak connection)
//! Login event    → bind_pending(addr, identity) → identity → connection
//! any traversal  → handle(connection)            (lazy, one per connection)
//! connection()   → handle_by_identity            (cache, then host)
//! Quit / inactive / sweep / close → unbind / evict / sweep / drain
//! ```
//!
//! # Design Decisions
//! - Sharded maps on the hot path; the only exclusive lock is taken by drain
//! - Pending entries hold weak references and disappear with the connection
//! - Identity bindings hold strong references until the identity quits

pub mod connections;
pub mod handle;

pub use connections::ConnectionRegistry;
pub use handle::{Handle, InjectionState};
