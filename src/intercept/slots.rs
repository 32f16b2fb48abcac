//! Swappable transform slots.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::pipeline::Message;
use crate::registry::Handle;

/// Error raised by a transform.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// `Ok(Some(msg))` forwards `msg`, `Ok(None)` drops the message.
pub type HandlerResult = Result<Option<Message>, HandlerError>;

/// Traffic direction of a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-supplied message transform.
pub struct Transform(Box<dyn Fn(&Handle, Message) -> HandlerResult + Send + Sync>);

impl Transform {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Handle, Message) -> HandlerResult + Send + Sync + 'static,
    {
        Self(Box::new(f))
    }

    pub fn apply(&self, handle: &Handle, msg: Message) -> HandlerResult {
        (self.0)(handle, msg)
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Transform")
    }
}

/// One atomically replaceable transform.
///
/// A message observes whichever transform was current when it reached the
/// stage; swapping never affects a call already in progress.
#[derive(Default)]
pub struct HandlerSlot {
    current: ArcSwapOption<Transform>,
}

impl HandlerSlot {
    pub fn set(&self, transform: Transform) {
        self.current.store(Some(Arc::new(transform)));
    }

    pub fn clear(&self) {
        self.current.store(None);
    }

    pub fn is_set(&self) -> bool {
        self.current.load().is_some()
    }

    /// Run the current transform, or pass `msg` through when none is set.
    pub fn apply(&self, handle: &Handle, msg: Message) -> HandlerResult {
        match self.current.load_full() {
            Some(transform) => transform.apply(handle, msg),
            None => Ok(Some(msg)),
        }
    }
}

/// The inbound and outbound slots shared by every stage of one interceptor.
#[derive(Default)]
pub struct HandlerSlots {
    inbound: HandlerSlot,
    outbound: HandlerSlot,
}

impl HandlerSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, direction: Direction) -> &HandlerSlot {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::local::LocalConnection;
    use crate::host::ConnectionRef;

    fn handle() -> Handle {
        let conn: ConnectionRef = LocalConnection::new("10.1.0.1:1".parse().unwrap());
        Handle::new(conn)
    }

    #[tokio::test]
    async fn empty_slot_passes_through() {
        let slot = HandlerSlot::default();
        let out = slot.apply(&handle(), Message::new(7u32)).unwrap().unwrap();
        assert_eq!(out.downcast_ref::<u32>(), Some(&7));
        assert!(!slot.is_set());
    }

    #[tokio::test]
    async fn latest_transform_wins() {
        let slots = HandlerSlots::new();
        let slot = slots.slot(Direction::Inbound);
        let handle = handle();

        slot.set(Transform::new(|_, _| Ok(None)));
        assert!(slot.apply(&handle, Message::new(1u8)).unwrap().is_none());

        slot.set(Transform::new(|_, msg| Ok(Some(msg))));
        assert!(slot.apply(&handle, Message::new(1u8)).unwrap().is_some());

        slot.clear();
        assert!(!slot.is_set());
        assert!(!slots.slot(Direction::Outbound).is_set());
    }

    #[tokio::test]
    async fn transform_errors_surface() {
        let slot = HandlerSlot::default();
        slot.set(Transform::new(|_, _| Err("bad payload".into())));
        let err = slot.apply(&handle(), Message::new(())).unwrap_err();
        assert_eq!(err.to_string(), "bad payload");
    }
}
