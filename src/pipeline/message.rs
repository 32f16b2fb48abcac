//! Type-erased messages travelling through a pipeline.

use std::any::Any;
use std::fmt;

/// An opaque message owned by whichever stage currently holds it.
///
/// The engine never inspects payloads; transforms downcast to the concrete
/// type the host puts on the wire.
pub struct Message {
    payload: Box<dyn Any + Send>,
    type_name: &'static str,
}

impl Message {
    /// Wrap a payload.
    pub fn new<T: Any + Send>(payload: T) -> Self {
        Self {
            payload: Box::new(payload),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Whether the payload is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.payload.is::<T>()
    }

    /// Borrow the payload as a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Take the payload as a `T`, handing the message back on mismatch.
    pub fn downcast<T: Any>(self) -> Result<T, Message> {
        let type_name = self.type_name;
        match self.payload.downcast::<T>() {
            Ok(payload) => Ok(*payload),
            Err(payload) => Err(Message { payload, type_name }),
        }
    }

    /// Name of the payload type, for logs.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.type_name)
            .finish_non_exhaustive()
    }
}
