use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// A single store mutation, broadcast to every `Watch` subscriber in
/// arrival order.
#[derive(Debug, Clone)]
pub struct Event<T> {
    pub event_type: EventType,
    pub object: T,
}

impl<T> Event<T> {
    pub fn added(object: T) -> Self {
        Self {
            event_type: EventType::Added,
            object,
        }
    }

    pub fn modified(object: T) -> Self {
        Self {
            event_type: EventType::Modified,
            object,
        }
    }

    pub fn deleted(object: T) -> Self {
        Self {
            event_type: EventType::Deleted,
            object,
        }
    }
}
