//! Inter-plugin messaging and events

pub mod events;
pub mod router;

pub use events::{EventPattern, EventStats, EventSubscription, EventSystem};
pub use router::{MessageRouter, RouterStats};
