pub mod events;
mod socket;

pub use events::Event;
pub use socket::{raise_priority, EventSource};
