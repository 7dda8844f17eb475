pub mod events;
pub mod link;

pub use events::{Event, Interest, PollEvents, ReadinessSource, Token};
pub use link::{Link, is_transient};
