pub mod delta;
pub mod ids;
pub mod permission;
pub mod pubsub;
pub mod task;
pub mod tool_call;

pub use pubsub::{Broker, Event, EventKind};

/// Current wall-clock time as Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
