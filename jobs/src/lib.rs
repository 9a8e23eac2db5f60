pub mod memory;
pub mod queue;
pub mod worker;

pub use queue::{Job, QueueError, QueueEvent, QueueObserver, TaskError, TaskHandle, WorkQueue};
