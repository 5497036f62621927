//! Priority queuing shared by the request scheduler and general background work.

mod manager;
mod priority;

pub use manager::{ItemOptions, QueueConfig, QueueItem, QueueManager, QueueStats};
pub use priority::{Priority, PriorityQueues};
