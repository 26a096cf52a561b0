//! Queue module: task records, retry policy, queue priorities.

mod priority;
mod record;
mod retry;

pub use priority::{QueueSelector, QueueWeight, parse_queue_weights};
pub use record::{ClaimedTask, Lease, TaskRecord};
pub use retry::RetryPolicy;
