pub mod blocking_queue;
pub mod error;
mod node;
pub mod stats;

pub use blocking_queue::BlockingQueue;
pub use error::InsertError;
pub use stats::QueueStats;
