pub mod chaos;
pub mod config;
pub mod queue;
pub mod trace;

pub use config::{MAX_CAPACITY, QueueConfig};
pub use queue::{BlockingQueue, InsertError, QueueStats};
