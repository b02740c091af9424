pub mod semaphore;
pub mod stats;
