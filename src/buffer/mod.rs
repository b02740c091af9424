pub mod aligned;
pub mod prefetch_pool;
pub mod prefetcher;
pub mod read_write_pool;
pub mod write_pool;
