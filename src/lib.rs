//! Asynchronous block I/O for data that does not fit in memory.
//!
//! Every configured disk gets its own request queue and worker; blocks are
//! placed on disks by allocation strategies and read back ahead of need in the
//! order [`schedule::compute_prefetch_schedule`] computes.

pub mod buffer;
pub mod config;
pub mod error;
pub mod schedule;
pub mod storage;
pub mod utils;

#[cfg(test)]
mod tests;

pub use buffer::{
    aligned::AlignedBuf, prefetch_pool::PrefetchPool, prefetcher::BlockPrefetcher,
    read_write_pool::ReadWritePool, write_pool::WritePool,
};
pub use config::{AccessMethod, Config, DiskConfig};
pub use error::{AllocError, ConfigError, IoError};
pub use schedule::compute_prefetch_schedule;
pub use storage::{
    block::manager::{Bid, BlockManager, InterleavedRuns},
    disk::{
        file::{DiskFile, FileBackend},
        registry::DiskRegistry,
        request::{poll_any, wait_all, wait_any, IoFuture, Request, RequestKind, RequestState},
        scheduler::PriorityOp,
    },
};
