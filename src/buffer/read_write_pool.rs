use std::sync::Arc;

use crate::{
    buffer::{aligned::AlignedBuf, prefetch_pool::PrefetchPool, write_pool::WritePool},
    error::IoError,
    storage::{
        block::manager::{Bid, BlockManager},
        disk::request::Request,
    },
};

/// A prefetch pool and a write pool kept coherent with each other: a block
/// is never served from a prefetch that an unfinished write has made stale.
pub struct ReadWritePool {
    // Dropped first so no prefetch outlives the writes it may race with.
    prefetch: PrefetchPool,
    writes: WritePool,
}

impl ReadWritePool {
    pub fn new(
        manager: Arc<BlockManager>,
        prefetch_blocks: usize,
        write_blocks: usize,
        block_size: usize,
    ) -> Self {
        Self {
            prefetch: PrefetchPool::new(Arc::clone(&manager), prefetch_blocks, block_size),
            writes: WritePool::new(manager, write_blocks, block_size),
        }
    }

    /// Any prefetched copy of `bid` is dropped before the write is queued.
    pub fn write(&mut self, buf: AlignedBuf, bid: Bid) -> Result<Arc<Request>, IoError> {
        self.prefetch.invalidate(&bid);
        self.writes.write(buf, bid)
    }

    pub fn steal(&mut self) -> Result<AlignedBuf, IoError> {
        self.writes.steal()
    }

    pub fn add(&mut self, buf: AlignedBuf) {
        self.writes.add(buf);
    }

    pub fn hint(&mut self, bid: Bid) -> Result<bool, IoError> {
        self.prefetch.hint_with(bid, &self.writes)
    }

    pub fn read(&mut self, buf: AlignedBuf, bid: Bid) -> Result<Arc<Request>, IoError> {
        self.prefetch.read_with(buf, bid, &mut self.writes)
    }

    pub fn invalidate(&mut self, bid: &Bid) -> bool {
        self.prefetch.invalidate(bid)
    }

    pub fn flush(&mut self) -> Result<(), IoError> {
        self.writes.flush()
    }

    pub fn resize_write(&mut self, new_size: usize) -> Result<(), IoError> {
        self.writes.resize(new_size)
    }

    pub fn resize_prefetch(&mut self, new_size: usize) {
        self.prefetch.resize(new_size);
    }

    pub fn size_write(&self) -> usize {
        self.writes.size()
    }

    pub fn size_prefetch(&self) -> usize {
        self.prefetch.size()
    }

    pub fn write_pool(&self) -> &WritePool {
        &self.writes
    }

    pub fn prefetch_pool(&self) -> &PrefetchPool {
        &self.prefetch
    }
}
