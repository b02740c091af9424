use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
    buffer::aligned::AlignedBuf,
    error::IoError,
    schedule::compute_prefetch_schedule,
    storage::{
        block::manager::{Bid, BlockManager},
        disk::request::Request,
    },
};

/// Streams a sequence of blocks with a fixed number of read buffers.
///
/// Reads are issued in prefetch order, blocks are handed out in sequence
/// order. Return every block through [`BlockPrefetcher::block_consumed`] so
/// its buffer can carry the next prefetch.
pub struct BlockPrefetcher {
    manager: Arc<BlockManager>,
    bids: Vec<Bid>,
    order: Vec<usize>,
    // Index of each block in `order`.
    position: Vec<usize>,
    // Next position in `order` to issue.
    cursor: usize,
    pending: Vec<Option<Arc<Request>>>,
    issued: Vec<bool>,
    free: Vec<AlignedBuf>,
    next: usize,
    block_size: usize,
    buffers: usize,
    // Buffers currently owned by the prefetcher or its caller. Exceeds
    // `buffers` only while the caller holds every one of them.
    live: usize,
}

impl BlockPrefetcher {
    /// `order` must be a permutation of `0..bids.len()`.
    pub fn new(
        manager: Arc<BlockManager>,
        bids: Vec<Bid>,
        order: Vec<usize>,
        buffers: usize,
        block_size: usize,
    ) -> Result<Self, IoError> {
        let len = bids.len();
        let mut seen = vec![false; len];
        let valid = order.len() == len
            && order
                .iter()
                .all(|&i| i < len && !std::mem::replace(&mut seen[i], true));
        if !valid {
            return Err(IoError::InvalidArgument(format!(
                "prefetch order is not a permutation of {len} blocks"
            )));
        }

        let mut position = vec![0; len];
        for (pos, &index) in order.iter().enumerate() {
            position[index] = pos;
        }

        let mut prefetcher = Self {
            manager,
            bids,
            order,
            position,
            cursor: 0,
            pending: vec![None; len],
            issued: vec![false; len],
            free: (0..buffers).map(|_| AlignedBuf::new(block_size)).collect(),
            next: 0,
            block_size,
            buffers,
            live: buffers,
        };
        prefetcher.fill()?;
        Ok(prefetcher)
    }

    /// Prefetches in the order computed by [`compute_prefetch_schedule`] for
    /// the blocks' disks.
    pub fn with_schedule(
        manager: Arc<BlockManager>,
        bids: Vec<Bid>,
        buffers: usize,
        block_size: usize,
    ) -> Result<Self, IoError> {
        let disks: Vec<usize> = bids.iter().map(|bid| bid.disk).collect();
        let order = compute_prefetch_schedule(&disks, buffers, manager.disks());
        debug!(blocks = bids.len(), buffers, "prefetching with computed schedule");
        Self::new(manager, bids, order, buffers, block_size)
    }

    /// Blocks still to be handed out.
    pub fn remaining(&self) -> usize {
        self.bids.len() - self.next
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Position of the next block in sequence order.
    pub fn pos(&self) -> usize {
        self.next
    }

    /// Buffers in existence: free, carrying a read, or held by the caller.
    pub fn live_buffers(&self) -> usize {
        self.live
    }

    /// Waits for the next block in sequence order; `None` once all are out.
    pub fn pull_block(&mut self) -> Result<Option<(Bid, AlignedBuf)>, IoError> {
        let index = self.next;
        if index == self.bids.len() {
            return Ok(None);
        }

        if !self.issued[index] {
            // Every buffer is held by blocks further ahead; read this one out of order.
            let buf = match self.free.pop() {
                Some(buf) => buf,
                None => match self.reclaim_farthest(index) {
                    Some(buf) => buf,
                    None => {
                        // The caller holds all buffers.
                        self.live += 1;
                        AlignedBuf::new(self.block_size)
                    }
                },
            };
            trace!(index, "block not yet prefetched, reading it now");
            self.issue(index, buf)?;
        }

        let Some(request) = self.pending[index].take() else {
            return Err(IoError::InvalidArgument(format!(
                "block {index} has no read in flight"
            )));
        };
        self.next += 1;

        let result = request.wait();
        let buf = request
            .take_buffer()
            .unwrap_or_else(|| AlignedBuf::new(self.block_size));
        if let Err(err) = result {
            self.recycle(buf);
            return Err(err);
        }
        Ok(Some((self.bids[index], buf)))
    }

    /// Returns a buffer and issues the next read with it.
    pub fn block_consumed(&mut self, buf: AlignedBuf) -> Result<(), IoError> {
        self.recycle(buf);
        self.fill()
    }

    fn recycle(&mut self, buf: AlignedBuf) {
        if self.live > self.buffers {
            self.live -= 1;
        } else {
            self.free.push(buf);
        }
    }

    // Takes back the buffer of the outstanding read needed last, after `index`.
    // That block is read again later.
    fn reclaim_farthest(&mut self, index: usize) -> Option<AlignedBuf> {
        let farthest = (index + 1..self.bids.len())
            .rev()
            .find(|&i| self.pending[i].is_some())?;
        let request = self.pending[farthest].take()?;
        self.issued[farthest] = false;
        self.cursor = self.cursor.min(self.position[farthest]);

        self.manager.cancel(&request);
        // Canceled or finished; the data is not used either way.
        let _ = request.wait();
        trace!(index = farthest, "took back buffer of a later prefetch");
        Some(
            request
                .take_buffer()
                .unwrap_or_else(|| AlignedBuf::new(self.block_size)),
        )
    }

    fn fill(&mut self) -> Result<(), IoError> {
        while !self.free.is_empty() {
            while self.cursor < self.order.len() && self.issued[self.order[self.cursor]] {
                self.cursor += 1;
            }
            if self.cursor == self.order.len() {
                break;
            }

            let index = self.order[self.cursor];
            self.cursor += 1;
            if let Some(buf) = self.free.pop() {
                self.issue(index, buf)?;
            }
        }
        Ok(())
    }

    fn issue(&mut self, index: usize, buf: AlignedBuf) -> Result<(), IoError> {
        match self.manager.try_aread(&self.bids[index], buf) {
            Ok(request) => {
                self.pending[index] = Some(request);
                self.issued[index] = true;
                Ok(())
            }
            Err((err, buf)) => {
                self.recycle(buf);
                Err(err)
            }
        }
    }
}

impl Drop for BlockPrefetcher {
    fn drop(&mut self) {
        for request in self.pending.iter_mut().filter_map(Option::take) {
            self.manager.cancel(&request);
            // Canceled or finished; either way the buffer is released.
            let _ = request.wait();
        }
    }
}
