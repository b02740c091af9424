use std::sync::Arc;

use hashlink::LinkedHashMap;
use tracing::{debug, trace};

use crate::{
    buffer::{aligned::AlignedBuf, write_pool::WritePool},
    error::IoError,
    storage::{
        block::manager::{Bid, BlockManager},
        disk::request::Request,
    },
};

/// Bounded set of buffers for reads issued ahead of need.
///
/// Hinted blocks are kept in hint order; when every buffer is in use the
/// least recently hinted block is dropped to make room.
pub struct PrefetchPool {
    manager: Arc<BlockManager>,
    block_size: usize,
    free: Vec<AlignedBuf>,
    busy: LinkedHashMap<Bid, Arc<Request>>,
}

impl PrefetchPool {
    pub fn new(manager: Arc<BlockManager>, blocks: usize, block_size: usize) -> Self {
        Self {
            manager,
            block_size,
            free: (0..blocks).map(|_| AlignedBuf::new(block_size)).collect(),
            busy: LinkedHashMap::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.free.len() + self.busy.len()
    }

    pub fn free_blocks(&self) -> usize {
        self.free.len()
    }

    pub fn busy_blocks(&self) -> usize {
        self.busy.len()
    }

    pub fn in_prefetching(&self, bid: &Bid) -> bool {
        self.busy.contains_key(bid)
    }

    /// Starts reading `bid` in the background. False only if the pool has no
    /// buffers at all. A failed hint leaves the pool size unchanged.
    pub fn hint(&mut self, bid: Bid) -> Result<bool, IoError> {
        if let Some(request) = self.busy.remove(&bid) {
            // Hinted again: now the most recent hint.
            self.busy.insert(bid, request);
            return Ok(true);
        }
        // Nothing gets evicted for a block that cannot be read.
        self.manager.io_file(&bid)?;

        let buf = match self.free.pop() {
            Some(buf) => buf,
            None => match self.busy.pop_front() {
                Some((evicted, request)) => {
                    trace!(%evicted, "evicting least recently hinted block");
                    self.discard(&request)
                }
                None => return Ok(false),
            },
        };

        match self.manager.try_aread(&bid, buf) {
            Ok(request) => {
                self.busy.insert(bid, request);
                Ok(true)
            }
            Err((err, buf)) => {
                self.free.push(buf);
                Err(err)
            }
        }
    }

    /// Like [`PrefetchPool::hint`], but refuses blocks with a pending write in
    /// `writes`: reading them from disk would return stale data.
    pub fn hint_with(&mut self, bid: Bid, writes: &WritePool) -> Result<bool, IoError> {
        if writes.has_request(&bid) {
            return Ok(false);
        }
        self.hint(bid)
    }

    /// Read of `bid`. A prefetched block is handed over directly and `buf`
    /// joins the pool instead; otherwise `buf` is read into. The returned
    /// request owns the data buffer.
    pub fn read(&mut self, buf: AlignedBuf, bid: Bid) -> Result<Arc<Request>, IoError> {
        match self.busy.remove(&bid) {
            Some(request) => {
                trace!(%bid, "read served from prefetch");
                self.free.push(buf);
                Ok(request)
            }
            None => self.manager.aread(&bid, buf),
        }
    }

    /// Like [`PrefetchPool::read`], but a write of `bid` still pending in
    /// `writes` wins: its request is handed over and `buf` goes to `writes`.
    pub fn read_with(
        &mut self,
        buf: AlignedBuf,
        bid: Bid,
        writes: &mut WritePool,
    ) -> Result<Arc<Request>, IoError> {
        match writes.steal_request(&bid) {
            Some(request) => {
                trace!(%bid, "read served from pending write");
                self.invalidate(&bid);
                writes.add(buf);
                Ok(request)
            }
            None => self.read(buf, bid),
        }
    }

    /// Drops a prefetched copy of `bid`; true if there was one.
    pub fn invalidate(&mut self, bid: &Bid) -> bool {
        match self.busy.remove(bid) {
            Some(request) => {
                let buf = self.discard(&request);
                self.free.push(buf);
                true
            }
            None => false,
        }
    }

    pub fn resize(&mut self, new_size: usize) {
        while self.size() < new_size {
            self.free.push(AlignedBuf::new(self.block_size));
        }
        while self.size() > new_size {
            if self.free.pop().is_some() {
                continue;
            }
            if let Some((_, request)) = self.busy.pop_front() {
                drop(self.discard(&request));
            }
        }
        debug!(size = new_size, "resized prefetch pool");
    }

    // Cancels (or waits out) a prefetch nobody will consume and recovers its buffer.
    fn discard(&self, request: &Arc<Request>) -> AlignedBuf {
        self.manager.cancel(request);
        if let Err(err) = request.wait() {
            if !err.is_canceled() {
                debug!(error = %err, "discarded prefetch had failed");
            }
        }
        request
            .take_buffer()
            .unwrap_or_else(|| AlignedBuf::new(self.block_size))
    }
}

impl Drop for PrefetchPool {
    fn drop(&mut self) {
        while let Some((_, request)) = self.busy.pop_front() {
            drop(self.discard(&request));
        }
    }
}

#[cfg(test)]
pub mod test {
    use std::sync::Arc;

    use super::PrefetchPool;
    use crate::{
        buffer::{
            aligned::AlignedBuf,
            write_pool::{test::manager, WritePool},
        },
        storage::{
            block::{
                manager::{Bid, BlockManager},
                strategy::Striping,
            },
            disk::request::Request,
        },
    };

    const BLOCK: usize = 4096;

    fn written_blocks(manager: &Arc<BlockManager>, count: usize) -> Vec<Bid> {
        let bids = manager
            .new_blocks(&mut Striping::new(0, manager.disks()), count, BLOCK, 0)
            .unwrap();
        for (i, bid) in bids.iter().enumerate() {
            manager
                .awrite(bid, AlignedBuf::filled(BLOCK, i as u8))
                .unwrap()
                .wait()
                .unwrap();
        }
        bids
    }

    fn contents(request: &Arc<Request>) -> u8 {
        request.wait().unwrap();
        let buf = request.take_buffer().unwrap();
        assert!(buf.iter().all(|&b| b == buf[0]));
        buf[0]
    }

    #[test]
    fn hint_then_read_test() {
        let manager = manager(2);
        let bids = written_blocks(&manager, 4);
        let mut pool = PrefetchPool::new(Arc::clone(&manager), 2, BLOCK);

        assert!(pool.hint(bids[1]).unwrap());
        assert!(pool.in_prefetching(&bids[1]));
        assert_eq!(1, pool.busy_blocks());

        let request = pool.read(AlignedBuf::new(BLOCK), bids[1]).unwrap();
        assert_eq!(1, contents(&request));
        assert!(!pool.in_prefetching(&bids[1]));
        // The caller's buffer replaced the handed over one.
        assert_eq!(2, pool.free_blocks());

        let request = pool.read(AlignedBuf::new(BLOCK), bids[3]).unwrap();
        assert_eq!(3, contents(&request));
    }

    #[test]
    fn lru_eviction_test() {
        let manager = manager(1);
        let bids = written_blocks(&manager, 4);
        let mut pool = PrefetchPool::new(Arc::clone(&manager), 2, BLOCK);

        pool.hint(bids[0]).unwrap();
        pool.hint(bids[1]).unwrap();
        // Refresh bids[0]; bids[1] is now the oldest hint.
        pool.hint(bids[0]).unwrap();
        pool.hint(bids[2]).unwrap();

        assert!(pool.in_prefetching(&bids[0]));
        assert!(!pool.in_prefetching(&bids[1]));
        assert!(pool.in_prefetching(&bids[2]));
        assert_eq!(2, pool.size());

        let mut empty = PrefetchPool::new(manager, 0, BLOCK);
        assert!(!empty.hint(bids[3]).unwrap());
    }

    #[test]
    fn hint_with_pending_write_test() {
        let manager = manager(1);
        let bids = written_blocks(&manager, 1);
        let mut writes = WritePool::new(Arc::clone(&manager), 0, BLOCK);
        let mut pool = PrefetchPool::new(Arc::clone(&manager), 1, BLOCK);

        writes.write(AlignedBuf::filled(BLOCK, 0x42), bids[0]).unwrap();
        assert!(!pool.hint_with(bids[0], &writes).unwrap());
        assert!(!pool.in_prefetching(&bids[0]));

        let request = pool
            .read_with(AlignedBuf::new(BLOCK), bids[0], &mut writes)
            .unwrap();
        assert_eq!(0x42, contents(&request));
        assert!(!writes.has_request(&bids[0]));
        assert_eq!(1, writes.free_blocks());
    }

    #[test]
    fn failed_hint_keeps_buffers_test() {
        let manager = manager(1);
        let bids = written_blocks(&manager, 2);
        let mut pool = PrefetchPool::new(Arc::clone(&manager), 2, BLOCK);

        let missing = Bid {
            disk: 9,
            offset: 0,
            size: BLOCK,
        };
        assert!(pool.hint(missing).is_err());
        assert_eq!(2, pool.size());
        assert_eq!(2, pool.free_blocks());

        // A full pool evicts nothing for an unreadable block.
        pool.hint(bids[0]).unwrap();
        pool.hint(bids[1]).unwrap();
        assert!(pool.hint(missing).is_err());
        assert!(pool.in_prefetching(&bids[0]));
        assert!(pool.in_prefetching(&bids[1]));

        // Refused by the queue: the buffer of the evicted block returns to the pool.
        let empty = Bid { size: 0, ..bids[0] };
        assert!(pool.hint(empty).is_err());
        assert_eq!(2, pool.size());
        assert_eq!(1, pool.free_blocks());
    }

    #[test]
    fn invalidate_and_resize_test() {
        let manager = manager(1);
        let bids = written_blocks(&manager, 2);
        let mut pool = PrefetchPool::new(Arc::clone(&manager), 2, BLOCK);

        pool.hint(bids[0]).unwrap();
        assert!(pool.invalidate(&bids[0]));
        assert!(!pool.invalidate(&bids[0]));
        assert_eq!(2, pool.free_blocks());

        pool.hint(bids[1]).unwrap();
        pool.resize(1);
        assert_eq!(1, pool.size());
        pool.resize(0);
        assert_eq!(0, pool.size());
        pool.resize(3);
        assert_eq!(3, pool.free_blocks());
    }
}
