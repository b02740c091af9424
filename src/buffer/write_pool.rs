use std::{collections::VecDeque, sync::Arc};

use tracing::{debug, trace, warn};

use crate::{
    buffer::aligned::AlignedBuf,
    error::IoError,
    storage::{
        block::manager::{Bid, BlockManager},
        disk::request::Request,
    },
};

struct BusyBlock {
    bid: Bid,
    request: Arc<Request>,
}

/// Bounded set of block buffers for deferred writes.
///
/// A written buffer belongs to the pool until its write completes; [`WritePool::steal`]
/// hands out a free buffer, waiting for the oldest write if none is free.
pub struct WritePool {
    manager: Arc<BlockManager>,
    block_size: usize,
    free: Vec<AlignedBuf>,
    busy: VecDeque<BusyBlock>,
}

impl WritePool {
    pub fn new(manager: Arc<BlockManager>, blocks: usize, block_size: usize) -> Self {
        Self {
            manager,
            block_size,
            free: (0..blocks).map(|_| AlignedBuf::new(block_size)).collect(),
            busy: VecDeque::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
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

    /// Queues a write of `buf` to `bid`. A still pending write to the same
    /// block is waited for first, so the newer data always lands last.
    pub fn write(&mut self, buf: AlignedBuf, bid: Bid) -> Result<Arc<Request>, IoError> {
        if let Some(index) = self.busy.iter().position(|busy| busy.bid == bid) {
            trace!(%bid, "write after write, waiting for the older write");
            if let Some(older) = self.busy.remove(index) {
                let buf = self.reclaim(older)?;
                self.free.push(buf);
            }
        }

        match self.manager.try_awrite(&bid, buf) {
            Ok(request) => {
                self.busy.push_back(BusyBlock {
                    bid,
                    request: Arc::clone(&request),
                });
                Ok(request)
            }
            Err((err, buf)) => {
                // The buffer stays with the pool.
                self.free.push(buf);
                Err(err)
            }
        }
    }

    /// A buffer the caller may fill. Waits for the oldest write when no buffer
    /// is free.
    pub fn steal(&mut self) -> Result<AlignedBuf, IoError> {
        if let Some(buf) = self.free.pop() {
            return Ok(buf);
        }
        match self.busy.pop_front() {
            Some(oldest) => self.reclaim(oldest),
            None => Err(IoError::InvalidArgument(
                "write pool has no buffers".to_string(),
            )),
        }
    }

    /// Gives a buffer to the pool.
    pub fn add(&mut self, buf: AlignedBuf) {
        self.free.push(buf);
    }

    pub fn has_request(&self, bid: &Bid) -> bool {
        self.busy.iter().any(|busy| busy.bid == *bid)
    }

    /// Detaches the pending write of `bid` from the pool. Once the request is
    /// finished its buffer holds the block's newest contents.
    pub fn steal_request(&mut self, bid: &Bid) -> Option<Arc<Request>> {
        let index = self.busy.iter().position(|busy| busy.bid == *bid)?;
        self.busy.remove(index).map(|busy| busy.request)
    }

    /// Waits for every pending write; reports the first failure after all
    /// buffers are back.
    pub fn flush(&mut self) -> Result<(), IoError> {
        let mut first_error = None;
        while let Some(busy) = self.busy.pop_front() {
            match self.reclaim(busy) {
                Ok(buf) => self.free.push(buf),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn resize(&mut self, new_size: usize) -> Result<(), IoError> {
        while self.size() < new_size {
            self.free.push(AlignedBuf::new(self.block_size));
        }
        while self.size() > new_size {
            if self.free.pop().is_none() {
                drop(self.steal()?);
            }
        }
        debug!(size = new_size, "resized write pool");
        Ok(())
    }

    // Waits for the write and takes its buffer back. On a failed write the
    // buffer is still recycled and the error returned.
    fn reclaim(&mut self, busy: BusyBlock) -> Result<AlignedBuf, IoError> {
        let result = busy.request.wait();
        let buf = busy
            .request
            .take_buffer()
            .unwrap_or_else(|| AlignedBuf::new(self.block_size));

        match result {
            Ok(()) => Ok(buf),
            Err(err) => {
                self.free.push(buf);
                Err(err)
            }
        }
    }
}

impl Drop for WritePool {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(error = %err, "write pool dropped with a failed write");
        }
    }
}

#[cfg(test)]
pub mod test {
    use std::sync::Arc;

    use super::WritePool;
    use crate::{
        buffer::aligned::AlignedBuf,
        config::{AccessMethod, Config, DiskConfig},
        storage::{
            block::{
                manager::{Bid, BlockManager},
                strategy::Striping,
            },
            disk::registry::DiskRegistry,
        },
    };

    const BLOCK: usize = 4096;

    pub(crate) fn manager(disks: usize) -> Arc<BlockManager> {
        let config = Config::new(
            (0..disks)
                .map(|i| DiskConfig::new(format!("pool-ram{i}"), 4, AccessMethod::Memory))
                .collect(),
        );
        Arc::new(BlockManager::new(&config, Arc::new(DiskRegistry::new())).unwrap())
    }

    fn read_back(manager: &BlockManager, bid: &Bid) -> AlignedBuf {
        let request = manager.aread(bid, AlignedBuf::new(BLOCK)).unwrap();
        request.wait().unwrap();
        request.take_buffer().unwrap()
    }

    #[test]
    fn write_and_flush_test() {
        let manager = manager(2);
        let bids = manager
            .new_blocks(&mut Striping::new(0, 2), 6, BLOCK, 0)
            .unwrap();
        let mut pool = WritePool::new(Arc::clone(&manager), 2, BLOCK);

        for (i, bid) in bids.iter().enumerate() {
            let mut buf = pool.steal().unwrap();
            buf.fill(i as u8 + 10);
            pool.write(buf, *bid).unwrap();
            assert_eq!(2, pool.size());
        }
        pool.flush().unwrap();
        assert_eq!(2, pool.free_blocks());
        assert_eq!(0, pool.busy_blocks());

        for (i, bid) in bids.iter().enumerate() {
            assert!(read_back(&manager, bid).iter().all(|&b| b == i as u8 + 10));
        }
    }

    #[test]
    fn write_after_write_test() {
        let manager = manager(1);
        let bid = manager
            .new_blocks(&mut Striping::new(0, 1), 1, BLOCK, 0)
            .unwrap()[0];
        let mut pool = WritePool::new(Arc::clone(&manager), 0, BLOCK);

        pool.write(AlignedBuf::filled(BLOCK, 0xa), bid).unwrap();
        pool.write(AlignedBuf::filled(BLOCK, 0xb), bid).unwrap();
        assert!(pool.has_request(&bid));
        assert_eq!(1, pool.busy_blocks());
        assert_eq!(1, pool.free_blocks());
        pool.flush().unwrap();

        assert!(read_back(&manager, &bid).iter().all(|&b| b == 0xb));
    }

    #[test]
    fn steal_request_test() {
        let manager = manager(1);
        let bid = manager
            .new_blocks(&mut Striping::new(0, 1), 1, BLOCK, 0)
            .unwrap()[0];
        let mut pool = WritePool::new(Arc::clone(&manager), 0, BLOCK);

        pool.write(AlignedBuf::filled(BLOCK, 7), bid).unwrap();
        let request = pool.steal_request(&bid).unwrap();
        assert!(!pool.has_request(&bid));
        assert!(pool.steal_request(&bid).is_none());

        request.wait().unwrap();
        assert!(request.take_buffer().unwrap().iter().all(|&b| b == 7));
        assert_eq!(0, pool.size());
        assert!(pool.steal().is_err());
    }

    #[test]
    fn failed_write_keeps_buffer_test() {
        let manager = manager(1);
        let mut pool = WritePool::new(Arc::clone(&manager), 1, BLOCK);
        let missing = Bid {
            disk: 4,
            offset: 0,
            size: BLOCK,
        };

        let buf = pool.steal().unwrap();
        assert!(pool.write(buf, missing).is_err());
        assert_eq!(1, pool.free_blocks());
        assert!(!pool.has_request(&missing));
    }

    #[test]
    fn resize_test() {
        let manager = manager(1);
        let mut pool = WritePool::new(manager, 1, BLOCK);
        pool.resize(4).unwrap();
        assert_eq!(4, pool.free_blocks());
        pool.resize(2).unwrap();
        assert_eq!(2, pool.size());
        pool.add(AlignedBuf::new(BLOCK));
        assert_eq!(3, pool.size());
    }
}
