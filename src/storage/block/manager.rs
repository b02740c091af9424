use std::{
    fmt,
    sync::{Arc, Mutex, OnceLock},
};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::{
    buffer::aligned::AlignedBuf,
    config::{AccessMethod, Config, DiskConfig},
    error::{AllocError, IoError},
    storage::disk::{
        file::{DiskFile, FileBackend, FileOptions, MemoryFile, SyscallFile},
        registry::DiskRegistry,
        request::{Request, RequestKind},
    },
};

use super::{allocator::BlockAllocator, strategy::AllocStrategy};

/// Physical location of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bid {
    pub disk: usize,
    pub offset: u64,
    pub size: usize,
}

impl fmt::Display for Bid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[disk {} @ {} +{}]", self.disk, self.offset, self.size)
    }
}

struct Disk {
    config: DiskConfig,
    file: DiskFile,
    allocator: Mutex<BlockAllocator>,
}

/// Owns every configured disk: its backend, its free-space map and the
/// registry its requests go through.
pub struct BlockManager {
    disks: Vec<Disk>,
    registry: Arc<DiskRegistry>,
}

static GLOBAL: OnceLock<Arc<BlockManager>> = OnceLock::new();
static GLOBAL_INIT: Mutex<()> = Mutex::new(());

impl BlockManager {
    pub fn new(config: &Config, registry: Arc<DiskRegistry>) -> anyhow::Result<Self> {
        if config.disks.is_empty() {
            anyhow::bail!("no disks configured");
        }

        let mut disks = Vec::with_capacity(config.disks.len());
        for (index, disk) in config.disks.iter().enumerate() {
            let backend = Self::open_disk(index, disk)
                .with_context(|| format!("opening disk {} ({})", index, disk.path.display()))?;
            let autogrow = disk.autogrow || disk.capacity == 0;

            info!(
                disk = index,
                path = %disk.path.display(),
                capacity = disk.capacity,
                method = disk.method.name(),
                autogrow,
                "disk ready"
            );

            disks.push(Disk {
                config: disk.clone(),
                file: DiskFile::new(backend, Arc::clone(&registry)),
                allocator: Mutex::new(BlockAllocator::new(index, disk.capacity, autogrow)),
            });
        }

        Ok(Self { disks, registry })
    }

    /// Uses the process-wide registry.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(config, Arc::clone(DiskRegistry::global()))
    }

    /// Process-wide manager, built on first use from [`Config::load`].
    pub fn global() -> anyhow::Result<Arc<BlockManager>> {
        if let Some(manager) = GLOBAL.get() {
            return Ok(Arc::clone(manager));
        }

        // Only one thread may open the configured files.
        let _init = GLOBAL_INIT.lock().expect("block manager init poisoned");
        if let Some(manager) = GLOBAL.get() {
            return Ok(Arc::clone(manager));
        }
        let config = Config::load()?;
        let manager = Arc::new(Self::from_config(&config)?);
        let manager = GLOBAL.get_or_init(|| manager);
        Ok(Arc::clone(manager))
    }

    fn open_disk(index: usize, disk: &DiskConfig) -> Result<Arc<dyn FileBackend>, IoError> {
        let queue = disk.queue.unwrap_or(index);

        let backend: Arc<dyn FileBackend> = match disk.method {
            AccessMethod::Memory => {
                let label = disk.path.display().to_string();
                Arc::new(MemoryFile::new(&label, queue, index))
            }
            AccessMethod::Syscall | AccessMethod::Uring => {
                let options = FileOptions {
                    direct: disk.direct,
                    native_async: disk.method == AccessMethod::Uring,
                    truncate: disk.delete_on_exit,
                };
                let file = SyscallFile::open(&disk.path, options, queue, index)?;

                if disk.lock {
                    if let Err(err) = file.lock() {
                        warn!(disk = index, error = %err, "could not lock disk file");
                    }
                }
                if disk.capacity > 0 && file.size()? < disk.capacity {
                    file.set_size(disk.capacity)?;
                }
                // Scratch files are unlinked right away; the open descriptor
                // keeps the data reachable until the process exits.
                if disk.delete_on_exit {
                    file.remove()?;
                    debug!(disk = index, path = file.path(), "unlinked scratch disk");
                }
                Arc::new(file)
            }
        };

        Ok(backend)
    }

    pub fn disks(&self) -> usize {
        self.disks.len()
    }

    pub fn registry(&self) -> &Arc<DiskRegistry> {
        &self.registry
    }

    pub fn disk_config(&self, disk: usize) -> Result<&DiskConfig, AllocError> {
        Ok(&self.disk(disk)?.config)
    }

    pub fn file(&self, disk: usize) -> Result<&DiskFile, AllocError> {
        Ok(&self.disk(disk)?.file)
    }

    fn disk(&self, disk: usize) -> Result<&Disk, AllocError> {
        self.disks.get(disk).ok_or(AllocError::UnknownDisk(disk))
    }

    /// Allocates `block_size` bytes on the disk `strategy` picks for block `index`.
    pub fn new_block(
        &self,
        strategy: &mut dyn AllocStrategy,
        block_size: usize,
        index: usize,
    ) -> Result<Bid, AllocError> {
        let disk = strategy.disk(index);
        self.allocate_on(disk, block_size)
    }

    /// Allocates `count` blocks; block `k` goes to `strategy.disk(first_index + k)`.
    /// Nothing stays allocated if any of them fails.
    pub fn new_blocks(
        &self,
        strategy: &mut dyn AllocStrategy,
        count: usize,
        block_size: usize,
        first_index: usize,
    ) -> Result<Vec<Bid>, AllocError> {
        let mut bids = Vec::with_capacity(count);
        for k in 0..count {
            match self.new_block(strategy, block_size, first_index + k) {
                Ok(bid) => bids.push(bid),
                Err(err) => {
                    self.delete_blocks(&bids)?;
                    return Err(err);
                }
            }
        }

        debug!(count, block_size, strategy = strategy.name(), "allocated blocks");
        Ok(bids)
    }

    /// Allocates the blocks of several runs that will be merged together.
    /// Block `pos` of run `run` is placed by `strategy.disk(pos * nruns + run)`.
    pub fn new_interleaved_runs(
        &self,
        strategy: &mut dyn AllocStrategy,
        run_lengths: &[usize],
        block_size: usize,
    ) -> Result<InterleavedRuns, AllocError> {
        let nruns = run_lengths.len();
        let longest = run_lengths.iter().copied().max().unwrap_or(0);

        let mut runs = InterleavedRuns::with_lengths(run_lengths);
        let mut slots = vec![None; runs.len()];
        let mut done = Vec::new();

        for pos in 0..longest {
            for (run, &length) in run_lengths.iter().enumerate() {
                if pos >= length {
                    continue;
                }
                match self.new_block(strategy, block_size, pos * nruns + run) {
                    Ok(bid) => {
                        slots[runs.index(run, pos)] = Some(bid);
                        done.push(bid);
                    }
                    Err(err) => {
                        self.delete_blocks(&done)?;
                        return Err(err);
                    }
                }
            }
        }

        runs.bids = slots.into_iter().flatten().collect();
        debug_assert_eq!(runs.bids.len(), runs.starts[nruns]);
        Ok(runs)
    }

    fn allocate_on(&self, disk: usize, block_size: usize) -> Result<Bid, AllocError> {
        let entry = self.disk(disk)?;
        let (offset, extent) = {
            let mut allocator = entry.allocator.lock().expect("allocator poisoned");
            let before = allocator.total_bytes();
            let offset = allocator.allocate(block_size as u64)?;
            let after = allocator.total_bytes();
            (offset, (after > before).then_some(after))
        };

        // Grown disks get their backing file extended; writes past the end would
        // do it too, so failing here is not fatal.
        if let Some(extent) = extent {
            if entry.config.method != AccessMethod::Memory {
                if let Err(err) = entry.file.backend().set_size(extent) {
                    warn!(disk, extent, error = %err, "could not extend disk file");
                }
            }
        }

        Ok(Bid {
            disk,
            offset,
            size: block_size,
        })
    }

    pub fn delete_block(&self, bid: &Bid) -> Result<(), AllocError> {
        self.disk(bid.disk)?
            .allocator
            .lock()
            .expect("allocator poisoned")
            .deallocate(bid.offset, bid.size as u64)
    }

    /// Stops at the first error; corruption leaves the disk unusable anyway.
    pub fn delete_blocks(&self, bids: &[Bid]) -> Result<(), AllocError> {
        bids.iter().try_for_each(|bid| self.delete_block(bid))
    }

    /// Reads block `bid` into the first `bid.size` bytes of `buf`.
    pub fn aread(&self, bid: &Bid, buf: AlignedBuf) -> Result<Arc<Request>, IoError> {
        self.try_aread(bid, buf).map_err(|(err, _)| err)
    }

    pub fn awrite(&self, bid: &Bid, buf: AlignedBuf) -> Result<Arc<Request>, IoError> {
        self.try_awrite(bid, buf).map_err(|(err, _)| err)
    }

    /// Like [`BlockManager::aread`], but `buf` is handed back if the read
    /// cannot be queued.
    pub fn try_aread(
        &self,
        bid: &Bid,
        buf: AlignedBuf,
    ) -> Result<Arc<Request>, (IoError, AlignedBuf)> {
        self.try_submit(RequestKind::Read, bid, buf)
    }

    pub fn try_awrite(
        &self,
        bid: &Bid,
        buf: AlignedBuf,
    ) -> Result<Arc<Request>, (IoError, AlignedBuf)> {
        self.try_submit(RequestKind::Write, bid, buf)
    }

    fn try_submit(
        &self,
        kind: RequestKind,
        bid: &Bid,
        buf: AlignedBuf,
    ) -> Result<Arc<Request>, (IoError, AlignedBuf)> {
        let file = match self.io_file(bid) {
            Ok(file) => file,
            Err(err) => return Err((err, buf)),
        };
        let request = Request::try_new(Arc::clone(file.backend()), kind, buf, bid.offset, bid.size)?;
        file.try_submit(request)
    }

    pub fn cancel(&self, request: &Arc<Request>) -> bool {
        self.registry.cancel(request)
    }

    /// The disk file `bid` lives on, or why no I/O can be issued for it.
    pub fn io_file(&self, bid: &Bid) -> Result<&DiskFile, IoError> {
        self.file(bid.disk)
            .map_err(|err| IoError::InvalidArgument(format!("{bid}: {err}")))
    }

    pub fn total_bytes(&self) -> u64 {
        self.fold(|a| a.total_bytes())
    }

    pub fn free_bytes(&self) -> u64 {
        self.fold(|a| a.free_bytes())
    }

    pub fn used_bytes(&self) -> u64 {
        self.fold(|a| a.used_bytes())
    }

    pub fn disk_free_bytes(&self, disk: usize) -> Result<u64, AllocError> {
        Ok(self
            .disk(disk)?
            .allocator
            .lock()
            .expect("allocator poisoned")
            .free_bytes())
    }

    fn fold(&self, f: impl Fn(&BlockAllocator) -> u64) -> u64 {
        self.disks
            .iter()
            .map(|disk| f(&disk.allocator.lock().expect("allocator poisoned")))
            .sum()
    }
}

impl Drop for BlockManager {
    fn drop(&mut self) {
        for (index, disk) in self.disks.iter().enumerate() {
            let used = disk
                .allocator
                .lock()
                .map(|allocator| allocator.used_bytes())
                .unwrap_or(0);
            if used > 0 {
                debug!(disk = index, used, "block manager dropped with live blocks");
            }
        }
    }
}

/// Blocks of several runs in one flat arena. Run `r` occupies
/// `bids[starts[r]..starts[r + 1]]`, so block `pos` of run `r` lives at
/// `starts[r] + pos`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterleavedRuns {
    bids: Vec<Bid>,
    starts: Vec<usize>,
}

impl InterleavedRuns {
    fn with_lengths(run_lengths: &[usize]) -> Self {
        let mut starts = Vec::with_capacity(run_lengths.len() + 1);
        let mut total = 0;
        starts.push(0);
        for length in run_lengths {
            total += length;
            starts.push(total);
        }
        Self {
            bids: Vec::with_capacity(total),
            starts,
        }
    }

    pub fn runs(&self) -> usize {
        self.starts.len().saturating_sub(1)
    }

    /// Total number of blocks.
    pub fn len(&self) -> usize {
        self.starts.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn run_len(&self, run: usize) -> usize {
        self.starts[run + 1] - self.starts[run]
    }

    /// Flat index of block `pos` of run `run`.
    pub fn index(&self, run: usize, pos: usize) -> usize {
        debug_assert!(run < self.runs(), "run {run} out of range");
        debug_assert!(pos < self.run_len(run), "block {pos} out of range for run {run}");
        self.starts[run] + pos
    }

    pub fn get(&self, run: usize, pos: usize) -> Option<&Bid> {
        if run >= self.runs() || pos >= self.run_len(run) {
            return None;
        }
        self.bids.get(self.starts[run] + pos)
    }

    pub fn run(&self, run: usize) -> &[Bid] {
        &self.bids[self.starts[run]..self.starts[run + 1]]
    }

    pub fn as_slice(&self) -> &[Bid] {
        &self.bids
    }

    pub fn into_bids(self) -> Vec<Bid> {
        self.bids
    }
}

#[cfg(test)]
pub mod test {
    use std::sync::Arc;

    use super::{BlockManager, InterleavedRuns};
    use crate::{
        buffer::aligned::AlignedBuf,
        config::{AccessMethod, Config, DiskConfig},
        error::AllocError,
        storage::{
            block::strategy::{InterleavedStriping, SingleDisk, Striping},
            disk::registry::DiskRegistry,
        },
    };

    fn memory_manager(disks: usize, mib: u64) -> BlockManager {
        let config = Config::new(
            (0..disks)
                .map(|i| DiskConfig::new(format!("ram{i}"), mib, AccessMethod::Memory))
                .collect(),
        );
        BlockManager::new(&config, Arc::new(DiskRegistry::new())).unwrap()
    }

    #[test]
    fn new_blocks_striped_test() {
        let manager = memory_manager(3, 1);
        let bids = manager
            .new_blocks(&mut Striping::new(0, 3), 7, 4096, 0)
            .unwrap();

        let disks: Vec<usize> = bids.iter().map(|bid| bid.disk).collect();
        assert_eq!(vec![0, 1, 2, 0, 1, 2, 0], disks);
        assert_eq!(7 * 4096, manager.used_bytes());
        assert_eq!(3 << 20, manager.total_bytes());

        manager.delete_blocks(&bids).unwrap();
        assert_eq!(0, manager.used_bytes());
    }

    #[test]
    fn failed_batch_rolls_back_test() {
        let manager = memory_manager(1, 1);
        let err = manager
            .new_blocks(&mut SingleDisk::new(0), 300, 4096, 0)
            .unwrap_err();
        assert!(matches!(err, AllocError::OutOfSpace { .. }));
        assert_eq!(0, manager.used_bytes());

        let err = manager
            .new_blocks(&mut SingleDisk::new(5), 1, 4096, 0)
            .unwrap_err();
        assert_eq!(AllocError::UnknownDisk(5), err);
    }

    #[test]
    fn double_delete_test() {
        let manager = memory_manager(1, 1);
        let bids = manager
            .new_blocks(&mut SingleDisk::new(0), 2, 4096, 0)
            .unwrap();
        manager.delete_block(&bids[0]).unwrap();
        assert!(matches!(
            manager.delete_block(&bids[0]),
            Err(AllocError::DoubleFree { .. })
        ));
    }

    #[test]
    fn interleaved_runs_test() {
        let manager = memory_manager(2, 1);
        let lengths = [3, 1, 2];
        let runs = manager
            .new_interleaved_runs(&mut InterleavedStriping::new(3, 0, 2), &lengths, 4096)
            .unwrap();

        assert_eq!(3, runs.runs());
        assert_eq!(6, runs.len());
        for (run, &length) in lengths.iter().enumerate() {
            assert_eq!(length, runs.run(run).len());
            for pos in 0..length {
                // Each run stripes over both disks on its own.
                assert_eq!(pos % 2, runs.get(run, pos).unwrap().disk);
            }
        }
        assert!(runs.get(1, 1).is_none());
        assert!(runs.get(3, 0).is_none());
        assert_eq!(4, runs.index(2, 1));

        manager.delete_blocks(runs.as_slice()).unwrap();
        assert_eq!(0, manager.used_bytes());
        assert!(InterleavedRuns::default().is_empty());
    }

    #[test]
    fn block_io_test() {
        let manager = memory_manager(2, 1);
        let bids = manager
            .new_blocks(&mut Striping::new(0, 2), 4, 512, 0)
            .unwrap();

        let writes: Vec<_> = bids
            .iter()
            .enumerate()
            .map(|(i, bid)| manager.awrite(bid, AlignedBuf::filled(512, i as u8 + 1)).unwrap())
            .collect();
        for request in &writes {
            request.wait().unwrap();
        }

        for (i, bid) in bids.iter().enumerate() {
            let request = manager.aread(bid, AlignedBuf::new(512)).unwrap();
            request.wait().unwrap();
            let buf = request.take_buffer().unwrap();
            assert!(buf.iter().all(|&b| b == i as u8 + 1));
        }
    }

    #[test]
    fn scratch_disk_unlinked_test() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch");
        let mut disk = DiskConfig::new(&path, 0, AccessMethod::Syscall);
        disk.delete_on_exit = true;

        let manager =
            BlockManager::new(&Config::new(vec![disk]), Arc::new(DiskRegistry::new())).unwrap();
        assert!(!path.exists());

        // Still usable through the open descriptor.
        let bid = manager
            .new_block(&mut SingleDisk::new(0), 4096, 0)
            .unwrap();
        manager
            .awrite(&bid, AlignedBuf::filled(4096, 3))
            .unwrap()
            .wait()
            .unwrap();
        let request = manager.aread(&bid, AlignedBuf::new(4096)).unwrap();
        request.wait().unwrap();
        assert!(request.take_buffer().unwrap().iter().all(|&b| b == 3));
    }
}
