use std::collections::BTreeMap;

use tracing::{error, trace};

use crate::error::AllocError;

/// Free-space map of one disk: free region start -> length.
///
/// Regions are disjoint and fully coalesced. Returning a range that overlaps
/// free space is reported as [`AllocError::DoubleFree`] and must be treated as
/// fatal by the caller.
#[derive(Debug)]
pub struct BlockAllocator {
    disk: usize,
    free: BTreeMap<u64, u64>,
    capacity: u64,
    free_bytes: u64,
    autogrow: bool,
}

impl BlockAllocator {
    pub fn new(disk: usize, capacity: u64, autogrow: bool) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }

        Self {
            disk,
            free,
            capacity,
            free_bytes: capacity,
            autogrow,
        }
    }

    pub fn disk(&self) -> usize {
        self.disk
    }

    /// Current extent of the disk in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.capacity
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.capacity - self.free_bytes
    }

    pub fn autogrow(&self) -> bool {
        self.autogrow
    }

    pub fn free_regions(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.free.iter().map(|(&start, &len)| (start, len))
    }

    /// First-fit allocation of `bytes`. Auto-growing disks extend instead of
    /// failing.
    pub fn allocate(&mut self, bytes: u64) -> Result<u64, AllocError> {
        if bytes == 0 {
            return Err(AllocError::OutOfSpace {
                disk: self.disk,
                requested: 0,
                free: self.free_bytes,
            });
        }

        let fit = self
            .free
            .iter()
            .find(|(_, &len)| len >= bytes)
            .map(|(&start, &len)| (start, len));

        let (start, len) = match fit {
            Some(region) => region,
            None if self.autogrow => self.grow(bytes),
            None => {
                return Err(AllocError::OutOfSpace {
                    disk: self.disk,
                    requested: bytes,
                    free: self.free_bytes,
                })
            }
        };

        self.free.remove(&start);
        if len > bytes {
            self.free.insert(start + bytes, len - bytes);
        }
        self.free_bytes -= bytes;

        trace!(disk = self.disk, offset = start, bytes, "allocated region");
        Ok(start)
    }

    // Extends the disk so that its last free region holds at least `bytes`.
    // Returns that region.
    fn grow(&mut self, bytes: u64) -> (u64, u64) {
        let tail = match self.free.iter().next_back() {
            Some((&start, &len)) if start + len == self.capacity => len,
            _ => 0,
        };
        // At least double, so that a run of allocations grows the file a few times only.
        let extra = (bytes - tail).max(self.capacity);
        let old_end = self.capacity;

        self.capacity += extra;
        self.free_bytes += extra;
        let start = self.insert_coalesced(old_end, extra);

        trace!(disk = self.disk, capacity = self.capacity, "grew disk");
        (start, self.free[&start])
    }

    /// Returns `[offset, offset + bytes)` to the free set, merging with its
    /// neighbours.
    pub fn deallocate(&mut self, offset: u64, bytes: u64) -> Result<(), AllocError> {
        if bytes == 0 {
            return Ok(());
        }
        let end = match offset.checked_add(bytes) {
            Some(end) if end <= self.capacity => end,
            _ => {
                let err = AllocError::OutOfRange {
                    disk: self.disk,
                    offset,
                    len: bytes,
                    capacity: self.capacity,
                };
                error!(error = %err, "free-space map corruption");
                return Err(err);
            }
        };

        if let Some((&start, &len)) = self.free.range(..=offset).next_back() {
            if offset < start + len {
                return Err(self.corruption(offset, bytes, start, len));
            }
        }
        if let Some((&start, &len)) = self.free.range(offset + 1..).next() {
            if start < end {
                return Err(self.corruption(offset, bytes, start, len));
            }
        }

        self.insert_coalesced(offset, bytes);
        self.free_bytes += bytes;

        trace!(disk = self.disk, offset, bytes, "deallocated region");
        Ok(())
    }

    // Inserts a region known not to overlap free space; returns the start of
    // the merged region.
    fn insert_coalesced(&mut self, offset: u64, bytes: u64) -> u64 {
        let mut start = offset;
        let mut end = offset + bytes;

        let before = self
            .free
            .range(..offset)
            .next_back()
            .map(|(&s, &l)| (s, l));
        if let Some((prev_start, prev_len)) = before {
            if prev_start + prev_len == offset {
                self.free.remove(&prev_start);
                start = prev_start;
            }
        }

        if let Some(next_len) = self.free.remove(&end) {
            end += next_len;
        }

        self.free.insert(start, end - start);
        start
    }

    fn corruption(&self, offset: u64, len: u64, free_start: u64, free_len: u64) -> AllocError {
        let err = AllocError::DoubleFree {
            disk: self.disk,
            offset,
            len,
            free_start,
            free_len,
        };
        error!(error = %err, "free-space map corruption");
        err
    }
}
