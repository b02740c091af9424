use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    fmt,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    slice,
};

/// Alignment every block buffer gets; satisfies O_DIRECT on common filesystems.
pub const BLOCK_ALIGNMENT: usize = 4096;

/// Heap buffer aligned to [`BLOCK_ALIGNMENT`], the unit handed to requests.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// The buffer is uniquely owned heap memory.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Zeroed buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        // Zero-sized layouts are not allowed by the allocator.
        let layout = Layout::from_size_align(len.max(1), BLOCK_ALIGNMENT)
            .expect("block size overflows the address space");

        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => std::alloc::handle_alloc_error(layout),
        };

        Self { ptr, len, layout }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::new(data.len());
        buf.copy_from_slice(data);
        buf
    }

    pub fn filled(len: usize, byte: u8) -> Self {
        let mut buf = Self::new(len);
        buf.fill(byte);
        buf
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("len", &self.len)
            .field("ptr", &self.ptr)
            .finish()
    }
}
