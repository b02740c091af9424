use std::{
    fs::{File, OpenOptions},
    io::ErrorKind,
    os::{
        fd::{AsRawFd, RawFd},
        unix::fs::FileExt,
    },
    path::Path,
    sync::{Arc, Mutex},
};

use tracing::debug;

use crate::{buffer::aligned::AlignedBuf, error::IoError};

use super::{
    registry::DiskRegistry,
    request::{Request, RequestKind},
};

/// Identity of the queue (worker) a backend is served by.
pub type QueueId = usize;

/// Alignment O_DIRECT transfers must respect (offset, length and buffer).
pub const DIRECT_ALIGNMENT: usize = 4096;

/// Contract every storage backend satisfies. `serve` runs on the queue worker
/// and blocks until the transfer is done.
pub trait FileBackend: Send + Sync {
    /// Transfers `buf.len()` bytes at `offset`. Reads extending past the end
    /// of the file come back zero-filled.
    fn serve(&self, kind: RequestKind, buf: &mut [u8], offset: u64) -> Result<(), IoError>;

    fn size(&self) -> Result<u64, IoError>;

    fn set_size(&self, new_size: u64) -> Result<(), IoError>;

    /// Best-effort advisory exclusive lock.
    fn lock(&self) -> Result<(), IoError>;

    fn queue_id(&self) -> QueueId;

    fn allocator_id(&self) -> usize;

    fn path(&self) -> &str;

    fn io_type(&self) -> &'static str;

    /// Whether the registry should serve this backend with a native
    /// asynchronous queue instead of a worker thread.
    fn prefers_native_async(&self) -> bool {
        false
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    /// Deletes the backing storage. Called once at teardown for scratch disks.
    fn remove(&self) -> Result<(), IoError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileOptions {
    pub direct: bool,
    pub native_async: bool,
    pub truncate: bool,
}

/// Plain file served with positional reads and writes.
pub struct SyscallFile {
    file: File,
    path: String,
    queue: QueueId,
    allocator: usize,
    direct: bool,
    native_async: bool,
}

impl SyscallFile {
    pub fn open(
        path: impl AsRef<Path>,
        options: FileOptions,
        queue: QueueId,
        allocator: usize,
    ) -> Result<Self, IoError> {
        let path = path.as_ref();
        let label = path.display().to_string();

        let mut open = OpenOptions::new();
        open.read(true)
            .write(true)
            .create(true)
            .truncate(options.truncate);

        if options.direct {
            direct_flags(&mut open, &label);
        }

        let file = open
            .open(path)
            .map_err(|err| IoError::backend("open", &label, err))?;

        debug!(path = %label, queue, allocator, direct = options.direct, "opened disk file");

        Ok(Self {
            file,
            path: label,
            queue,
            allocator,
            direct: options.direct && cfg!(target_os = "linux"),
            native_async: options.native_async,
        })
    }

    fn os_error(&self, op: RequestKind, offset: u64, len: usize, err: std::io::Error) -> IoError {
        IoError::Os {
            op,
            offset,
            len,
            path: self.path.clone(),
            source: Arc::new(err),
        }
    }

    fn check_alignment(&self, op: RequestKind, buf: &[u8], offset: u64) -> Result<(), IoError> {
        let align = DIRECT_ALIGNMENT;
        if offset % align as u64 != 0
            || buf.len() % align != 0
            || buf.as_ptr() as usize % align != 0
        {
            return Err(IoError::Unaligned {
                op,
                offset,
                len: buf.len(),
                path: self.path.clone(),
                align,
            });
        }
        Ok(())
    }
}

impl FileBackend for SyscallFile {
    fn serve(&self, kind: RequestKind, buf: &mut [u8], offset: u64) -> Result<(), IoError> {
        if self.direct {
            self.check_alignment(kind, buf, offset)?;
        }

        let len = buf.len();
        let mut done = 0usize;
        match kind {
            RequestKind::Read => {
                while done < len {
                    match self.file.read_at(&mut buf[done..], offset + done as u64) {
                        // End of file: the rest reads as zeros.
                        Ok(0) => {
                            buf[done..].fill(0);
                            break;
                        }
                        Ok(n) => done += n,
                        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                        Err(err) => return Err(self.os_error(kind, offset, len, err)),
                    }
                }
            }
            RequestKind::Write => {
                while done < len {
                    match self.file.write_at(&buf[done..], offset + done as u64) {
                        Ok(0) => {
                            return Err(IoError::ShortWrite {
                                offset,
                                len,
                                written: done,
                                path: self.path.clone(),
                            })
                        }
                        Ok(n) => done += n,
                        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                        Err(err) => return Err(self.os_error(kind, offset, len, err)),
                    }
                }
            }
        }
        Ok(())
    }

    fn size(&self) -> Result<u64, IoError> {
        self.file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| IoError::backend("stat", &self.path, err))
    }

    fn set_size(&self, new_size: u64) -> Result<(), IoError> {
        self.file
            .set_len(new_size)
            .map_err(|err| IoError::backend("resize", &self.path, err))
    }

    fn lock(&self) -> Result<(), IoError> {
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(IoError::backend(
                "lock",
                &self.path,
                std::io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    fn queue_id(&self) -> QueueId {
        self.queue
    }

    fn allocator_id(&self) -> usize {
        self.allocator
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn io_type(&self) -> &'static str {
        if self.native_async {
            "uring"
        } else {
            "syscall"
        }
    }

    fn prefers_native_async(&self) -> bool {
        self.native_async
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }

    fn remove(&self) -> Result<(), IoError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(IoError::backend("remove", &self.path, err)),
        }
    }
}

#[cfg(target_os = "linux")]
fn direct_flags(open: &mut OpenOptions, _path: &str) {
    use std::os::unix::fs::OpenOptionsExt;
    open.custom_flags(libc::O_DIRECT);
}

#[cfg(not(target_os = "linux"))]
fn direct_flags(_open: &mut OpenOptions, path: &str) {
    tracing::warn!(path, "direct I/O is only supported on Linux, opening buffered");
}

/// RAM-backed disk. Grows on writes past its end.
pub struct MemoryFile {
    data: Mutex<Vec<u8>>,
    label: String,
    queue: QueueId,
    allocator: usize,
}

impl MemoryFile {
    pub fn new(label: &str, queue: QueueId, allocator: usize) -> Self {
        Self {
            data: Mutex::new(Vec::new()),
            label: label.to_string(),
            queue,
            allocator,
        }
    }
}

impl FileBackend for MemoryFile {
    fn serve(&self, kind: RequestKind, buf: &mut [u8], offset: u64) -> Result<(), IoError> {
        let mut data = self.data.lock().expect("memory file poisoned");
        let start = offset as usize;
        let end = start + buf.len();

        match kind {
            RequestKind::Read => {
                let available = data.len().saturating_sub(start).min(buf.len());
                if available > 0 {
                    buf[..available].copy_from_slice(&data[start..start + available]);
                }
                buf[available..].fill(0);
            }
            RequestKind::Write => {
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[start..end].copy_from_slice(buf);
            }
        }
        Ok(())
    }

    fn size(&self) -> Result<u64, IoError> {
        Ok(self.data.lock().expect("memory file poisoned").len() as u64)
    }

    fn set_size(&self, new_size: u64) -> Result<(), IoError> {
        self.data
            .lock()
            .expect("memory file poisoned")
            .resize(new_size as usize, 0);
        Ok(())
    }

    fn lock(&self) -> Result<(), IoError> {
        Ok(())
    }

    fn queue_id(&self) -> QueueId {
        self.queue
    }

    fn allocator_id(&self) -> usize {
        self.allocator
    }

    fn path(&self) -> &str {
        &self.label
    }

    fn io_type(&self) -> &'static str {
        "memory"
    }
}

/// A backend plus the registry its requests are routed through.
#[derive(Clone)]
pub struct DiskFile {
    backend: Arc<dyn FileBackend>,
    registry: Arc<DiskRegistry>,
}

impl DiskFile {
    pub fn new(backend: Arc<dyn FileBackend>, registry: Arc<DiskRegistry>) -> Self {
        Self { backend, registry }
    }

    pub fn backend(&self) -> &Arc<dyn FileBackend> {
        &self.backend
    }

    pub fn aread(&self, buf: AlignedBuf, offset: u64, len: usize) -> Result<Arc<Request>, IoError> {
        let request = Request::new(Arc::clone(&self.backend), RequestKind::Read, buf, offset, len)?;
        self.submit(request)
    }

    pub fn awrite(&self, buf: AlignedBuf, offset: u64, len: usize) -> Result<Arc<Request>, IoError> {
        let request = Request::new(Arc::clone(&self.backend), RequestKind::Write, buf, offset, len)?;
        self.submit(request)
    }

    /// Routes a prepared request (e.g. one carrying a completion callback).
    pub fn submit(&self, request: Request) -> Result<Arc<Request>, IoError> {
        let request = Arc::new(request);
        self.registry.route(Arc::clone(&request))?;
        Ok(request)
    }

    /// Like [`DiskFile::submit`], but the buffer comes back if no queue takes
    /// the request.
    pub fn try_submit(&self, request: Request) -> Result<Arc<Request>, (IoError, AlignedBuf)> {
        let request = Arc::new(request);
        match self.registry.route(Arc::clone(&request)) {
            Ok(()) => Ok(request),
            Err(err) => {
                let buf = request
                    .take_unqueued_buffer()
                    .unwrap_or_else(|| AlignedBuf::new(request.len()));
                Err((err, buf))
            }
        }
    }

    pub fn cancel(&self, request: &Arc<Request>) -> bool {
        self.registry.cancel(request)
    }
}
