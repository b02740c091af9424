use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::storage::disk::request::RequestKind;

/// Failure of a single request. Cloned to every party waiting on that request.
#[derive(Error, Debug, Clone)]
pub enum IoError {
    #[error("{op} of {len} bytes at offset {offset} on {path} failed: {source}")]
    Os {
        op: RequestKind,
        offset: u64,
        len: usize,
        path: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("{op} of {len} bytes at offset {offset} on {path} is not aligned to {align} bytes")]
    Unaligned {
        op: RequestKind,
        offset: u64,
        len: usize,
        path: String,
        align: usize,
    },

    #[error("short write on {path}: {written} of {len} bytes at offset {offset}")]
    ShortWrite {
        offset: u64,
        len: usize,
        written: usize,
        path: String,
    },

    #[error("{op} of {len} bytes at offset {offset} on {path} was canceled")]
    Canceled {
        op: RequestKind,
        offset: u64,
        len: usize,
        path: String,
    },

    #[error("invalid request: {0}")]
    InvalidArgument(String),

    #[error("{what} on {path} failed: {source}")]
    Backend {
        what: &'static str,
        path: String,
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl IoError {
    pub(crate) fn backend(what: &'static str, path: &str, source: std::io::Error) -> Self {
        IoError::Backend {
            what,
            path: path.to_string(),
            source: Arc::new(source),
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, IoError::Canceled { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("disk {disk}: no free region of {requested} bytes ({free} bytes free)")]
    OutOfSpace {
        disk: usize,
        requested: u64,
        free: u64,
    },

    /// The region being returned overlaps space that is already free. Fatal: the
    /// logical to physical block mapping can no longer be trusted.
    #[error(
        "disk {disk}: deallocation of [{offset}, {end}) overlaps free region [{free_start}, {free_end})",
        end = .offset + .len,
        free_end = .free_start + .free_len
    )]
    DoubleFree {
        disk: usize,
        offset: u64,
        len: u64,
        free_start: u64,
        free_len: u64,
    },

    /// The region being returned lies (partly) outside the disk. Fatal like
    /// [`AllocError::DoubleFree`].
    #[error("disk {disk}: deallocation of {len} bytes at {offset} exceeds the disk size {capacity}")]
    OutOfRange {
        disk: usize,
        offset: u64,
        len: u64,
        capacity: u64,
    },

    #[error("disk {0} is not configured")]
    UnknownDisk(usize),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read disk configuration {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {reason}")]
    Parse {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("{path}:{line}: unknown access method `{method}`")]
    UnknownMethod {
        path: String,
        line: usize,
        method: String,
    },
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Read => f.write_str("read"),
            RequestKind::Write => f.write_str("write"),
        }
    }
}
