use std::sync::{Condvar, Mutex};

use crate::{
    error::IoError,
    storage::disk::{
        file::{FileBackend, MemoryFile, QueueId},
        request::RequestKind,
    },
};

struct GateState {
    open: bool,
    entered: usize,
}

/// Memory disk whose worker blocks inside `serve` until the gate opens, and
/// which records the order requests were served in.
pub struct GateFile {
    inner: MemoryFile,
    state: Mutex<GateState>,
    cond: Condvar,
    served: Mutex<Vec<(RequestKind, u64)>>,
}

impl GateFile {
    pub fn new(label: &str, queue: QueueId) -> Self {
        Self {
            inner: MemoryFile::new(label, queue, 0),
            state: Mutex::new(GateState {
                open: false,
                entered: 0,
            }),
            cond: Condvar::new(),
            served: Mutex::new(Vec::new()),
        }
    }

    /// Blocks until `n` requests have reached `serve`.
    pub fn wait_entered(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        while state.entered < n {
            state = self.cond.wait(state).unwrap();
        }
    }

    pub fn open(&self) {
        self.state.lock().unwrap().open = true;
        self.cond.notify_all();
    }

    pub fn served(&self) -> Vec<(RequestKind, u64)> {
        self.served.lock().unwrap().clone()
    }
}

impl FileBackend for GateFile {
    fn serve(&self, kind: RequestKind, buf: &mut [u8], offset: u64) -> Result<(), IoError> {
        {
            let mut state = self.state.lock().unwrap();
            state.entered += 1;
            self.cond.notify_all();
            while !state.open {
                state = self.cond.wait(state).unwrap();
            }
        }
        self.served.lock().unwrap().push((kind, offset));
        self.inner.serve(kind, buf, offset)
    }

    fn size(&self) -> Result<u64, IoError> {
        self.inner.size()
    }

    fn set_size(&self, new_size: u64) -> Result<(), IoError> {
        self.inner.set_size(new_size)
    }

    fn lock(&self) -> Result<(), IoError> {
        Ok(())
    }

    fn queue_id(&self) -> QueueId {
        self.inner.queue_id()
    }

    fn allocator_id(&self) -> usize {
        0
    }

    fn path(&self) -> &str {
        self.inner.path()
    }

    fn io_type(&self) -> &'static str {
        "gate"
    }
}
