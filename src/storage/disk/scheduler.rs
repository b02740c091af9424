use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

use tracing::{debug, trace, warn};

use crate::{error::IoError, utils::semaphore::Semaphore};

use super::{
    file::QueueId,
    request::{Request, RequestKind},
};

/// Which side of a queue is served when both have work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriorityOp {
    ReadFirst,
    WriteFirst,
    #[default]
    Alternate,
}

/// The two FIFOs of one disk and the policy choosing between them.
pub struct PendingRequests {
    reads: VecDeque<Arc<Request>>,
    writes: VecDeque<Arc<Request>>,
    priority: PriorityOp,
    // Side currently served under `Alternate`
    serving_reads: bool,
}

impl PendingRequests {
    pub fn new(priority: PriorityOp) -> Self {
        Self {
            reads: VecDeque::new(),
            writes: VecDeque::new(),
            priority,
            serving_reads: true,
        }
    }

    pub fn set_priority(&mut self, priority: PriorityOp) {
        self.priority = priority;
    }

    pub fn priority(&self) -> PriorityOp {
        self.priority
    }

    fn side(&self, kind: RequestKind) -> &VecDeque<Arc<Request>> {
        match kind {
            RequestKind::Read => &self.reads,
            RequestKind::Write => &self.writes,
        }
    }

    fn side_mut(&mut self, kind: RequestKind) -> &mut VecDeque<Arc<Request>> {
        match kind {
            RequestKind::Read => &mut self.reads,
            RequestKind::Write => &mut self.writes,
        }
    }

    /// Appends to the matching FIFO. Warns if another pending request already
    /// targets the same file and offset; the request is queued regardless.
    pub fn push(&mut self, request: Arc<Request>) {
        let duplicate = self
            .reads
            .iter()
            .chain(self.writes.iter())
            .any(|pending| pending.same_target(&request));
        if duplicate {
            warn!(
                path = request.file().path(),
                offset = request.offset(),
                kind = %request.kind(),
                "another request for the same block is still pending"
            );
        }

        self.side_mut(request.kind()).push_back(request);
    }

    /// Removes a request that has not been dequeued yet.
    pub fn remove(&mut self, request: &Arc<Request>) -> bool {
        let queue = self.side_mut(request.kind());
        match queue.iter().position(|r| Arc::ptr_eq(r, request)) {
            Some(index) => {
                queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Next request to serve under the current policy.
    pub fn next(&mut self) -> Option<Arc<Request>> {
        match self.priority {
            PriorityOp::ReadFirst => self.reads.pop_front().or_else(|| self.writes.pop_front()),
            PriorityOp::WriteFirst => self.writes.pop_front().or_else(|| self.reads.pop_front()),
            PriorityOp::Alternate => {
                let active = if self.serving_reads {
                    RequestKind::Read
                } else {
                    RequestKind::Write
                };
                let other = match active {
                    RequestKind::Read => RequestKind::Write,
                    RequestKind::Write => RequestKind::Read,
                };

                let request = match self.side_mut(active).pop_front() {
                    Some(request) => {
                        // Hand the turn over while the other side is waiting.
                        if !self.side(other).is_empty() || self.side(active).is_empty() {
                            self.serving_reads = !self.serving_reads;
                        }
                        request
                    }
                    None => {
                        self.serving_reads = !self.serving_reads;
                        self.side_mut(other).pop_front()?
                    }
                };
                Some(request)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.reads.len() + self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }
}

struct Shared {
    pending: Mutex<PendingRequests>,
    work: Semaphore,
    terminate: AtomicBool,
}

/// Serves one disk with a dedicated worker thread. Requests for the disk never
/// run concurrently.
pub struct ThreadedQueue {
    id: QueueId,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedQueue {
    pub fn new(id: QueueId, priority: PriorityOp) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingRequests::new(priority)),
            work: Semaphore::new(0),
            terminate: AtomicBool::new(false),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("disk-queue-{id}"))
                .spawn(move || Self::worker(id, shared))
                .expect("failed to spawn disk queue worker")
        };

        debug!(queue = id, ?priority, "started threaded disk queue");

        Self {
            id,
            shared,
            worker: Some(worker),
        }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn add_request(&self, request: Arc<Request>) -> Result<(), IoError> {
        if request.is_empty() {
            return Err(IoError::InvalidArgument(format!(
                "empty {} request on {}",
                request.kind(),
                request.file().path()
            )));
        }

        {
            // Checked under the queue lock so nothing slips in behind a shutdown.
            let mut pending = self.shared.pending.lock().expect("disk queue poisoned");
            if self.shared.terminate.load(Ordering::Acquire) {
                return Err(IoError::InvalidArgument(format!(
                    "disk queue {} is not running",
                    self.id
                )));
            }
            trace!(queue = self.id, ?request, "queued request");
            pending.push(request);
        }
        self.shared.work.signal();
        Ok(())
    }

    pub fn cancel_request(&self, request: &Arc<Request>) -> bool {
        let removed = self
            .shared
            .pending
            .lock()
            .expect("disk queue poisoned")
            .remove(request);

        // The semaphore unit stays behind; the worker wakes to an empty queue and moves on.
        if removed {
            request.mark_canceled();
        }
        removed
    }

    pub fn set_priority_op(&self, priority: PriorityOp) {
        self.shared
            .pending
            .lock()
            .expect("disk queue poisoned")
            .set_priority(priority);
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.lock().expect("disk queue poisoned").len()
    }

    fn worker(id: QueueId, shared: Arc<Shared>) {
        loop {
            shared.work.wait();

            let next = {
                let mut pending = shared.pending.lock().expect("disk queue poisoned");
                match pending.next() {
                    Some(request) => request,
                    None if shared.terminate.load(Ordering::Acquire) => break,
                    None => continue,
                }
            };

            if !next.begin_service() {
                continue;
            }
            let result = next.serve();
            next.complete(result);
        }

        debug!(queue = id, "disk queue worker exiting");
    }
}

impl Drop for ThreadedQueue {
    // Remaining queued requests are still served before the worker exits.
    fn drop(&mut self) {
        {
            let _pending = self.shared.pending.lock().expect("disk queue poisoned");
            self.shared.terminate.store(true, Ordering::Release);
        }
        self.shared.work.signal();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(queue = self.id, "disk queue worker panicked");
            }
        }
    }
}
