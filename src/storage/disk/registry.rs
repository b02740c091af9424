use std::sync::{Arc, Mutex, OnceLock};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::IoError;

use super::{
    file::{FileBackend, QueueId},
    request::Request,
    scheduler::{PriorityOp, ThreadedQueue},
};

#[cfg(target_os = "linux")]
use super::uring::{UringQueue, DEFAULT_DEPTH};

/// The queue serving one disk identity. The variant is fixed when the queue is
/// created, from the backend's capabilities.
pub enum DiskQueue {
    Threaded(ThreadedQueue),
    #[cfg(target_os = "linux")]
    Uring(UringQueue),
}

impl DiskQueue {
    fn for_backend(file: &dyn FileBackend, priority: PriorityOp) -> Self {
        if file.prefers_native_async() {
            if let Some(queue) = Self::native(file, priority) {
                return queue;
            }
        }
        DiskQueue::Threaded(ThreadedQueue::new(file.queue_id(), priority))
    }

    #[cfg(target_os = "linux")]
    fn native(file: &dyn FileBackend, priority: PriorityOp) -> Option<Self> {
        match UringQueue::new(file.queue_id(), priority, DEFAULT_DEPTH) {
            Ok(queue) => Some(DiskQueue::Uring(queue)),
            Err(err) => {
                warn!(
                    queue = file.queue_id(),
                    path = file.path(),
                    error = %err,
                    "io_uring unavailable, falling back to a threaded queue"
                );
                None
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn native(file: &dyn FileBackend, _priority: PriorityOp) -> Option<Self> {
        warn!(
            queue = file.queue_id(),
            path = file.path(),
            "native async I/O needs Linux, using a threaded queue"
        );
        None
    }

    pub fn id(&self) -> QueueId {
        match self {
            DiskQueue::Threaded(queue) => queue.id(),
            #[cfg(target_os = "linux")]
            DiskQueue::Uring(queue) => queue.id(),
        }
    }

    pub fn is_native_async(&self) -> bool {
        !matches!(self, DiskQueue::Threaded(_))
    }

    pub fn add_request(&self, request: Arc<Request>) -> Result<(), IoError> {
        match self {
            DiskQueue::Threaded(queue) => queue.add_request(request),
            #[cfg(target_os = "linux")]
            DiskQueue::Uring(queue) => queue.add_request(request),
        }
    }

    pub fn cancel_request(&self, request: &Arc<Request>) -> bool {
        match self {
            DiskQueue::Threaded(queue) => queue.cancel_request(request),
            #[cfg(target_os = "linux")]
            DiskQueue::Uring(queue) => queue.cancel_request(request),
        }
    }

    pub fn set_priority_op(&self, priority: PriorityOp) {
        match self {
            DiskQueue::Threaded(queue) => queue.set_priority_op(priority),
            #[cfg(target_os = "linux")]
            DiskQueue::Uring(queue) => queue.set_priority_op(priority),
        }
    }

    /// Requests waiting to be dequeued.
    pub fn pending(&self) -> usize {
        match self {
            DiskQueue::Threaded(queue) => queue.pending(),
            #[cfg(target_os = "linux")]
            DiskQueue::Uring(queue) => queue.pending(),
        }
    }
}

/// Maps disk identities to their queues. Queues are created on first use and
/// torn down (after draining) on [`DiskRegistry::shutdown`] or drop.
pub struct DiskRegistry {
    queues: DashMap<QueueId, Arc<DiskQueue>>,
    priority: Mutex<PriorityOp>,
}

static GLOBAL: OnceLock<Arc<DiskRegistry>> = OnceLock::new();

impl Default for DiskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskRegistry {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            priority: Mutex::new(PriorityOp::default()),
        }
    }

    pub fn global() -> &'static Arc<DiskRegistry> {
        GLOBAL.get_or_init(|| Arc::new(DiskRegistry::new()))
    }

    pub fn get_or_create_queue(&self, file: &dyn FileBackend) -> Arc<DiskQueue> {
        let id = file.queue_id();
        if let Some(queue) = self.queues.get(&id) {
            return Arc::clone(queue.value());
        }

        let priority = *self.priority.lock().expect("registry poisoned");
        let entry = self.queues.entry(id).or_insert_with(|| {
            debug!(queue = id, path = file.path(), io = file.io_type(), "creating disk queue");
            Arc::new(DiskQueue::for_backend(file, priority))
        });
        Arc::clone(entry.value())
    }

    pub fn queue(&self, id: QueueId) -> Option<Arc<DiskQueue>> {
        self.queues.get(&id).map(|queue| Arc::clone(queue.value()))
    }

    /// Hands the request to the queue of its backend.
    pub fn route(&self, request: Arc<Request>) -> Result<(), IoError> {
        let queue = self.get_or_create_queue(request.file().as_ref());
        queue.add_request(request)
    }

    /// False if the request was already dispatched or its disk has no queue.
    pub fn cancel(&self, request: &Arc<Request>) -> bool {
        match self.queue(request.file().queue_id()) {
            Some(queue) => queue.cancel_request(request),
            None => false,
        }
    }

    /// Cancels every request still pending; returns how many were removed.
    pub fn cancel_all(&self, requests: &[Arc<Request>]) -> usize {
        requests.iter().filter(|r| self.cancel(r)).count()
    }

    pub fn set_global_priority_op(&self, priority: PriorityOp) {
        *self.priority.lock().expect("registry poisoned") = priority;
        for queue in self.queues.iter() {
            queue.value().set_priority_op(priority);
        }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Drops every queue. Each worker finishes its queued requests first.
    pub fn shutdown(&self) {
        let ids: Vec<QueueId> = self.queues.iter().map(|queue| *queue.key()).collect();
        for id in ids {
            if let Some((_, queue)) = self.queues.remove(&id) {
                debug!(queue = id, "shutting down disk queue");
                drop(queue);
            }
        }
    }
}
