//! Native asynchronous queue on top of Linux io_uring.
//!
//! Pending requests wait in the same read/write FIFOs the threaded queue uses;
//! the worker moves up to `depth` of them into the ring at a time and reaps
//! completions. Requests still waiting in the FIFOs cancel cleanly; requests
//! already in the ring get a best-effort `AsyncCancel`.

use std::{
    collections::HashMap,
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
    time::Instant,
};

use crossbeam_queue::SegQueue;
use io_uring::{opcode, squeue, types, IoUring};
use tracing::{debug, error, trace, warn};

use crate::{error::IoError, utils::stats::Stats};

use super::{
    file::QueueId,
    request::{Request, RequestKind},
    scheduler::{PendingRequests, PriorityOp},
};

pub const DEFAULT_DEPTH: u32 = 64;

// user_data of cancel entries; their completions carry no request.
const CANCEL_TAG: u64 = u64::MAX;

/// Largest transfer one ring entry can describe.
pub const MAX_TRANSFER: usize = u32::MAX as usize;

fn check_transfer(kind: RequestKind, len: usize, path: &str) -> Result<(), IoError> {
    if len == 0 {
        return Err(IoError::InvalidArgument(format!(
            "empty {kind} request on {path}"
        )));
    }
    if len > MAX_TRANSFER {
        return Err(IoError::InvalidArgument(format!(
            "{kind} of {len} bytes on {path} exceeds the {MAX_TRANSFER} byte io_uring limit"
        )));
    }
    Ok(())
}

struct Shared {
    pending: Mutex<PendingRequests>,
    wakeup: Condvar,
    cancels: SegQueue<Arc<Request>>,
    terminate: AtomicBool,
}

pub struct UringQueue {
    id: QueueId,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl UringQueue {
    /// Fails if the kernel refuses to set up a ring.
    pub fn new(id: QueueId, priority: PriorityOp, depth: u32) -> std::io::Result<Self> {
        let ring = IoUring::new(depth)?;

        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingRequests::new(priority)),
            wakeup: Condvar::new(),
            cancels: SegQueue::new(),
            terminate: AtomicBool::new(false),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("disk-uring-{id}"))
                .spawn(move || worker(id, shared, ring, depth as usize))?
        };

        debug!(queue = id, depth, ?priority, "started io_uring disk queue");

        Ok(Self {
            id,
            shared,
            worker: Some(worker),
        })
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn add_request(&self, request: Arc<Request>) -> Result<(), IoError> {
        check_transfer(request.kind(), request.len(), request.file().path())?;

        {
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
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// True only if the request was still waiting and is now canceled. Requests
    /// already handed to the kernel get an asynchronous cancel attempt.
    pub fn cancel_request(&self, request: &Arc<Request>) -> bool {
        let removed = self
            .shared
            .pending
            .lock()
            .expect("disk queue poisoned")
            .remove(request);

        if removed {
            request.mark_canceled();
        } else if !request.poll() {
            self.shared.cancels.push(Arc::clone(request));
            self.shared.wakeup.notify_one();
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
}

impl Drop for UringQueue {
    fn drop(&mut self) {
        {
            let _pending = self.shared.pending.lock().expect("disk queue poisoned");
            self.shared.terminate.store(true, Ordering::Release);
        }
        self.shared.wakeup.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(queue = self.id, "io_uring worker panicked");
            }
        }
    }
}

struct InFlight {
    request: Arc<Request>,
    started: Instant,
    fd: RawFd,
    ptr: *mut u8,
    // Bytes transferred by earlier completions.
    done: usize,
}

impl InFlight {
    fn new(request: Arc<Request>, fd: RawFd, ptr: *mut u8) -> Self {
        Self {
            request,
            started: Instant::now(),
            fd,
            ptr,
            done: 0,
        }
    }

    // Entry for the part of the transfer still outstanding.
    fn entry(&self, tag: u64) -> squeue::Entry {
        let request = &self.request;
        // Bounded by MAX_TRANSFER in add_request.
        let remaining = (request.len() - self.done) as u32;
        let offset = request.offset() + self.done as u64;
        // SAFETY: done < len, so the pointer stays inside the request buffer.
        let ptr = unsafe { self.ptr.add(self.done) };

        match request.kind() {
            RequestKind::Read => opcode::Read::new(types::Fd(self.fd), ptr, remaining)
                .offset(offset)
                .build(),
            RequestKind::Write => {
                opcode::Write::new(types::Fd(self.fd), ptr as *const u8, remaining)
                    .offset(offset)
                    .build()
            }
        }
        .user_data(tag)
    }
}

fn push_entry(ring: &mut IoUring, entry: &squeue::Entry) -> bool {
    // SAFETY: every buffer referenced by an entry belongs to a request kept
    // alive in the in-flight map until its completion is reaped.
    if unsafe { ring.submission().push(entry) }.is_ok() {
        return true;
    }
    if ring.submit().is_err() {
        return false;
    }
    unsafe { ring.submission().push(entry) }.is_ok()
}

fn take_tag(next: &mut u64) -> u64 {
    let tag = *next;
    *next = (*next + 1) % CANCEL_TAG;
    tag
}

fn serve_now(request: &Request) {
    let result = request.serve();
    request.complete(result);
}

fn worker(id: QueueId, shared: Arc<Shared>, mut ring: IoUring, depth: usize) {
    let mut in_flight: HashMap<u64, InFlight> = HashMap::new();
    let mut next_tag: u64 = 0;
    // Set once the ring failed; everything is then served on this thread.
    let mut broken = false;

    loop {
        let mut batch = Vec::new();
        {
            let mut pending = shared.pending.lock().expect("disk queue poisoned");
            while in_flight.is_empty() && pending.is_empty() && shared.cancels.is_empty() {
                if shared.terminate.load(Ordering::Acquire) {
                    debug!(queue = id, "io_uring worker exiting");
                    return;
                }
                pending = shared.wakeup.wait(pending).expect("disk queue poisoned");
            }
            while in_flight.len() + batch.len() < depth {
                match pending.next() {
                    Some(request) => batch.push(request),
                    None => break,
                }
            }
        }

        for request in batch {
            if !request.begin_service() {
                continue;
            }
            if broken {
                serve_now(&request);
                continue;
            }

            let (fd, ptr) = match (request.file().raw_fd(), request.raw_buffer()) {
                (Some(fd), Some((ptr, _))) => (fd, ptr),
                // No descriptor to hand the kernel: serve it here.
                _ => {
                    serve_now(&request);
                    continue;
                }
            };

            let entry = InFlight::new(request, fd, ptr);
            let tag = take_tag(&mut next_tag);
            if !push_entry(&mut ring, &entry.entry(tag)) {
                warn!(queue = id, "submission queue full, serving request synchronously");
                serve_now(&entry.request);
                continue;
            }
            in_flight.insert(tag, entry);
        }

        while let Some(request) = shared.cancels.pop() {
            let tag = in_flight
                .iter()
                .find(|(_, entry)| Arc::ptr_eq(&entry.request, &request))
                .map(|(tag, _)| *tag);
            if let Some(tag) = tag {
                let cancel = opcode::AsyncCancel::new(tag).build().user_data(CANCEL_TAG);
                if !push_entry(&mut ring, &cancel) {
                    trace!(queue = id, "dropping cancel, submission queue full");
                }
            }
        }

        if in_flight.is_empty() {
            continue;
        }

        if let Err(err) = ring.submit_and_wait(1) {
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!(
                queue = id,
                error = %err,
                in_flight = in_flight.len(),
                "io_uring failed, abandoning in-flight requests and serving synchronously"
            );
            abandon(in_flight.drain().map(|(_, entry)| entry), err);
            broken = true;
            continue;
        }

        let completions: Vec<(u64, i32)> = ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();

        for (tag, result) in completions {
            if tag == CANCEL_TAG {
                continue;
            }
            let Some(entry) = in_flight.remove(&tag) else {
                continue;
            };
            let Some(entry) = finish(entry, result) else {
                continue;
            };

            // Partial transfer: queue the remainder.
            let tag = take_tag(&mut next_tag);
            if push_entry(&mut ring, &entry.entry(tag)) {
                in_flight.insert(tag, entry);
            } else {
                warn!(queue = id, "submission queue full, finishing request synchronously");
                serve_now(&entry.request);
            }
        }
    }
}

// Fails requests whose buffers the kernel may still own. Their buffers are
// leaked, never freed or handed back.
fn abandon(entries: impl Iterator<Item = InFlight>, err: std::io::Error) {
    let err = Arc::new(err);
    for entry in entries {
        let request = entry.request;
        request.leak_buffer();
        let failure = IoError::Os {
            op: request.kind(),
            offset: request.offset(),
            len: request.len(),
            path: request.file().path().to_string(),
            source: Arc::clone(&err),
        };
        request.complete(Err(failure));
    }
}

// Completes the request, or hands the entry back when only part of it was
// transferred.
fn finish(mut entry: InFlight, result: i32) -> Option<InFlight> {
    let request = Arc::clone(&entry.request);
    let len = request.len();

    if result < 0 {
        if -result == libc::ECANCELED {
            request.mark_canceled();
            return None;
        }
        let failure = IoError::Os {
            op: request.kind(),
            offset: request.offset(),
            len,
            path: request.file().path().to_string(),
            source: Arc::new(std::io::Error::from_raw_os_error(-result)),
        };
        request.complete(Err(failure));
        return None;
    }

    let transferred = result as usize;
    entry.done += transferred;
    if transferred > 0 && entry.done < len {
        trace!(done = entry.done, len, "partial transfer");
        return Some(entry);
    }

    let outcome = match request.kind() {
        // Nothing more to read: end of file.
        RequestKind::Read => {
            request.zero_tail(entry.done);
            Ok(())
        }
        RequestKind::Write if entry.done < len => Err(IoError::ShortWrite {
            offset: request.offset(),
            len,
            written: entry.done,
            path: request.file().path().to_string(),
        }),
        RequestKind::Write => Ok(()),
    };

    if outcome.is_ok() {
        Stats::global().record_io(request.kind(), len, entry.started.elapsed());
    }
    request.complete(outcome);
    None
}
