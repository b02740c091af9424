use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
    time::Instant,
};

use tracing::error;

use crate::{buffer::aligned::AlignedBuf, error::IoError, utils::stats::Stats};

use super::file::FileBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Read,
    Write,
}

// Pending -> InProgress -> Done, or Pending -> Canceled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    InProgress,
    Done,
    Canceled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Done | RequestState::Canceled)
    }
}

pub type CompletionCallback = Box<dyn FnOnce(&Request, bool) + Send>;

struct Status {
    state: RequestState,
    error: Option<IoError>,
    waker: Option<Waker>,
    notifiers: Vec<Arc<Notifier>>,
}

/// One read or write against one backend.
///
/// The request owns its buffer from submission until it reaches a terminal
/// state; [`Request::take_buffer`] hands it back afterwards. Handles are shared
/// through `Arc` between the submitter and the queue serving it.
pub struct Request {
    kind: RequestKind,
    offset: u64,
    len: usize,
    file: Arc<dyn FileBackend>,

    buffer: Mutex<Option<AlignedBuf>>,

    status: Mutex<Status>,
    done: Condvar,
    on_complete: Mutex<Option<CompletionCallback>>,
}

impl Request {
    /// `len` bytes of `buffer` are transferred; the buffer may be larger.
    pub fn new(
        file: Arc<dyn FileBackend>,
        kind: RequestKind,
        buffer: AlignedBuf,
        offset: u64,
        len: usize,
    ) -> Result<Self, IoError> {
        Self::try_new(file, kind, buffer, offset, len).map_err(|(err, _)| err)
    }

    /// Like [`Request::new`], but a refused buffer is handed back.
    pub fn try_new(
        file: Arc<dyn FileBackend>,
        kind: RequestKind,
        buffer: AlignedBuf,
        offset: u64,
        len: usize,
    ) -> Result<Self, (IoError, AlignedBuf)> {
        if len > buffer.len() {
            let err = IoError::InvalidArgument(format!(
                "{} of {} bytes does not fit a {} byte buffer",
                kind,
                len,
                buffer.len()
            ));
            return Err((err, buffer));
        }

        Ok(Self {
            kind,
            offset,
            len,
            file,
            buffer: Mutex::new(Some(buffer)),
            status: Mutex::new(Status {
                state: RequestState::Pending,
                error: None,
                waker: None,
                notifiers: Vec::new(),
            }),
            done: Condvar::new(),
            on_complete: Mutex::new(None),
        })
    }

    /// Runs once when the request finishes, with `true` on success.
    pub fn with_callback(self, callback: impl FnOnce(&Request, bool) + Send + 'static) -> Self {
        *self.on_complete.lock().expect("request poisoned") = Some(Box::new(callback));
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn file(&self) -> &Arc<dyn FileBackend> {
        &self.file
    }

    pub fn state(&self) -> RequestState {
        self.status().state
    }

    /// True once the request is done or canceled.
    pub fn poll(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn error(&self) -> Option<IoError> {
        self.status().error.clone()
    }

    /// Same backend and same offset.
    pub fn same_target(&self, other: &Request) -> bool {
        self.offset == other.offset
            && Arc::as_ptr(&self.file) as *const () == Arc::as_ptr(&other.file) as *const ()
    }

    /// Blocks until the request is done or canceled.
    pub fn wait(&self) -> Result<(), IoError> {
        let start = Instant::now();
        let mut status = self.status();
        while !status.state.is_terminal() {
            status = self.done.wait(status).expect("request poisoned");
        }
        Stats::global().record_wait(start.elapsed());
        self.outcome(&status)
    }

    /// Returns the buffer once the request has finished, `None` while it is in flight.
    pub fn take_buffer(&self) -> Option<AlignedBuf> {
        if !self.poll() {
            return None;
        }
        self.buffer.lock().expect("request poisoned").take()
    }

    // Buffer of a request no queue ever accepted.
    pub(crate) fn take_unqueued_buffer(&self) -> Option<AlignedBuf> {
        self.buffer.lock().expect("request poisoned").take()
    }

    // Gives up the buffer without freeing it; the kernel may still write to it.
    pub(crate) fn leak_buffer(&self) {
        if let Some(buf) = self.buffer.lock().expect("request poisoned").take() {
            std::mem::forget(buf);
        }
    }

    pub fn future(self: &Arc<Self>) -> IoFuture {
        IoFuture {
            request: Arc::clone(self),
        }
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().expect("request poisoned")
    }

    fn outcome(&self, status: &Status) -> Result<(), IoError> {
        match (status.state, &status.error) {
            (RequestState::Canceled, _) => Err(self.canceled_error()),
            (_, Some(err)) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    fn canceled_error(&self) -> IoError {
        IoError::Canceled {
            op: self.kind,
            offset: self.offset,
            len: self.len,
            path: self.file.path().to_string(),
        }
    }

    // Called by the worker that dequeued the request. False if it lost a race with cancel.
    pub(crate) fn begin_service(&self) -> bool {
        let mut status = self.status();
        if status.state != RequestState::Pending {
            return false;
        }
        status.state = RequestState::InProgress;
        true
    }

    // Performs the blocking transfer on the calling (worker) thread.
    pub(crate) fn serve(&self) -> Result<(), IoError> {
        let mut guard = self.buffer.lock().expect("request poisoned");
        let buffer = guard
            .as_mut()
            .ok_or_else(|| IoError::InvalidArgument("request has no buffer".to_string()))?;

        let start = Instant::now();
        self.file
            .serve(self.kind, &mut buffer[..self.len], self.offset)?;
        Stats::global().record_io(self.kind, self.len, start.elapsed());

        Ok(())
    }

    // Raw view of the buffer for kernel-side transfers. Stays valid while the
    // request is in flight because nobody can take the buffer before completion.
    pub(crate) fn raw_buffer(&self) -> Option<(*mut u8, usize)> {
        let mut guard = self.buffer.lock().expect("request poisoned");
        guard.as_mut().map(|buf| (buf.as_mut_ptr(), self.len))
    }

    pub(crate) fn zero_tail(&self, from: usize) {
        let mut guard = self.buffer.lock().expect("request poisoned");
        if let Some(buf) = guard.as_mut() {
            if from < self.len {
                buf[from..self.len].fill(0);
            }
        }
    }

    pub(crate) fn complete(&self, result: Result<(), IoError>) {
        let ok = result.is_ok();
        if let Err(err) = &result {
            error!(error = %err, "request failed");
        }
        self.finish(RequestState::Done, result.err());
        self.run_callback(ok);
    }

    pub(crate) fn mark_canceled(&self) {
        Stats::global().record_cancel();
        self.finish(RequestState::Canceled, None);
        self.run_callback(false);
    }

    fn finish(&self, state: RequestState, error: Option<IoError>) {
        let (waker, notifiers) = {
            let mut status = self.status();
            status.state = state;
            status.error = error;
            (status.waker.take(), std::mem::take(&mut status.notifiers))
        };

        self.done.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        for notifier in notifiers {
            notifier.notify();
        }
    }

    fn run_callback(&self, ok: bool) {
        let callback = self.on_complete.lock().expect("request poisoned").take();
        if let Some(callback) = callback {
            callback(self, ok);
        }
    }

    // Returns true if the request is already finished; the notifier is not kept then.
    fn add_notifier(&self, notifier: &Arc<Notifier>) -> bool {
        let mut status = self.status();
        if status.state.is_terminal() {
            return true;
        }
        status.notifiers.push(Arc::clone(notifier));
        false
    }

    fn remove_notifier(&self, notifier: &Arc<Notifier>) {
        self.status()
            .notifiers
            .retain(|n| !Arc::ptr_eq(n, notifier));
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("kind", &self.kind)
            .field("path", &self.file.path())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("state", &self.state())
            .finish()
    }
}

/// Resolves when the request is done or canceled.
pub struct IoFuture {
    request: Arc<Request>,
}

impl Future for IoFuture {
    type Output = Result<(), IoError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut status = self.request.status();
        if status.state.is_terminal() {
            return Poll::Ready(self.request.outcome(&status));
        }
        status.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[derive(Default)]
struct Notifier {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Notifier {
    fn notify(&self) {
        *self.fired.lock().expect("notifier poisoned") = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut fired = self.fired.lock().expect("notifier poisoned");
        while !*fired {
            fired = self.cond.wait(fired).expect("notifier poisoned");
        }
        *fired = false;
    }
}

/// Waits for every request; returns the first error after all have finished.
pub fn wait_all(requests: &[Arc<Request>]) -> Result<(), IoError> {
    let mut first_error = None;
    for request in requests {
        if let Err(err) = request.wait() {
            first_error.get_or_insert(err);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Index of some finished request, without blocking.
pub fn poll_any(requests: &[Arc<Request>]) -> Option<usize> {
    requests.iter().position(|r| r.poll())
}

/// Blocks until at least one request has finished and returns its index.
/// `None` for an empty slice.
pub fn wait_any(requests: &[Arc<Request>]) -> Option<usize> {
    if requests.is_empty() {
        return None;
    }

    let notifier = Arc::new(Notifier::default());
    let mut registered = 0;
    let mut ready = None;
    for (i, request) in requests.iter().enumerate() {
        if request.add_notifier(&notifier) {
            ready = Some(i);
            break;
        }
        registered += 1;
    }

    let index = match ready {
        Some(i) => i,
        None => loop {
            notifier.wait();
            if let Some(i) = poll_any(requests) {
                break i;
            }
        },
    };

    for request in &requests[..registered] {
        request.remove_notifier(&notifier);
    }
    Some(index)
}
