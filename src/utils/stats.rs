//! Process-wide I/O counters.
//!
//! Workers record every served request here; callers record time spent blocked
//! in [`Request::wait`](crate::storage::disk::request::Request::wait). Take a
//! [`StatsData`] snapshot before and after a phase and subtract them to get the
//! phase's own numbers.

use std::{
    fmt,
    ops::Sub,
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock,
    },
    time::Duration,
};

use crate::storage::disk::request::RequestKind;

#[derive(Default)]
pub struct Stats {
    reads: AtomicU64,
    writes: AtomicU64,
    read_bytes: AtomicU64,
    written_bytes: AtomicU64,
    read_nanos: AtomicU64,
    write_nanos: AtomicU64,
    wait_nanos: AtomicU64,
    cancels: AtomicU64,
}

static GLOBAL: OnceLock<Stats> = OnceLock::new();

impl Stats {
    pub fn global() -> &'static Stats {
        GLOBAL.get_or_init(Stats::default)
    }

    pub fn record_io(&self, kind: RequestKind, bytes: usize, elapsed: Duration) {
        let nanos = elapsed.as_nanos() as u64;
        match kind {
            RequestKind::Read => {
                self.reads.fetch_add(1, Ordering::Relaxed);
                self.read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
                self.read_nanos.fetch_add(nanos, Ordering::Relaxed);
            }
            RequestKind::Write => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                self.written_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
                self.write_nanos.fetch_add(nanos, Ordering::Relaxed);
            }
        }
    }

    pub fn record_wait(&self, elapsed: Duration) {
        self.wait_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_cancel(&self) {
        self.cancels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsData {
        StatsData {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
            read_time: Duration::from_nanos(self.read_nanos.load(Ordering::Relaxed)),
            write_time: Duration::from_nanos(self.write_nanos.load(Ordering::Relaxed)),
            wait_time: Duration::from_nanos(self.wait_nanos.load(Ordering::Relaxed)),
            cancels: self.cancels.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsData {
    pub reads: u64,
    pub writes: u64,
    pub read_bytes: u64,
    pub written_bytes: u64,
    pub read_time: Duration,
    pub write_time: Duration,
    pub wait_time: Duration,
    pub cancels: u64,
}

impl Sub for StatsData {
    type Output = StatsData;

    fn sub(self, rhs: StatsData) -> StatsData {
        StatsData {
            reads: self.reads.saturating_sub(rhs.reads),
            writes: self.writes.saturating_sub(rhs.writes),
            read_bytes: self.read_bytes.saturating_sub(rhs.read_bytes),
            written_bytes: self.written_bytes.saturating_sub(rhs.written_bytes),
            read_time: self.read_time.saturating_sub(rhs.read_time),
            write_time: self.write_time.saturating_sub(rhs.write_time),
            wait_time: self.wait_time.saturating_sub(rhs.wait_time),
            cancels: self.cancels.saturating_sub(rhs.cancels),
        }
    }
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

fn throughput(bytes: u64, time: Duration) -> f64 {
    let secs = time.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    mib(bytes) / secs
}

impl fmt::Display for StatsData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "reads: {} ({:.3} MiB, {:.3}s, {:.2} MiB/s)",
            self.reads,
            mib(self.read_bytes),
            self.read_time.as_secs_f64(),
            throughput(self.read_bytes, self.read_time)
        )?;
        writeln!(
            f,
            "writes: {} ({:.3} MiB, {:.3}s, {:.2} MiB/s)",
            self.writes,
            mib(self.written_bytes),
            self.write_time.as_secs_f64(),
            throughput(self.written_bytes, self.write_time)
        )?;
        write!(
            f,
            "waited: {:.3}s, canceled: {}",
            self.wait_time.as_secs_f64(),
            self.cancels
        )
    }
}
