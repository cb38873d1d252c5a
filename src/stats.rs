//! Run-time counters kept alongside the buffer state.

use nix::time::{clock_gettime, ClockId};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter block living inside the segment, right after the buffer state.
/// Counters are bumped at packet close under the respective close mutex;
/// wait times accumulate around the two blocking semaphore waits.
#[repr(C)]
pub(crate) struct StatsBlock {
    written_packets: AtomicU64,
    written_bytes: AtomicU64,
    read_packets: AtomicU64,
    read_bytes: AtomicU64,
    write_wait_nsec: AtomicU64,
    read_wait_nsec: AtomicU64,
}

impl StatsBlock {
    pub(crate) fn record_write(&self, bytes: u64) {
        self.written_packets.fetch_add(1, Ordering::Relaxed);
        self.written_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, bytes: u64) {
        self.read_packets.fetch_add(1, Ordering::Relaxed);
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_write_wait(&self, nsec: u64) {
        self.write_wait_nsec.fetch_add(nsec, Ordering::Relaxed);
    }

    pub(crate) fn add_read_wait(&self, nsec: u64) {
        self.read_wait_nsec.fetch_add(nsec, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, utime_nsec: u64) -> Stats {
        Stats {
            written_packets: self.written_packets.load(Ordering::Relaxed),
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
            read_packets: self.read_packets.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            write_wait_nsec: self.write_wait_nsec.load(Ordering::Relaxed),
            read_wait_nsec: self.read_wait_nsec.load(Ordering::Relaxed),
            utime_nsec,
        }
    }
}

/// Point-in-time copy of the buffer counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub written_packets: u64,
    pub written_bytes: u64,
    pub read_packets: u64,
    pub read_bytes: u64,
    /// Cumulative time writers spent blocked waiting for reclaimable space.
    pub write_wait_nsec: u64,
    /// Cumulative time readers spent blocked waiting for packets.
    pub read_wait_nsec: u64,
    /// Monotonic age of the buffer.
    pub utime_nsec: u64,
}

/// Monotonic clock reading in nanoseconds.
pub(crate) fn monotonic_nsec() -> u64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
        .unwrap_or(0)
}
