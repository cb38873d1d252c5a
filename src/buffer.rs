//! Buffer construction, teardown, cancellation and introspection.

use crate::common::{advance, unlikely, HeaderPtr, HEADER_READ, HEADER_SIZE};
use crate::error::{PacketBufError, Result};
use crate::memory::Segment;
use crate::stats::{monotonic_nsec, Stats, StatsBlock};
use crate::sync::{RawMutex, RawSemaphore};
use core::ptr::NonNull;
use crossbeam::utils::CachePadded;
use std::io;
use std::mem::size_of;
use std::sync::atomic::{AtomicIsize, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Buffer is initialized and usable.
pub const BUFFER_READY: u32 = 1;
/// Buffer has been cancelled; only teardown remains.
pub const BUFFER_CANCELLED: u32 = 2;
/// Buffer lives in shared memory and synchronizes across processes.
pub const BUFFER_PSHARED: u32 = 4;
/// Buffer maintains run-time statistics.
pub const BUFFER_STATS: u32 = 8;

/// Default arena size when the attribute object is left untouched.
pub const DEFAULT_SIZE: usize = 1024 * 1024;

/// How a process-shared buffer finds its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmSpec {
    /// Create a fresh segment and initialize it.
    Create,
    /// Attach an existing segment initialized by another participant.
    Attach(i32),
}

/// Shared control block at the head of the segment.
///
/// `#[repr(C)]` so independent processes attached to the same segment agree
/// on the layout. Position fields are plain counters guarded by the mutex
/// that owns their transition (see the field docs); they are atomics only so
/// that the unsynchronized observers (`cancel`, `state_dump`) stay defined
/// behavior, and all accesses use relaxed ordering with the mutexes and
/// semaphores providing the actual synchronization.
#[repr(C)]
pub(crate) struct State {
    pub(crate) flags: AtomicU32,
    /// Arena size in bytes.
    pub(crate) size: AtomicUsize,
    /// Oldest packet open for reading, or the next packet to be read when
    /// no read is open. Guarded by `read_close_mutex`.
    pub(crate) read_pos: AtomicUsize,
    /// Oldest packet open for writing, or the next to be written. Guarded
    /// by `write_close_mutex`.
    pub(crate) write_pos: AtomicUsize,
    /// Next packet a reader will claim. Guarded by `read_mutex`.
    pub(crate) read_next: AtomicUsize,
    /// Next packet a writer will claim. Guarded by `write_mutex`.
    pub(crate) write_next: AtomicUsize,
    /// Oldest read packet not yet reclaimed. Guarded by `write_mutex`.
    pub(crate) read_first: AtomicUsize,
    /// Bytes available to reserve; momentarily negative while a reservation
    /// is reclaiming space. Guarded by `write_mutex`.
    pub(crate) free_bytes: AtomicIsize,
    /// Serializes the reader claim phase (open-read).
    pub(crate) read_mutex: RawMutex,
    /// Serializes the writer claim phase (open-write through set-size).
    pub(crate) write_mutex: RawMutex,
    /// Serializes the read-side in-order commit walk.
    pub(crate) read_close_mutex: RawMutex,
    /// Serializes the write-side in-order commit walk.
    pub(crate) write_close_mutex: RawMutex,
    /// Counts read packets that may be reclaimed by writers.
    pub(crate) read_packets: CachePadded<RawSemaphore>,
    /// Counts written packets that may be claimed by readers.
    pub(crate) written_packets: CachePadded<RawSemaphore>,
    /// Monotonic baseline for statistics.
    pub(crate) create_time_nsec: AtomicU64,
}

impl State {
    /// Credit the oldest finished-read packet (plus any trailing wrap
    /// padding) back to `free_bytes` and advance `read_first` past it.
    /// Caller holds `write_mutex` and has decremented `read_packets`.
    pub(crate) fn reclaim_first(&self, arena: NonNull<u8>) {
        let size = self.size.load(Ordering::Relaxed);
        let first = self.read_first.load(Ordering::Relaxed);
        let header = unsafe { HeaderPtr::at(arena, first) };
        self.free_bytes
            .fetch_add((HEADER_SIZE + header.size()) as isize, Ordering::Relaxed);
        let mut next = (first + HEADER_SIZE + header.size()) % size;
        if next + HEADER_SIZE > size {
            self.free_bytes
                .fetch_add((size - next) as isize, Ordering::Relaxed);
            next = 0;
        }
        self.read_first.store(next, Ordering::Relaxed);
    }
}

/// Construction parameters for [`Buffer`].
pub struct BufferAttr {
    size: usize,
    flags: u32,
    shm: ShmSpec,
    mode: u32,
}

impl Default for BufferAttr {
    fn default() -> Self {
        BufferAttr {
            size: DEFAULT_SIZE,
            flags: 0,
            shm: ShmSpec::Create,
            mode: 0o600,
        }
    }
}

impl BufferAttr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target arena size; must hold at least two packet headers.
    pub fn set_size(&mut self, size: usize) -> Result<()> {
        if unlikely(size < 2 * HEADER_SIZE) {
            return Err(PacketBufError::InvalidArgument);
        }
        self.size = size;
        Ok(())
    }

    /// Set [`BUFFER_PSHARED`] and/or [`BUFFER_STATS`]. The lifecycle flags
    /// are owned by the buffer and rejected here.
    pub fn set_flags(&mut self, flags: u32) -> Result<()> {
        if unlikely(flags & (BUFFER_READY | BUFFER_CANCELLED) != 0) {
            return Err(PacketBufError::InvalidArgument);
        }
        #[cfg(not(feature = "shm"))]
        if flags & BUFFER_PSHARED != 0 {
            return Err(PacketBufError::NotSupported);
        }
        #[cfg(not(feature = "stats"))]
        if flags & BUFFER_STATS != 0 {
            return Err(PacketBufError::NotSupported);
        }
        self.flags = flags;
        Ok(())
    }

    /// Choose between creating a fresh shared segment and attaching an
    /// existing one. Only meaningful together with [`BUFFER_PSHARED`].
    pub fn set_shm(&mut self, shm: ShmSpec) -> Result<()> {
        if cfg!(not(feature = "shm")) {
            return Err(PacketBufError::NotSupported);
        }
        self.shm = shm;
        Ok(())
    }

    /// Permission bits for shared segment creation.
    pub fn set_mode(&mut self, mode: u32) -> Result<()> {
        if cfg!(not(feature = "shm")) {
            return Err(PacketBufError::NotSupported);
        }
        self.mode = mode;
        Ok(())
    }
}

#[cfg(feature = "shm")]
fn open_shared(attr: &BufferAttr, total: usize) -> Result<(Segment, bool)> {
    match attr.shm {
        ShmSpec::Create => Ok((Segment::shm_create(total, attr.mode)?, false)),
        ShmSpec::Attach(shmid) => Ok((Segment::shm_attach(shmid)?, true)),
    }
}

#[cfg(not(feature = "shm"))]
fn open_shared(_attr: &BufferAttr, _total: usize) -> Result<(Segment, bool)> {
    Err(PacketBufError::NotSupported)
}

/// A packet ring buffer over a fixed-size byte arena.
///
/// Producers and consumers operate through [`crate::Packet`] handles bound
/// to the buffer. The buffer itself is freely shared between threads; in
/// PSHARED mode the same segment can additionally be attached from other
/// processes.
pub struct Buffer {
    segment: Segment,
    stats_offset: Option<usize>,
    arena_offset: usize,
}

impl Buffer {
    /// Allocate and initialize a buffer, or attach to an existing shared
    /// segment when the attribute names one. Attaching skips
    /// initialization; the creator is expected to have completed it.
    pub fn new(attr: &BufferAttr) -> Result<Buffer> {
        let flags = attr.flags;
        let stats_size = if flags & BUFFER_STATS != 0 {
            size_of::<StatsBlock>()
        } else {
            0
        };
        let arena_offset = size_of::<State>() + stats_size;
        let total = arena_offset + attr.size;

        let (segment, attached) = if flags & BUFFER_PSHARED != 0 {
            open_shared(attr, total)?
        } else {
            (Segment::anonymous(total)?, false)
        };

        let buffer = Buffer {
            segment,
            stats_offset: (stats_size != 0).then_some(size_of::<State>()),
            arena_offset,
        };

        if attached {
            return Ok(buffer);
        }

        let pshared = flags & BUFFER_PSHARED != 0;
        let state = buffer.state();
        state.size.store(attr.size, Ordering::Relaxed);
        state
            .free_bytes
            .store((attr.size - HEADER_SIZE) as isize, Ordering::Relaxed);
        unsafe {
            state.read_mutex.init(pshared)?;
            state.write_mutex.init(pshared)?;
            state.read_close_mutex.init(pshared)?;
            state.write_close_mutex.init(pshared)?;
            state.read_packets.init(pshared)?;
            state.written_packets.init(pshared)?;
        }
        state
            .create_time_nsec
            .store(monotonic_nsec(), Ordering::Relaxed);
        state.flags.store(flags | BUFFER_READY, Ordering::Release);

        crate::pkt_trace!(size = attr.size, pshared = pshared, "buffer initialized");

        Ok(buffer)
    }

    pub(crate) fn state(&self) -> &State {
        unsafe { &*(self.segment.as_ptr().as_ptr() as *const State) }
    }

    pub(crate) fn arena(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.segment.as_ptr().as_ptr().add(self.arena_offset)) }
    }

    pub(crate) fn stats_block(&self) -> Option<&StatsBlock> {
        let offset = self.stats_offset?;
        Some(unsafe { &*(self.segment.as_ptr().as_ptr().add(offset) as *const StatsBlock) })
    }

    pub(crate) fn stats_enabled(&self) -> bool {
        self.stats_offset.is_some()
            && self.state().flags.load(Ordering::Acquire) & BUFFER_STATS != 0
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.state().flags.load(Ordering::Acquire) & BUFFER_CANCELLED != 0
    }

    pub(crate) fn check(&self) -> Result<()> {
        let flags = self.state().flags.load(Ordering::Acquire);
        if unlikely(flags & BUFFER_READY == 0) {
            return Err(PacketBufError::InvalidArgument);
        }
        if unlikely(flags & BUFFER_CANCELLED != 0) {
            return Err(PacketBufError::Interrupted);
        }
        Ok(())
    }

    /// Monotonic nanoseconds since the buffer was created.
    pub(crate) fn utime(&self) -> u64 {
        monotonic_nsec().saturating_sub(self.state().create_time_nsec.load(Ordering::Relaxed))
    }

    /// Arena size in bytes.
    pub fn size(&self) -> usize {
        self.state().size.load(Ordering::Relaxed)
    }

    /// Bytes currently available to writer reservations. Momentarily
    /// negative while a writer is reclaiming space.
    pub fn free_bytes(&self) -> isize {
        self.state().free_bytes.load(Ordering::Relaxed)
    }

    /// Packets committed by writers and not yet claimed by any reader.
    pub fn unread_packets(&self) -> usize {
        self.state().written_packets.value().max(0) as usize
    }

    /// Segment id other processes can attach, in PSHARED mode.
    pub fn shmid(&self) -> Result<i32> {
        self.check()?;
        self.segment.shmid().ok_or(PacketBufError::NotSupported)
    }

    /// Put the buffer into the terminal cancelled state and wake every
    /// blocked participant. Blocked operations observe the flag after wake
    /// and unwind with [`PacketBufError::Interrupted`]; the mutexes they
    /// hold are released on their own threads.
    pub fn cancel(&self) -> Result<()> {
        self.check()?;
        let state = self.state();
        state.flags.fetch_or(BUFFER_CANCELLED, Ordering::Release);
        let _ = state.read_packets.post();
        let _ = state.written_packets.post();
        crate::pkt_trace!("buffer cancelled");
        Ok(())
    }

    /// Mark every currently readable packet as read without exposing its
    /// contents, reclaiming its space. Returns the number of packets
    /// retired in order; draining an empty buffer returns zero.
    pub fn drain(&self) -> Result<usize> {
        self.check()?;
        let state = self.state();
        let arena = self.arena();
        let size = state.size.load(Ordering::Relaxed);

        state.read_mutex.lock()?;
        if unlikely(self.cancelled()) {
            state.read_mutex.unlock();
            return Err(PacketBufError::Interrupted);
        }
        if let Err(err) = state.read_close_mutex.lock() {
            state.read_mutex.unlock();
            return Err(err);
        }

        let mut drained = 0;
        while state.written_packets.try_wait() {
            let pos = state.read_next.load(Ordering::Relaxed);
            let header = unsafe { HeaderPtr::at(arena, pos) };
            header.or_flags(HEADER_READ);
            let next = advance(pos, size, header.size());
            state.read_next.store(next, Ordering::Relaxed);
            if state.read_pos.load(Ordering::Relaxed) == pos {
                if unlikely(state.read_packets.post().is_err()) {
                    std::process::abort();
                }
                state.read_pos.store(next, Ordering::Relaxed);
                drained += 1;
            }
        }

        state.read_close_mutex.unlock();
        state.read_mutex.unlock();

        // Return the freed space right away when no writer is mid-claim; a
        // writer that is, will consume the posted credits itself.
        if state.write_mutex.try_lock().is_ok() {
            while state.read_packets.try_wait() {
                state.reclaim_first(arena);
            }
            state.write_mutex.unlock();
        }

        crate::pkt_trace!(drained = drained, "buffer drained");

        Ok(drained)
    }

    /// Snapshot of the run-time counters plus the buffer age.
    pub fn stats(&self) -> Result<Stats> {
        self.check()?;
        if self.state().flags.load(Ordering::Acquire) & BUFFER_STATS == 0 {
            return Err(PacketBufError::NotSupported);
        }
        let block = self.stats_block().ok_or(PacketBufError::NotSupported)?;
        Ok(block.snapshot(self.utime()))
    }

    /// Write a text summary of the control state: positions, free bytes,
    /// and the sizes of the unread and pending-free packet queues. Racy by
    /// nature; intended for debugging and external monitoring tools.
    pub fn state_dump(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let state = self.state();
        let size = state.size.load(Ordering::Relaxed);

        writeln!(
            out,
            "size: {}, read_pos: {}, write_pos: {}",
            size,
            state.read_pos.load(Ordering::Relaxed),
            state.write_pos.load(Ordering::Relaxed),
        )?;
        writeln!(
            out,
            "read_next: {}, write_next: {}, read_first: {}",
            state.read_next.load(Ordering::Relaxed),
            state.write_next.load(Ordering::Relaxed),
            state.read_first.load(Ordering::Relaxed),
        )?;
        writeln!(out, "free_bytes: {}", state.free_bytes.load(Ordering::Relaxed))?;

        let (packets, bytes) = self.walk_queue(
            state.read_next.load(Ordering::Relaxed),
            state.written_packets.value(),
        );
        writeln!(out, "unread packets: {}, unread bytes: {}", packets, bytes)?;

        let (packets, bytes) = self.walk_queue(
            state.read_first.load(Ordering::Relaxed),
            state.read_packets.value(),
        );
        writeln!(
            out,
            "pending free packets: {}, pending free bytes: {}",
            packets, bytes
        )?;

        Ok(())
    }

    fn walk_queue(&self, mut pos: usize, count: i32) -> (i32, usize) {
        let arena = self.arena();
        let size = self.state().size.load(Ordering::Relaxed);
        let mut bytes = 0;
        for _ in 0..count {
            let header = unsafe { HeaderPtr::at(arena, pos) };
            bytes += header.size();
            pos = advance(pos, size, header.size());
        }
        (count, bytes)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Callers must guarantee no participant still blocks on the
        // primitives or holds an open packet; that is not synchronized here.
        let state = self.state();
        if state.flags.load(Ordering::Acquire) & BUFFER_READY != 0 {
            unsafe {
                state.read_mutex.destroy();
                state.write_mutex.destroy();
                state.read_close_mutex.destroy();
                state.write_close_mutex.destroy();
                state.read_packets.destroy();
                state.written_packets.destroy();
            }
        }
    }
}
