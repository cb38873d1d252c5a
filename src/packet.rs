//! Per-operation packet handles: the producer and consumer paths.
//!
//! A handle claims a slot in the ring (`open`), streams payload bytes with
//! `read`/`write`/`dma`, and retires the slot (`close`). Writers may finish
//! out of claim order; the in-order commit walks below serialize their
//! completions so consumers always observe packets in the order the writers
//! claimed them.

use crate::buffer::{Buffer, State};
use crate::common::{advance, unlikely, HeaderPtr, HEADER_READ, HEADER_SIZE, HEADER_WRITTEN};
use crate::error::{PacketBufError, Result};
use crate::fake_dma::FakeDmaList;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;

/// Open the packet for reading.
pub const PACKET_READ: u32 = 1;
/// Open the packet for writing.
pub const PACKET_WRITE: u32 = 2;
/// Convert blocking acquisitions into a `Busy` indication.
pub const PACKET_TRY: u32 = 4;
/// Final payload size has been latched; the claim lock is released.
const PACKET_SIZE_SET: u32 = 8;

/// Allow `dma` to return a bounce buffer when the span crosses the wrap.
pub const ACCEPT_FAKE_DMA: u32 = 1;

/// An in-progress read or write of one packet.
///
/// The handle is deliberately `!Send`: an open write holds the buffer's
/// claim mutex, which must be released on the locking thread.
pub struct Packet<'a> {
    buffer: &'a Buffer,
    flags: u32,
    /// Arena offset of this packet's header.
    buffer_pos: usize,
    /// Payload cursor.
    pos: usize,
    /// Bytes currently reserved for this write.
    reserved: usize,
    fake_dma: FakeDmaList,
    _not_send: PhantomData<*const ()>,
}

impl<'a> Packet<'a> {
    /// Bind a reusable handle to `buffer`.
    pub fn new(buffer: &'a Buffer) -> Result<Packet<'a>> {
        buffer.check()?;
        Ok(Packet {
            buffer,
            flags: 0,
            buffer_pos: 0,
            pos: 0,
            reserved: 0,
            fake_dma: FakeDmaList::new(),
            _not_send: PhantomData,
        })
    }

    fn state(&self) -> &'a State {
        self.buffer.state()
    }

    fn arena_size(&self) -> usize {
        self.state().size.load(Ordering::Relaxed)
    }

    fn header(&self) -> HeaderPtr {
        unsafe { HeaderPtr::at(self.buffer.arena(), self.buffer_pos) }
    }

    fn check_open(&self) -> Result<()> {
        if unlikely(self.flags & (PACKET_READ | PACKET_WRITE) == 0) {
            return Err(PacketBufError::InvalidArgument);
        }
        self.buffer.check()
    }

    /// Claim the next packet slot for reading or writing.
    ///
    /// `flags` must contain exactly one of [`PACKET_READ`] and
    /// [`PACKET_WRITE`], plus optionally [`PACKET_TRY`] to turn blocking
    /// acquisitions into [`PacketBufError::Busy`].
    pub fn open(&mut self, flags: u32) -> Result<()> {
        self.buffer.check()?;
        if unlikely(self.flags & (PACKET_READ | PACKET_WRITE) != 0) {
            return Err(PacketBufError::InvalidArgument);
        }
        match flags & (PACKET_READ | PACKET_WRITE) {
            PACKET_READ => self.open_read(flags),
            PACKET_WRITE => self.open_write(flags),
            _ => Err(PacketBufError::InvalidArgument),
        }
    }

    fn open_read(&mut self, flags: u32) -> Result<()> {
        let state = self.state();

        if flags & PACKET_TRY != 0 {
            state.read_mutex.try_lock()?;
        } else {
            state.read_mutex.lock()?;
        }
        if unlikely(self.buffer.cancelled()) {
            state.read_mutex.unlock();
            return Err(PacketBufError::Interrupted);
        }

        let stats = self.buffer.stats_enabled();
        let wait_start = if stats { self.buffer.utime() } else { 0 };

        if flags & PACKET_TRY != 0 {
            if !state.written_packets.try_wait() {
                state.read_mutex.unlock();
                return Err(PacketBufError::Busy);
            }
        } else if let Err(err) = state.written_packets.wait() {
            state.read_mutex.unlock();
            return Err(err);
        }
        if unlikely(self.buffer.cancelled()) {
            state.read_mutex.unlock();
            return Err(PacketBufError::Interrupted);
        }

        if stats {
            if let Some(block) = self.buffer.stats_block() {
                block.add_read_wait(self.buffer.utime() - wait_start);
            }
        }

        self.flags = flags & !PACKET_TRY;
        self.buffer_pos = state.read_next.load(Ordering::Relaxed);
        self.pos = 0;

        let header = self.header();
        state.read_next.store(
            advance(self.buffer_pos, self.arena_size(), header.size()),
            Ordering::Relaxed,
        );

        crate::pkt_trace!(pos = self.buffer_pos, size = header.size(), "packet open read");

        state.read_mutex.unlock();
        Ok(())
    }

    fn open_write(&mut self, flags: u32) -> Result<()> {
        let state = self.state();

        if flags & PACKET_TRY != 0 {
            state.write_mutex.try_lock()?;
        } else {
            state.write_mutex.lock()?;
        }
        if unlikely(self.buffer.cancelled()) {
            state.write_mutex.unlock();
            return Err(PacketBufError::Interrupted);
        }

        // The slot at write_next was reserved and zeroed by the previous
        // packet's set_size, so the claim itself costs nothing.
        self.reserved = 0;
        self.flags = flags;
        self.buffer_pos = state.write_next.load(Ordering::Relaxed);
        self.pos = 0;
        self.header().clear();

        crate::pkt_trace!(pos = self.buffer_pos, "packet open write");

        Ok(())
    }

    /// Grow this packet's reservation to `len` bytes total, reclaiming
    /// finished-read packets while the arena has no room. Runs with
    /// `write_mutex` held (between open-write and set-size).
    fn reserve(&mut self, len: usize) -> Result<()> {
        if len <= self.reserved {
            return Ok(());
        }
        if unlikely(len > u32::MAX as usize) {
            return Err(PacketBufError::NoBufferSpace);
        }

        let state = self.state();
        let arena = self.buffer.arena();
        let delta = (len - self.reserved) as isize;

        let mut free = state.free_bytes.fetch_sub(delta, Ordering::Relaxed) - delta;
        while free < 0 {
            let stats = self.buffer.stats_enabled();
            let wait_start = if stats { self.buffer.utime() } else { 0 };

            // Consume the next finished-read packet, blocking if necessary.
            if self.flags & PACKET_TRY != 0 {
                if !state.read_packets.try_wait() {
                    state.free_bytes.fetch_add(delta, Ordering::Relaxed);
                    return Err(PacketBufError::Busy);
                }
            } else if let Err(err) = state.read_packets.wait() {
                state.free_bytes.fetch_add(delta, Ordering::Relaxed);
                return Err(err);
            }

            if stats {
                if let Some(block) = self.buffer.stats_block() {
                    block.add_write_wait(self.buffer.utime() - wait_start);
                }
            }

            loop {
                state.reclaim_first(arena);

                // A decremented semaphore unit must be fully reclaimed
                // before unwinding, or its bytes would be lost.
                if unlikely(self.buffer.cancelled()) {
                    state.write_mutex.unlock();
                    return Err(PacketBufError::Interrupted);
                }

                if !state.read_packets.try_wait() {
                    break;
                }
            }

            free = state.free_bytes.load(Ordering::Relaxed);
        }

        self.reserved = len;
        Ok(())
    }

    /// Latch the final payload size, reserve and zero the next header slot,
    /// and release the claim lock so the next writer can proceed while this
    /// packet's payload is still streaming.
    pub fn set_size(&mut self, size: usize) -> Result<()> {
        self.check_open()?;
        if unlikely(
            self.flags & PACKET_WRITE == 0 || self.flags & PACKET_SIZE_SET != 0,
        ) {
            return Err(PacketBufError::InvalidArgument);
        }

        let state = self.state();
        let arena_size = self.arena_size();
        if unlikely(size + 2 * HEADER_SIZE > arena_size || size > u32::MAX as usize) {
            return Err(PacketBufError::NoBufferSpace);
        }

        self.reserve(size)?;

        let mut padding = 0;
        let mut write_next = (HEADER_SIZE + state.write_next.load(Ordering::Relaxed) + size)
            % arena_size;
        if write_next + HEADER_SIZE > arena_size {
            padding = arena_size - write_next;
            write_next = 0;
        }

        // The next header slot must be reserved and zeroed before the claim
        // lock moves on.
        self.flags &= !PACKET_TRY;
        self.reserve(HEADER_SIZE + size + padding)?;

        state.free_bytes.fetch_add(
            (self.reserved - (size + HEADER_SIZE + padding)) as isize,
            Ordering::Relaxed,
        );
        self.header().set_size(size);
        self.flags |= PACKET_SIZE_SET;
        state.write_next.store(write_next, Ordering::Relaxed);
        unsafe { HeaderPtr::at(self.buffer.arena(), write_next) }.clear();

        state.write_mutex.unlock();

        crate::pkt_trace!(pos = self.buffer_pos, size = size, "packet size latched");

        self.fake_dma.cut(size);
        Ok(())
    }

    /// Retire the packet. Readers mark it reclaimable; writers commit it,
    /// implicitly latching the current high-water size first if needed.
    pub fn close(&mut self) -> Result<()> {
        self.check_open()?;
        self.flags &= !PACKET_TRY; // too late to back out
        if self.flags & PACKET_READ != 0 {
            self.close_read()
        } else {
            self.close_write()
        }
    }

    fn close_read(&mut self) -> Result<()> {
        let state = self.state();
        let arena = self.buffer.arena();
        let size = self.arena_size();

        state.read_close_mutex.lock()?;

        let mut header = self.header();
        if let Some(block) = self.buffer.stats_block() {
            block.record_read(header.size() as u64);
        }
        header.or_flags(HEADER_READ);

        // In-order retire walk: once the oldest open read closes, every
        // contiguous already-read successor becomes reclaimable with it.
        if state.read_pos.load(Ordering::Relaxed) == self.buffer_pos {
            let mut pos = self.buffer_pos;
            loop {
                pos = advance(pos, size, header.size());
                if unlikely(state.read_packets.post().is_err()) {
                    std::process::abort();
                }
                header = unsafe { HeaderPtr::at(arena, pos) };
                if header.flags() & HEADER_READ == 0 {
                    break;
                }
            }
            state.read_pos.store(pos, Ordering::Relaxed);
        }

        state.read_close_mutex.unlock();

        crate::pkt_trace!(pos = self.buffer_pos, "packet close read");

        self.fake_dma.free_all();
        self.flags = 0;
        Ok(())
    }

    fn close_write(&mut self) -> Result<()> {
        if self.flags & PACKET_SIZE_SET == 0 {
            let size = self.header().size();
            self.set_size(size)?;
        }

        self.commit_fake_dma()?;

        let state = self.state();
        let arena = self.buffer.arena();
        let size = self.arena_size();

        state.write_close_mutex.lock()?;

        let mut header = self.header();
        if let Some(block) = self.buffer.stats_block() {
            block.record_write(header.size() as u64);
        }
        header.or_flags(HEADER_WRITTEN);

        // In-order commit walk: if this was the oldest open write, publish
        // it and every contiguous already-written successor.
        if state.write_pos.load(Ordering::Relaxed) == self.buffer_pos {
            let mut pos = self.buffer_pos;
            loop {
                pos = advance(pos, size, header.size());
                if unlikely(state.written_packets.post().is_err()) {
                    std::process::abort();
                }
                header = unsafe { HeaderPtr::at(arena, pos) };
                if header.flags() & HEADER_WRITTEN == 0 {
                    break;
                }
            }
            state.write_pos.store(pos, Ordering::Relaxed);
        }

        state.write_close_mutex.unlock();

        crate::pkt_trace!(pos = self.buffer_pos, "packet close write");

        self.flags = 0;
        Ok(())
    }

    /// Abort an in-progress write before its size is latched, returning the
    /// reservation to the arena.
    pub fn cancel(&mut self) -> Result<()> {
        self.check_open()?;
        if unlikely(self.flags & PACKET_WRITE == 0 || self.flags & PACKET_SIZE_SET != 0) {
            return Err(PacketBufError::InvalidArgument);
        }

        let state = self.state();
        state
            .free_bytes
            .fetch_add(self.reserved as isize, Ordering::Relaxed);
        self.header().clear();
        state.write_mutex.unlock();

        crate::pkt_trace!(pos = self.buffer_pos, "packet write cancelled");

        self.fake_dma.free_all();
        self.reserved = 0;
        self.flags = 0;
        Ok(())
    }

    /// Payload size declared in the packet header.
    pub fn size(&self) -> Result<usize> {
        self.check_open()?;
        Ok(self.header().size())
    }

    /// Current payload cursor.
    pub fn tell(&self) -> Result<usize> {
        self.check_open()?;
        Ok(self.pos)
    }

    /// Move the payload cursor. Growing a writer's cursor before the size
    /// is latched extends its reservation.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        self.check_open()?;
        let header = self.header();

        if self.flags & (PACKET_SIZE_SET | PACKET_READ) != 0 && unlikely(pos > header.size()) {
            return Err(PacketBufError::InvalidArgument);
        }

        if self.flags & PACKET_SIZE_SET == 0 && self.flags & PACKET_WRITE != 0 {
            if unlikely(pos + HEADER_SIZE > self.arena_size()) {
                return Err(PacketBufError::InvalidArgument);
            }
            self.reserve(pos)?;
        }

        self.pos = pos;
        if self.flags & PACKET_SIZE_SET == 0
            && self.flags & PACKET_WRITE != 0
            && self.pos > header.size()
        {
            header.set_size(self.pos);
        }
        Ok(())
    }

    /// Copy the next `dest.len()` payload bytes out of the arena.
    pub fn read(&mut self, dest: &mut [u8]) -> Result<()> {
        self.check_open()?;
        if unlikely(self.pos + dest.len() > self.header().size()) {
            return Err(PacketBufError::InvalidArgument);
        }
        self.copy_out(dest);
        self.pos += dest.len();
        Ok(())
    }

    /// Copy `src` into the arena at the cursor, growing the reservation and
    /// the header size while the final size is not yet latched.
    pub fn write(&mut self, src: &[u8]) -> Result<()> {
        self.check_open()?;
        if unlikely(self.flags & PACKET_WRITE == 0) {
            return Err(PacketBufError::InvalidArgument);
        }

        let header = self.header();
        if self.flags & PACKET_SIZE_SET != 0 {
            if unlikely(self.pos + src.len() > header.size()) {
                return Err(PacketBufError::InvalidArgument);
            }
        } else {
            if unlikely(self.pos + src.len() + 2 * HEADER_SIZE > self.arena_size()) {
                return Err(PacketBufError::NoBufferSpace);
            }
            self.reserve(self.pos + src.len())?;
        }

        self.copy_in(src);
        self.pos += src.len();
        if self.pos > header.size() {
            header.set_size(self.pos);
        }
        Ok(())
    }

    /// Borrow a contiguous span of `size` payload bytes at the cursor.
    ///
    /// When the span does not cross the arena wrap this is a view straight
    /// into the arena. When it does, and `flags` contains
    /// [`ACCEPT_FAKE_DMA`], a bounce buffer is returned instead: for reads
    /// it is filled before being handed out; for writes its contents are
    /// committed into the arena at close. Without the flag a wrapping span
    /// fails with [`PacketBufError::WouldCrossWrap`].
    pub fn dma(&mut self, size: usize, flags: u32) -> Result<&mut [u8]> {
        self.check_open()?;

        let header = self.header();
        let arena_size = self.arena_size();
        if self.flags & (PACKET_SIZE_SET | PACKET_READ) != 0 {
            if unlikely(self.pos + size > header.size()) {
                return Err(PacketBufError::InvalidArgument);
            }
        } else if unlikely(self.pos + size + 2 * HEADER_SIZE > arena_size) {
            return Err(PacketBufError::NoBufferSpace);
        }

        let growing_write = self.flags & PACKET_SIZE_SET == 0 && self.flags & PACKET_WRITE != 0;
        let offs = (self.buffer_pos + HEADER_SIZE + self.pos) % arena_size;

        if offs + size <= arena_size {
            if growing_write {
                self.reserve(self.pos + size)?;
            }
            self.pos += size;
            if growing_write && self.pos > header.size() {
                header.set_size(self.pos);
            }
            let span = unsafe {
                std::slice::from_raw_parts_mut(self.buffer.arena().as_ptr().add(offs), size)
            };
            return Ok(span);
        }

        if flags & ACCEPT_FAKE_DMA == 0 {
            return Err(PacketBufError::WouldCrossWrap);
        }

        if growing_write {
            self.reserve(self.pos + size)?;
        }

        let idx = self.fake_dma.alloc(size)?;
        self.fake_dma.set_pos(idx, self.pos);

        if self.flags & PACKET_READ != 0 {
            // Fill the bounce from the wrapped span; read advances the
            // cursor for us.
            let mut entries = self.fake_dma.take();
            let result = self.read(&mut entries[idx].mem[..size]);
            if result.is_err() {
                entries[idx].free = true;
            }
            self.fake_dma.restore(entries);
            result?;
        } else {
            self.pos += size;
            if growing_write && self.pos > header.size() {
                header.set_size(self.pos);
            }
        }

        crate::pkt_trace!(pos = self.buffer_pos, size = size, "fake dma span");

        Ok(self.fake_dma.slice_mut(idx, size))
    }

    /// Write every live bounce buffer back into the arena.
    fn commit_fake_dma(&mut self) -> Result<()> {
        let mut entries = self.fake_dma.take();
        let mut result = Ok(());
        for entry in entries.iter_mut() {
            if entry.free {
                continue;
            }
            result = self
                .seek(entry.pos)
                .and_then(|_| self.write(&entry.mem[..entry.size]));
            if result.is_err() {
                break;
            }
            entry.free = true;
        }
        self.fake_dma.restore(entries);
        result
    }

    fn copy_in(&mut self, src: &[u8]) {
        let arena_size = self.arena_size();
        let arena = self.buffer.arena().as_ptr();
        let offs = (self.buffer_pos + HEADER_SIZE + self.pos) % arena_size;
        let first = src.len().min(arena_size - offs);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), arena.add(offs), first);
            if first < src.len() {
                std::ptr::copy_nonoverlapping(src.as_ptr().add(first), arena, src.len() - first);
            }
        }
    }

    fn copy_out(&self, dest: &mut [u8]) {
        let arena_size = self.arena_size();
        let arena = self.buffer.arena().as_ptr();
        let offs = (self.buffer_pos + HEADER_SIZE + self.pos) % arena_size;
        let first = dest.len().min(arena_size - offs);
        unsafe {
            std::ptr::copy_nonoverlapping(arena.add(offs), dest.as_mut_ptr(), first);
            if first < dest.len() {
                std::ptr::copy_nonoverlapping(arena, dest.as_mut_ptr().add(first), dest.len() - first);
            }
        }
    }
}
