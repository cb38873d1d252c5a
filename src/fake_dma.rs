//! Bounce-buffer staging for DMA spans that cross the arena wrap.
//!
//! Each packet handle keeps a flat list of reusable bounce buffers with a
//! free bit per entry. Writer-side entries are written back into the arena
//! right before close; reader-side entries are filled before being handed
//! out and simply dropped afterwards. Entries map to disjoint position
//! ranges within one packet, which `cut` maintains after the final size is
//! latched.

use crate::error::{PacketBufError, Result};

pub(crate) struct FakeDma {
    pub(crate) mem: Vec<u8>,
    /// In-use prefix of `mem`.
    pub(crate) size: usize,
    /// Payload position the span was requested at.
    pub(crate) pos: usize,
    pub(crate) free: bool,
}

#[derive(Default)]
pub(crate) struct FakeDmaList {
    entries: Vec<FakeDma>,
}

impl FakeDmaList {
    pub(crate) fn new() -> Self {
        FakeDmaList::default()
    }

    /// Claim an entry with at least `size` bytes, reusing a free one when
    /// possible. Returns the entry index.
    pub(crate) fn alloc(&mut self, size: usize) -> Result<usize> {
        if let Some(idx) = self.entries.iter().position(|entry| entry.free) {
            let entry = &mut self.entries[idx];
            if entry.mem.len() < size {
                let grow = size - entry.mem.len();
                entry
                    .mem
                    .try_reserve(grow)
                    .map_err(|_| PacketBufError::OutOfMemory)?;
                entry.mem.resize(size, 0);
            }
            entry.size = size;
            entry.free = false;
            return Ok(idx);
        }

        self.entries
            .try_reserve(1)
            .map_err(|_| PacketBufError::OutOfMemory)?;
        let mut mem = Vec::new();
        mem.try_reserve(size)
            .map_err(|_| PacketBufError::OutOfMemory)?;
        mem.resize(size, 0);
        self.entries.push(FakeDma {
            mem,
            size,
            pos: 0,
            free: false,
        });
        Ok(self.entries.len() - 1)
    }

    pub(crate) fn set_pos(&mut self, idx: usize, pos: usize) {
        self.entries[idx].pos = pos;
    }

    pub(crate) fn free_entry(&mut self, idx: usize) {
        self.entries[idx].free = true;
    }

    /// Free every entry without committing anything; memory is retained for
    /// reuse by later spans.
    pub(crate) fn free_all(&mut self) {
        for entry in &mut self.entries {
            entry.free = true;
        }
    }

    /// Drop entries past the latched packet size and truncate entries that
    /// straddle it, keeping the committed ranges disjoint and in bounds.
    pub(crate) fn cut(&mut self, size: usize) {
        for entry in &mut self.entries {
            if entry.free {
                continue;
            }
            if entry.pos > size {
                entry.free = true;
            } else if entry.pos + entry.size > size {
                entry.size = size - entry.pos;
            }
        }
    }

    pub(crate) fn slice_mut(&mut self, idx: usize, size: usize) -> &mut [u8] {
        &mut self.entries[idx].mem[..size]
    }

    /// Move the entries out so the packet can run seek/write against itself
    /// while iterating them. Pair with `restore`.
    pub(crate) fn take(&mut self) -> Vec<FakeDma> {
        std::mem::take(&mut self.entries)
    }

    pub(crate) fn restore(&mut self, entries: Vec<FakeDma>) {
        self.entries = entries;
    }
}
