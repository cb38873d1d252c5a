//! Thread-safe variable-sized packet ring buffer.
//!
//! Producers stream self-delimiting packets into a fixed-size circular byte
//! arena; consumers take whole packets back out in FIFO order. Packet
//! lengths vary and need not be known before a writer starts streaming.
//! Writers and readers synchronize through two counting semaphores and a
//! claim/commit mutex discipline that keeps distinct packets fully
//! parallel: the writer claim lock is released as soon as a packet's size
//! is latched, so one writer can stream payload while the next is already
//! claiming its slot, and symmetrically on the read side.
//!
//! With the `shm` feature the whole buffer (control block, optional
//! statistics, arena) lives in a single SysV shared memory segment and the
//! synchronization primitives are initialized process-shared, turning the
//! ring into a cross-process channel.
//!
//! # Example
//!
//! ```
//! use packetbuf::{Buffer, BufferAttr, Packet, PACKET_READ, PACKET_WRITE};
//!
//! let mut attr = BufferAttr::new();
//! attr.set_size(64 * 1024)?;
//! let buffer = Buffer::new(&attr)?;
//!
//! let mut writer = Packet::new(&buffer)?;
//! writer.open(PACKET_WRITE)?;
//! writer.write(b"hello")?;
//! writer.close()?;
//!
//! let mut reader = Packet::new(&buffer)?;
//! reader.open(PACKET_READ)?;
//! let mut data = [0u8; 5];
//! reader.read(&mut data)?;
//! reader.close()?;
//! assert_eq!(&data, b"hello");
//! # Ok::<(), packetbuf::PacketBufError>(())
//! ```

pub mod buffer;
pub mod error;
pub mod packet;
pub mod stats;

mod common;
mod fake_dma;
mod memory;
mod sync;
mod trace_macro;

pub use buffer::{
    Buffer, BufferAttr, ShmSpec, BUFFER_CANCELLED, BUFFER_PSHARED, BUFFER_READY, BUFFER_STATS,
    DEFAULT_SIZE,
};
pub use common::HEADER_SIZE;
pub use error::{PacketBufError, Result};
pub use packet::{Packet, ACCEPT_FAKE_DMA, PACKET_READ, PACKET_TRY, PACKET_WRITE};
pub use stats::Stats;
