use eyre::Result;
use packetbuf::{
    Buffer, BufferAttr, Packet, PacketBufError, ACCEPT_FAKE_DMA, BUFFER_STATS, HEADER_SIZE,
    PACKET_READ, PACKET_TRY, PACKET_WRITE,
};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

#[cfg(feature = "shm")]
use packetbuf::{ShmSpec, BUFFER_PSHARED};
#[cfg(feature = "shm")]
use serial_test::serial;

fn buffer_with_size(size: usize) -> Result<Buffer> {
    let mut attr = BufferAttr::new();
    attr.set_size(size)?;
    Ok(Buffer::new(&attr)?)
}

#[test]
fn drain_retires_every_written_packet() -> Result<()> {
    let mut attr = BufferAttr::new();
    attr.set_size(64 * 1024)?;
    attr.set_flags(BUFFER_STATS)?;
    let buffer = Buffer::new(&attr)?;

    let payload = [0u8; 1000];
    let mut packet = Packet::new(&buffer)?;
    for _ in 0..50 {
        packet.open(PACKET_WRITE)?;
        packet.set_size(1000)?;
        packet.write(&payload)?;
        packet.close()?;
    }

    assert_eq!(buffer.unread_packets(), 50);
    let mut dump = Vec::new();
    buffer.state_dump(&mut dump)?;
    let text = String::from_utf8(dump).unwrap();
    assert!(text.contains("unread packets: 50"));

    assert_eq!(buffer.drain()?, 50);

    assert_eq!(buffer.unread_packets(), 0);
    assert_eq!(buffer.free_bytes(), (64 * 1024 - HEADER_SIZE) as isize);
    let mut dump = Vec::new();
    buffer.state_dump(&mut dump)?;
    let text = String::from_utf8(dump).unwrap();
    assert!(text.contains("unread packets: 0"));
    assert!(text.contains("pending free packets: 0"));

    // Draining an already-drained buffer is a no-op.
    assert_eq!(buffer.drain()?, 0);
    Ok(())
}

#[test]
fn minimal_arena_blocks_until_reclaim() -> Result<()> {
    let buffer = buffer_with_size(2 * HEADER_SIZE + 1)?;

    let mut writer = Packet::new(&buffer)?;
    writer.open(PACKET_WRITE)?;
    assert_eq!(writer.set_size(2), Err(PacketBufError::NoBufferSpace));
    writer.set_size(1)?;
    writer.write(&[0xAA])?;
    writer.close()?;

    let second_done = AtomicBool::new(false);
    thread::scope(|s| {
        s.spawn(|| {
            let mut writer = Packet::new(&buffer).unwrap();
            writer.open(PACKET_WRITE).unwrap();
            // No space left: blocks until the first packet is reclaimed.
            writer.set_size(1).unwrap();
            second_done.store(true, Ordering::SeqCst);
            writer.write(&[0xBB]).unwrap();
            writer.close().unwrap();
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!second_done.load(Ordering::SeqCst));

        let mut reader = Packet::new(&buffer).unwrap();
        reader.open(PACKET_READ).unwrap();
        let mut byte = [0u8; 1];
        reader.read(&mut byte).unwrap();
        assert_eq!(byte[0], 0xAA);
        reader.close().unwrap();
    });
    assert!(second_done.load(Ordering::SeqCst));

    let mut reader = Packet::new(&buffer)?;
    reader.open(PACKET_READ)?;
    let mut byte = [0u8; 1];
    reader.read(&mut byte)?;
    assert_eq!(byte[0], 0xBB);
    reader.close()?;
    Ok(())
}

#[test]
fn claim_order_is_read_order_across_writers() -> Result<()> {
    const PACKETS: u64 = 10_000;

    let buffer = buffer_with_size(4096)?;
    let sequence = AtomicU64::new(0);

    thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                let mut rng = rand::thread_rng();
                let mut writer = Packet::new(&buffer).unwrap();
                for _ in 0..PACKETS / 2 {
                    writer.open(PACKET_WRITE).unwrap();
                    // The claim lock is held here, so tag order is exactly
                    // the claim order.
                    let seq = sequence.fetch_add(1, Ordering::SeqCst);
                    let len = rng.gen_range(1..=1024);
                    writer.set_size(len).unwrap();
                    // Packets smaller than the tag carry its prefix.
                    writer.write(&seq.to_le_bytes()[..len.min(8)]).unwrap();
                    writer.close().unwrap();
                }
            });
        }

        s.spawn(|| {
            let mut reader = Packet::new(&buffer).unwrap();
            for expected in 0..PACKETS {
                reader.open(PACKET_READ).unwrap();
                let len = reader.size().unwrap().min(8);
                let mut tag = [0u8; 8];
                reader.read(&mut tag[..len]).unwrap();
                assert_eq!(&tag[..len], &expected.to_le_bytes()[..len]);
                reader.close().unwrap();
            }
        });
    });

    // Quiescent conservation: with nothing live, every byte except the
    // sentinel header slot is free again.
    assert_eq!(buffer.drain()?, 0);
    assert_eq!(buffer.free_bytes(), (4096 - HEADER_SIZE) as isize);
    Ok(())
}

#[test]
fn chunked_writes_and_dma_reassemble() -> Result<()> {
    let buffer = buffer_with_size(1024)?;

    // Park the ring near the wrap so at least one span crosses it.
    let mut packet = Packet::new(&buffer)?;
    packet.open(PACKET_WRITE)?;
    packet.set_size(900)?;
    packet.close()?;
    buffer.drain()?;

    let payload: Vec<u8> = (0..600).map(|i| (i * 31 % 251) as u8).collect();

    packet.open(PACKET_WRITE)?;
    packet.write(&payload[..100])?;
    {
        let span = packet.dma(200, ACCEPT_FAKE_DMA)?;
        span.copy_from_slice(&payload[100..300]);
    }
    packet.write(&payload[300..450])?;
    {
        let span = packet.dma(150, ACCEPT_FAKE_DMA)?;
        span.copy_from_slice(&payload[450..600]);
    }
    packet.close()?;

    let mut reader = Packet::new(&buffer)?;
    reader.open(PACKET_READ)?;
    assert_eq!(reader.size()?, 600);
    let mut data = vec![0u8; 600];
    reader.read(&mut data)?;
    assert_eq!(data, payload);
    reader.close()?;
    Ok(())
}

#[test]
fn half_arena_dma_near_wrap() -> Result<()> {
    let size = 4096;
    let buffer = buffer_with_size(size)?;

    let mut packet = Packet::new(&buffer)?;
    packet.open(PACKET_WRITE)?;
    packet.set_size(3000)?;
    packet.close()?;
    buffer.drain()?;

    packet.open(PACKET_WRITE)?;
    let span_len = size / 2 + 1;
    assert_eq!(packet.dma(span_len, 0), Err(PacketBufError::WouldCrossWrap));
    {
        let span = packet.dma(span_len, ACCEPT_FAKE_DMA)?;
        for (i, byte) in span.iter_mut().enumerate() {
            *byte = (i % 253) as u8;
        }
    }
    packet.close()?;

    let mut reader = Packet::new(&buffer)?;
    reader.open(PACKET_READ)?;
    assert_eq!(reader.size()?, span_len);
    let mut data = vec![0u8; span_len];
    reader.read(&mut data)?;
    for (i, byte) in data.iter().enumerate() {
        assert_eq!(*byte, (i % 253) as u8);
    }
    reader.close()?;
    Ok(())
}

#[test]
fn unclosed_write_stalls_later_packets() -> Result<()> {
    let buffer = buffer_with_size(4096)?;

    let mut first = Packet::new(&buffer)?;
    first.open(PACKET_WRITE)?;
    first.write(b"delivered")?;
    first.close()?;

    // A writer that dies before close: size latched, payload written,
    // handle dropped. There is no timeout recovery for this.
    let mut stalled = Packet::new(&buffer)?;
    stalled.open(PACKET_WRITE)?;
    stalled.set_size(16)?;
    stalled.write(&[1u8; 16])?;
    drop(stalled);

    // A later writer can still claim and commit, but stays invisible
    // behind the stalled packet.
    let mut third = Packet::new(&buffer)?;
    third.open(PACKET_WRITE)?;
    third.write(b"queued")?;
    third.close()?;

    let mut reader = Packet::new(&buffer)?;
    reader.open(PACKET_READ)?;
    let mut data = [0u8; 9];
    reader.read(&mut data)?;
    assert_eq!(&data, b"delivered");
    reader.close()?;

    assert_eq!(buffer.unread_packets(), 0);
    assert_eq!(
        reader.open(PACKET_READ | PACKET_TRY),
        Err(PacketBufError::Busy)
    );
    Ok(())
}

#[test]
fn cancel_unblocks_reader_and_writer() -> Result<()> {
    let buffer = buffer_with_size(4096)?;

    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut packet = Packet::new(&buffer).unwrap();
            packet.open(PACKET_READ)
        });

        // This writer claims most of the arena and stalls mid-stream, so
        // the one below cannot reserve and the reader has nothing to read.
        let mut streaming = Packet::new(&buffer).unwrap();
        streaming.open(PACKET_WRITE).unwrap();
        streaming.set_size(3000).unwrap();

        let blocked = s.spawn(|| {
            let mut packet = Packet::new(&buffer).unwrap();
            packet.open(PACKET_WRITE).unwrap();
            packet.set_size(3000)
        });

        thread::sleep(Duration::from_millis(100));
        buffer.cancel().unwrap();

        assert_eq!(reader.join().unwrap(), Err(PacketBufError::Interrupted));
        assert_eq!(blocked.join().unwrap(), Err(PacketBufError::Interrupted));
        assert_eq!(streaming.close(), Err(PacketBufError::Interrupted));
    });

    Ok(())
}

#[test]
fn framing_survives_many_wraps() -> Result<()> {
    let buffer = buffer_with_size(512)?;
    let mut writer = Packet::new(&buffer)?;
    let mut reader = Packet::new(&buffer)?;

    for i in 0..200usize {
        let len = i * 37 % 300 + 1;
        let payload: Vec<u8> = (0..len).map(|j| (i + j) as u8).collect();

        writer.open(PACKET_WRITE)?;
        writer.write(&payload)?;
        writer.close()?;

        reader.open(PACKET_READ)?;
        assert_eq!(reader.size()?, len);
        let mut data = vec![0u8; len];
        reader.read(&mut data)?;
        assert_eq!(data, payload);
        reader.close()?;
    }

    buffer.drain()?;
    assert_eq!(buffer.free_bytes(), (512 - HEADER_SIZE) as isize);
    Ok(())
}

#[cfg(feature = "stats")]
#[test]
fn stats_track_traffic() -> Result<()> {
    let mut attr = BufferAttr::new();
    attr.set_size(8192)?;
    attr.set_flags(BUFFER_STATS)?;
    let buffer = Buffer::new(&attr)?;

    let mut writer = Packet::new(&buffer)?;
    writer.open(PACKET_WRITE)?;
    writer.write(&[1u8; 100])?;
    writer.close()?;
    writer.open(PACKET_WRITE)?;
    writer.write(&[2u8; 200])?;
    writer.close()?;

    let mut reader = Packet::new(&buffer)?;
    reader.open(PACKET_READ)?;
    let mut data = [0u8; 100];
    reader.read(&mut data)?;
    reader.close()?;

    let stats = buffer.stats()?;
    assert_eq!(stats.written_packets, 2);
    assert_eq!(stats.written_bytes, 300);
    assert_eq!(stats.read_packets, 1);
    assert_eq!(stats.read_bytes, 100);
    assert!(stats.utime_nsec > 0);
    Ok(())
}

#[cfg(feature = "shm")]
#[test]
#[serial]
fn shared_segment_roundtrip() -> Result<()> {
    let mut attr = BufferAttr::new();
    attr.set_size(16 * 1024)?;
    attr.set_flags(BUFFER_PSHARED | BUFFER_STATS)?;
    let creator = Buffer::new(&attr)?;
    let shmid = creator.shmid()?;

    let mut writer = Packet::new(&creator)?;
    writer.open(PACKET_WRITE)?;
    writer.write(b"across the segment")?;
    writer.close()?;

    // Participants agree on size and flags out-of-band.
    let mut attach_attr = BufferAttr::new();
    attach_attr.set_size(16 * 1024)?;
    attach_attr.set_flags(BUFFER_PSHARED | BUFFER_STATS)?;
    attach_attr.set_shm(ShmSpec::Attach(shmid))?;
    let attached = Buffer::new(&attach_attr)?;

    assert_eq!(attached.size(), 16 * 1024);
    assert_eq!(attached.shmid()?, shmid);
    assert_eq!(attached.unread_packets(), 1);

    let mut reader = Packet::new(&attached)?;
    reader.open(PACKET_READ)?;
    let mut data = [0u8; 18];
    reader.read(&mut data)?;
    assert_eq!(&data, b"across the segment");
    reader.close()?;

    let stats = attached.stats()?;
    assert_eq!(stats.written_packets, 1);
    assert_eq!(stats.read_packets, 1);

    drop(attached);
    drop(creator);
    Ok(())
}
