//! Ring protocol behaviour across many writes: wrap-around, padding
//! markers, and writer interleaving.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use scsonic_shm::{
    available, ControlWord, LayoutDescriptor, RingId, RingWriter, SharedRegion, WriteOptions,
    PADDING_MAGIC,
};

fn small_region() -> Arc<SharedRegion> {
    let layout = LayoutDescriptor::packed(64, 256, 256, 256, 64, 256, 2, 128);
    Arc::new(SharedRegion::new(layout).unwrap())
}

#[test]
fn head_wraps_after_passing_the_end() {
    let region = small_region();
    let writer = RingWriter::new(Arc::clone(&region));
    let payload = [0xABu8; 24]; // 40-byte aligned record

    let mut expected_seq = 0u32;
    let mut drained = 0usize;
    let mut wrapped = false;

    // Keep the ring about half drained so writes keep succeeding while
    // head runs past the region end at least twice.
    for _ in 0..24 {
        writer
            .write(&payload, 1, WriteOptions::main_thread())
            .unwrap();
        let head = region.control(ControlWord::InHead).load(Ordering::Acquire);
        let tail = region.control(ControlWord::InTail).load(Ordering::Acquire);
        if head < tail {
            wrapped = true;
        }

        drained += region.ring(RingId::In).drain(
            1,
            |info| {
                assert_eq!(info.seq, expected_seq, "sequence must be continuous");
                assert_eq!(info.len, payload.len());
                expected_seq += 1;
            },
            |pos| panic!("corruption at {pos}"),
        );
    }

    assert!(wrapped, "head never wrapped in 24 writes over a 256-byte ring");
    // Catch up on whatever is still queued.
    drained += region
        .ring(RingId::In)
        .drain(32, |_| {}, |pos| panic!("corruption at {pos}"));
    assert_eq!(drained, 24);
}

#[test]
fn padding_marker_is_emitted_at_the_tail_end() {
    let region = small_region();
    let writer = RingWriter::new(Arc::clone(&region));
    let payload = [0u8; 84]; // 100-byte aligned record

    // Two records leave head at 200 with 56 bytes of remainder; the third
    // must emit a padding marker there and restart at 0.
    for _ in 0..2 {
        writer
            .write(&payload, 0, WriteOptions::main_thread())
            .unwrap();
    }
    region.ring(RingId::In).drain(2, |_| {}, |_| {});
    writer
        .write(&payload, 0, WriteOptions::main_thread())
        .unwrap();

    let in_off = region.layout().in_ring.offset;
    let mut word = [0u8; 4];
    region.copy_out(in_off + 200, &mut word);
    assert_eq!(u32::from_le_bytes(word), PADDING_MAGIC);

    // The reader skips the marker and sees the record with its sequence.
    let mut seqs = Vec::new();
    region
        .ring(RingId::In)
        .drain(4, |i| seqs.push(i.seq), |pos| panic!("corruption at {pos}"));
    assert_eq!(seqs, vec![2]);
}

#[test]
fn interleaved_writers_keep_per_writer_order() {
    let region = small_region();
    let writer = Arc::new(RingWriter::new(Arc::clone(&region)));

    let mut handles = Vec::new();
    for source in 1..=3u32 {
        let writer = Arc::clone(&writer);
        let region = Arc::clone(&region);
        handles.push(thread::spawn(move || {
            for i in 0..20u8 {
                let payload = [source as u8, i];
                loop {
                    match writer.write(&payload, source, WriteOptions::worker()) {
                        Ok(()) => break,
                        Err(scsonic_types::Error::BufferFull) => {
                            // Reader runs on the main test thread.
                            let tail = region.control(ControlWord::InTail).load(Ordering::Acquire);
                            let _ = writer.wait_for_space(tail, std::time::Duration::from_millis(50));
                        }
                        Err(e) => panic!("unexpected write error: {e}"),
                    }
                }
            }
        }));
    }

    let ring = region.ring(RingId::In);
    let mut per_source: std::collections::HashMap<u32, Vec<u8>> = Default::default();
    let mut last_seq: Option<u32> = None;
    let mut total = 0;
    while total < 60 {
        total += ring.drain(
            8,
            |info| {
                if let Some(prev) = last_seq {
                    assert_eq!(info.seq, prev + 1, "ring sequence must be gapless");
                }
                last_seq = Some(info.seq);
                let bytes = ring.payload(&info);
                per_source.entry(info.source).or_default().push(bytes[1]);
            },
            |pos| panic!("corruption at {pos}"),
        );
        thread::yield_now();
    }

    for handle in handles {
        handle.join().unwrap();
    }

    for source in 1..=3u32 {
        let seen = &per_source[&source];
        let expected: Vec<u8> = (0..20).collect();
        assert_eq!(seen, &expected, "writer {source} messages out of order");
    }
}

#[test]
fn available_matches_write_capacity() {
    let region = small_region();
    let ring = region.ring(RingId::In);
    let head = 0u32;
    let tail = 0u32;
    let free = available(head, tail, ring.size());

    // A payload sized so the aligned record equals the free space must be
    // rejected (one slot stays empty), one word less must fit.
    let too_big = free - 16 + 1;
    assert!(ring.try_write(head, tail, &vec![0u8; too_big], 0, 0).is_err());
    ring.try_write(head, tail, &vec![0u8; free - 16 - 4], 0, 0)
        .unwrap();
}
