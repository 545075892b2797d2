//! The layout constants must survive the trip from the engine export to
//! whatever context reattaches to the region: serialised and decoded
//! descriptors describe byte-identical geometry, and a writer/reader
//! pair driven from the two copies agree on every record.

use std::sync::Arc;

use scsonic_shm::{LayoutDescriptor, RingId, RingWriter, SharedRegion, WriteOptions};

fn layout() -> LayoutDescriptor {
    LayoutDescriptor::packed(512, 4096, 2048, 1024, 256, 8192, 2, 128)
}

#[test]
fn descriptor_survives_serialisation() {
    let original = layout();
    let json = serde_json::to_string(&original).unwrap();
    let decoded: LayoutDescriptor = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, original);
    decoded.validate().unwrap();
}

#[test]
fn writer_and_reader_agree_across_a_decoded_layout() {
    let original = layout();
    let json = serde_json::to_string(&original).unwrap();
    let decoded: LayoutDescriptor = serde_json::from_str(&json).unwrap();

    // One region; the "remote" side only ever sees the decoded copy of
    // the constants.
    let region = Arc::new(SharedRegion::new(original).unwrap());
    let writer = RingWriter::new(Arc::clone(&region));
    writer
        .write(b"/notify\0,i\0\0\0\0\0\x01", 4, WriteOptions::main_thread())
        .unwrap();

    assert_eq!(region.layout().in_ring, decoded.in_ring);
    assert_eq!(region.layout().control_offset, decoded.control_offset);

    let mut seen = Vec::new();
    let ring = region.ring(RingId::In);
    ring.drain(4, |info| seen.push((info.seq, info.source, info.len)), |_| {});
    assert_eq!(seen, vec![(0, 4, 16)]);
}

#[test]
fn tampered_descriptor_fails_validation() {
    let mut decoded: LayoutDescriptor =
        serde_json::from_str(&serde_json::to_string(&layout()).unwrap()).unwrap();
    decoded.in_ring.size += 2; // no longer 4-byte aligned
    assert!(decoded.validate().is_err());
}
