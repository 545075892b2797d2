//! Framed-record primitives over one ring's byte span.
//!
//! Records are 4-byte aligned and carry a 16-byte header: magic, aligned
//! total length, per-ring sequence, source id, all little-endian. A record
//! never straddles the region end; when the tail-end remainder is too
//! small the writer emits a padding marker there (or, below 4 bytes,
//! nothing) and restarts at offset 0, and readers skip accordingly.
//!
//! Readers that meet an unknown magic or an impossible length report the
//! position and advance one byte, so a single corrupt header cannot wedge
//! the stream.

use std::sync::atomic::Ordering;

use scsonic_types::{Error, Result, SourceId};

use crate::layout::{RegionSpan, PADDING_MAGIC, RECORD_ALIGN, RECORD_HEADER_BYTES, RECORD_MAGIC};
use crate::region::{RingId, SharedRegion};

/// Free bytes given head/tail. One slot stays empty so a full ring never
/// looks empty.
pub fn available(head: u32, tail: u32, size: usize) -> usize {
    (size - 1 - head as usize + tail as usize) % size
}

fn align_up(len: usize) -> usize {
    len.div_ceil(RECORD_ALIGN) * RECORD_ALIGN
}

/// A record located by a reader. `offset` is absolute in the region, so
/// the payload can be copied out without further arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordInfo {
    pub offset: usize,
    pub len: usize,
    pub seq: u32,
    pub source: SourceId,
}

/// One ring's framed view.
#[derive(Clone, Copy)]
pub struct RingView<'a> {
    region: &'a SharedRegion,
    span: RegionSpan,
    id: RingId,
}

impl<'a> RingView<'a> {
    pub(crate) fn new(region: &'a SharedRegion, span: RegionSpan, id: RingId) -> Self {
        Self { region, span, id }
    }

    pub fn size(&self) -> usize {
        self.span.size
    }

    /// Largest payload this ring can ever hold, accounting for the header
    /// and the permanently-empty slot.
    pub fn max_payload(&self) -> usize {
        self.span.size - RECORD_HEADER_BYTES - RECORD_ALIGN
    }

    fn read_u32(&self, rel: u32) -> u32 {
        let mut bytes = [0u8; 4];
        self.region
            .copy_out(self.span.offset + rel as usize, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn write_u32(&self, rel: u32, value: u32) {
        self.region
            .copy_in(self.span.offset + rel as usize, &value.to_le_bytes());
    }

    /// Frame `payload` at `head`. The caller owns `head` (sole writer
    /// under the lock, or single-threaded producer) and passes the
    /// current `tail`. Returns the new head on success; the caller
    /// publishes it with a release store.
    pub fn try_write(
        &self,
        mut head: u32,
        tail: u32,
        payload: &[u8],
        seq: u32,
        source: SourceId,
    ) -> Result<u32> {
        let size = self.span.size;
        let aligned = align_up(RECORD_HEADER_BYTES + payload.len());
        if aligned >= size {
            return Err(Error::RecordTooLarge {
                size: payload.len(),
                max: self.max_payload(),
            });
        }

        let remainder = size - head as usize;
        let wraps = aligned > remainder;
        let cost = if wraps { remainder + aligned } else { aligned };
        if available(head, tail, size) < cost {
            return Err(Error::BufferFull);
        }

        if wraps {
            // Mark the skipped tail end. Below 4 bytes there is no room
            // for a magic; readers wrap implicitly.
            if remainder >= 4 {
                self.write_u32(head, PADDING_MAGIC);
            }
            if remainder >= 8 {
                self.write_u32(head + 4, remainder as u32);
            }
            head = 0;
        }

        self.write_u32(head, RECORD_MAGIC);
        self.write_u32(head + 4, aligned as u32);
        self.write_u32(head + 8, seq);
        self.write_u32(head + 12, source);
        self.region.copy_in(
            self.span.offset + head as usize + RECORD_HEADER_BYTES,
            payload,
        );
        // Zero the pad bytes so text payloads decode cleanly.
        let pad = aligned - RECORD_HEADER_BYTES - payload.len();
        if pad > 0 {
            self.region.fill(
                RegionSpan {
                    offset: self.span.offset
                        + head as usize
                        + RECORD_HEADER_BYTES
                        + payload.len(),
                    size: pad,
                },
                0,
            );
        }

        Ok(((head as usize + aligned) % size) as u32)
    }

    /// Walk records from `tail` up to `head`, at most `max` messages.
    /// Returns `(new_tail, messages_seen)`.
    pub fn read_records(
        &self,
        head: u32,
        mut tail: u32,
        max: usize,
        mut on_message: impl FnMut(RecordInfo),
        mut on_corruption: impl FnMut(u32),
    ) -> (u32, usize) {
        let size = self.span.size;
        let mut count = 0usize;

        while tail != head && count < max {
            let remainder = size - tail as usize;
            if remainder < 4 {
                tail = 0;
                continue;
            }

            let magic = self.read_u32(tail);
            if magic == PADDING_MAGIC {
                tail = 0;
                continue;
            }
            if magic != RECORD_MAGIC || remainder < RECORD_HEADER_BYTES {
                on_corruption(tail);
                tail = (tail + 1) % size as u32;
                continue;
            }

            let len = self.read_u32(tail + 4) as usize;
            if len < RECORD_HEADER_BYTES
                || len > remainder
                || len % RECORD_ALIGN != 0
            {
                on_corruption(tail);
                tail = (tail + 1) % size as u32;
                continue;
            }

            on_message(RecordInfo {
                offset: self.span.offset + tail as usize + RECORD_HEADER_BYTES,
                len: len - RECORD_HEADER_BYTES,
                seq: self.read_u32(tail + 8),
                source: self.read_u32(tail + 12),
            });
            tail = ((tail as usize + len) % size) as u32;
            count += 1;
        }

        (tail, count)
    }

    /// Single-producer convenience: frame and publish one record, bumping
    /// the ring's sequence counter. Only valid when this context is the
    /// ring's sole writer (the engine on OUT/DEBUG, the audio thread on
    /// IN in message-passing mode).
    pub fn push(&self, payload: &[u8], source: SourceId) -> Result<()> {
        let head_w = self.region.control(self.id.head_word());
        let tail_w = self.region.control(self.id.tail_word());
        let seq_w = self.region.control(self.id.seq_word());

        let head = head_w.load(Ordering::Relaxed);
        let tail = tail_w.load(Ordering::Acquire);
        let seq = seq_w.load(Ordering::Relaxed);

        let new_head = self.try_write(head, tail, payload, seq, source)?;
        seq_w.store(seq.wrapping_add(1), Ordering::Relaxed);
        head_w.store(new_head, Ordering::Release);
        self.region.notify_one(self.id.head_word());
        Ok(())
    }

    /// Single-consumer convenience: drain up to `max` records and publish
    /// the advanced tail. Only valid for the ring's sole reader.
    pub fn drain(
        &self,
        max: usize,
        on_message: impl FnMut(RecordInfo),
        on_corruption: impl FnMut(u32),
    ) -> usize {
        let head_w = self.region.control(self.id.head_word());
        let tail_w = self.region.control(self.id.tail_word());

        let head = head_w.load(Ordering::Acquire);
        let tail = tail_w.load(Ordering::Relaxed);
        let (new_tail, count) = self.read_records(head, tail, max, on_message, on_corruption);
        if new_tail != tail {
            tail_w.store(new_tail, Ordering::Release);
            self.region.notify_one(self.id.tail_word());
        }
        count
    }

    /// Copy a located record's payload into an owned buffer.
    pub fn payload(&self, info: &RecordInfo) -> Vec<u8> {
        let mut buf = vec![0u8; info.len];
        self.region.copy_out(info.offset, &mut buf);
        buf
    }

    /// Copy a located record's payload into a caller buffer
    /// (allocation-free path). Returns the copied length.
    pub fn payload_into(&self, info: &RecordInfo, dst: &mut [u8]) -> usize {
        let n = info.len.min(dst.len());
        self.region.copy_out(info.offset, &mut dst[..n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LayoutDescriptor;
    use std::sync::Arc;

    fn region_with_in_ring(bytes: usize) -> Arc<SharedRegion> {
        let layout = LayoutDescriptor::packed(64, bytes, 256, 256, 64, 256, 2, 128);
        Arc::new(SharedRegion::new(layout).unwrap())
    }

    #[test]
    fn available_keeps_one_slot_empty() {
        assert_eq!(available(0, 0, 256), 255);
        assert_eq!(available(100, 100, 256), 255);
        assert_eq!(available(10, 0, 256), 245);
        assert_eq!(available(0, 10, 256), 9);
    }

    #[test]
    fn write_then_read_roundtrips() {
        let region = region_with_in_ring(256);
        let ring = region.ring(RingId::In);
        let new_head = ring.try_write(0, 0, b"/status\0,\0\0\0", 7, 3).unwrap();
        assert_eq!(new_head, 28); // 16 header + 12 payload

        let mut seen = Vec::new();
        let (tail, count) = ring.read_records(
            new_head,
            0,
            16,
            |info| seen.push((ring.payload(&info), info.seq, info.source)),
            |_| panic!("no corruption expected"),
        );
        assert_eq!(count, 1);
        assert_eq!(tail, new_head);
        assert_eq!(seen, vec![(b"/status\0,\0\0\0".to_vec(), 7, 3)]);
    }

    #[test]
    fn exact_fit_needs_no_padding_marker() {
        let region = region_with_in_ring(256);
        let ring = region.ring(RingId::In);
        // Place head so the record exactly reaches the end (ring empty:
        // tail == head).
        let head = 256 - 32;
        let payload = [0x55u8; 16]; // 16 + 16 header = 32 = remainder
        let new_head = ring
            .try_write(head as u32, head as u32, &payload, 0, 0)
            .unwrap();
        assert_eq!(new_head, 0);

        let mut corruptions = 0;
        let (_, count) =
            ring.read_records(0, head as u32, 4, |_| {}, |_| corruptions += 1);
        assert_eq!(count, 1);
        assert_eq!(corruptions, 0);
    }

    #[test]
    fn one_byte_over_wraps_with_padding_marker() {
        let region = region_with_in_ring(256);
        let ring = region.ring(RingId::In);
        let head = 256 - 32;
        let payload = [0x55u8; 17]; // aligned record is 36 > 32 remaining
        let new_head = ring.try_write(head as u32, 64, &payload, 9, 1).unwrap();
        assert_eq!(new_head, 36);

        let mut infos = Vec::new();
        let (tail, count) =
            ring.read_records(new_head, head as u32, 4, |i| infos.push(i), |_| {});
        assert_eq!(count, 1);
        assert_eq!(tail, new_head);
        assert_eq!(infos[0].seq, 9);
        // The header stores the aligned length, so the 17-byte payload
        // reads back with its (zeroed) pad bytes.
        assert_eq!(infos[0].len, 20);
        // The wrapped record starts at offset 0.
        assert_eq!(infos[0].offset, region.layout().in_ring.offset + 16);
    }

    #[test]
    fn full_ring_rejects_with_buffer_full() {
        let region = region_with_in_ring(256);
        let ring = region.ring(RingId::In);
        let payload = [0u8; 100];
        let h1 = ring.try_write(0, 0, &payload, 0, 0).unwrap();
        let h2 = ring.try_write(h1, 0, &payload, 1, 0).unwrap();
        assert_eq!(
            ring.try_write(h2, 0, &payload, 2, 0).unwrap_err(),
            Error::BufferFull
        );
    }

    #[test]
    fn oversized_payload_is_record_too_large() {
        let region = region_with_in_ring(256);
        let ring = region.ring(RingId::In);
        let payload = vec![0u8; 256];
        assert!(matches!(
            ring.try_write(0, 0, &payload, 0, 0).unwrap_err(),
            Error::RecordTooLarge { .. }
        ));
    }

    #[test]
    fn unknown_magic_recovers_by_single_byte_scan() {
        let region = region_with_in_ring(256);
        let ring = region.ring(RingId::In);

        // A garbage word, then a valid record right after it.
        ring.write_u32(0, 0x1BADF00D);
        let head = ring.try_write(4, 0, b"/ok\0", 1, 0).unwrap();

        let mut corruptions = Vec::new();
        let mut payloads = Vec::new();
        let (tail, count) = ring.read_records(
            head,
            0,
            8,
            |i| payloads.push(ring.payload(&i)),
            |pos| corruptions.push(pos),
        );
        assert_eq!(corruptions, vec![0, 1, 2, 3]);
        assert_eq!(count, 1);
        assert_eq!(payloads, vec![b"/ok\0".to_vec()]);
        assert_eq!(tail, head);
    }

    #[test]
    fn impossible_length_is_corruption() {
        let region = region_with_in_ring(256);
        let ring = region.ring(RingId::In);
        ring.write_u32(0, RECORD_MAGIC);
        ring.write_u32(4, 3); // below header size, misaligned
        let mut corruptions = 0;
        ring.read_records(64, 0, 8, |_| {}, |_| corruptions += 1);
        assert!(corruptions > 0);
    }

    #[test]
    fn push_and_drain_track_sequence() {
        let region = region_with_in_ring(256);
        let ring = region.ring(RingId::In);
        ring.push(b"/one", 5).unwrap();
        ring.push(b"/two", 5).unwrap();

        let mut seqs = Vec::new();
        let n = ring.drain(16, |i| seqs.push(i.seq), |_| {});
        assert_eq!(n, 2);
        assert_eq!(seqs, vec![0, 1]);
        // Ring now empty.
        assert_eq!(ring.drain(16, |_| {}, |_| {}), 0);
    }
}
