//! Region layout, discovered from the engine at load time.
//!
//! The engine binary exports every offset and size so the audio thread and
//! the client contexts agree without compiled-in constants. The descriptor
//! is plain data and travels inside channel handles.

use serde::{Deserialize, Serialize};

use scsonic_types::metrics::METRIC_WORDS;
use scsonic_types::tree::TREE_WORDS;
use scsonic_types::{Error, Result};

/// Marks a valid record header.
pub const RECORD_MAGIC: u32 = 0xDEAD_BEEF;

/// Marks a padding record: the writer wrapped to offset 0.
pub const PADDING_MAGIC: u32 = 0xDEAD_FEED;

/// Bytes per record header: magic, aligned length, sequence, source.
pub const RECORD_HEADER_BYTES: usize = 16;

/// Records are aligned to 4 bytes.
pub const RECORD_ALIGN: usize = 4;

/// A contiguous `[offset, offset + size)` span inside the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSpan {
    pub offset: usize,
    pub size: usize,
}

impl RegionSpan {
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Every offset/size constant the transport needs, as exported by the
/// engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutDescriptor {
    /// Total bytes in the shared region.
    pub region_bytes: usize,
    /// The engine's private heap (opaque to this layer).
    pub engine_heap: RegionSpan,
    pub in_ring: RegionSpan,
    pub out_ring: RegionSpan,
    pub debug_ring: RegionSpan,
    /// 48-byte control block (see [`crate::control`]).
    pub control_offset: usize,
    /// Metrics block of [`METRIC_WORDS`] u32 words, contiguous with the
    /// tree mirror so one byte-copy snapshots both.
    pub metrics_offset: usize,
    pub tree_offset: usize,
    /// f64 NTP time corresponding to audio clock zero.
    pub ntp_start_offset: usize,
    /// i32 clock drift adjustment, milliseconds.
    pub drift_offset: usize,
    /// i32 wall-clock offset, milliseconds.
    pub clock_offset: usize,
    /// Audio capture staging buffer.
    pub capture: RegionSpan,
    /// Arena serviced by the facade for `/b_allocPtr` buffers.
    pub sample_pool: RegionSpan,
    pub input_bus_offset: usize,
    pub input_channels: usize,
    pub output_bus_offset: usize,
    pub output_channels: usize,
    /// Frames per audio callback (contractually 128).
    pub block_frames: usize,
    /// Byte capacity of one slot in the engine's internal bundle
    /// scheduler; bundles above this are refused before they ship.
    pub scheduler_slot_bytes: usize,
    /// Slot count of the engine's internal bundle scheduler.
    pub scheduler_slots: usize,
}

impl LayoutDescriptor {
    /// Build a layout by packing the blocks in their canonical order
    /// after an engine
    /// heap of `heap_bytes`. Engines use this to derive their export; tests
    /// use it to shrink the region.
    pub fn packed(
        heap_bytes: usize,
        in_bytes: usize,
        out_bytes: usize,
        debug_bytes: usize,
        capture_bytes: usize,
        sample_pool_bytes: usize,
        channels: usize,
        block_frames: usize,
    ) -> Self {
        let bus_bytes = channels * block_frames * 4;

        let mut cursor = 0usize;
        let mut take = |bytes: usize, align: usize| {
            cursor = cursor.div_ceil(align) * align;
            let offset = cursor;
            cursor += bytes;
            offset
        };

        let heap = take(heap_bytes, 8);
        let input_bus_offset = take(bus_bytes, 4);
        let output_bus_offset = take(bus_bytes, 4);
        let in_off = take(in_bytes, 4);
        let out_off = take(out_bytes, 4);
        let debug_off = take(debug_bytes, 4);
        let control_offset = take(crate::control::CONTROL_BYTES, 4);
        let metrics_offset = take(METRIC_WORDS * 4, 4);
        let tree_offset = take(TREE_WORDS * 4, 4);
        let ntp_start_offset = take(8, 8);
        let drift_offset = take(4, 4);
        let clock_offset = take(4, 4);
        let capture_off = take(capture_bytes, 4);
        let pool_off = take(sample_pool_bytes, 8);

        LayoutDescriptor {
            region_bytes: cursor.div_ceil(8) * 8,
            engine_heap: RegionSpan { offset: heap, size: heap_bytes },
            in_ring: RegionSpan { offset: in_off, size: in_bytes },
            out_ring: RegionSpan { offset: out_off, size: out_bytes },
            debug_ring: RegionSpan { offset: debug_off, size: debug_bytes },
            control_offset,
            metrics_offset,
            tree_offset,
            ntp_start_offset,
            drift_offset,
            clock_offset,
            capture: RegionSpan { offset: capture_off, size: capture_bytes },
            sample_pool: RegionSpan { offset: pool_off, size: sample_pool_bytes },
            input_bus_offset,
            input_channels: channels,
            output_bus_offset,
            output_channels: channels,
            block_frames,
            scheduler_slot_bytes: 8192,
            scheduler_slots: 1024,
        }
    }

    /// The contiguous metrics + tree span captured by snapshots.
    pub fn snapshot_span(&self) -> RegionSpan {
        RegionSpan {
            offset: self.metrics_offset,
            size: (METRIC_WORDS + TREE_WORDS) * 4,
        }
    }

    /// Validate internal consistency. Every failure is an
    /// [`Error::InvalidLayout`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        let aligned = |name: &str, off: usize, align: usize| -> Result<()> {
            if off % align != 0 {
                return Err(Error::InvalidLayout(format!(
                    "{name} offset {off} not {align}-byte aligned"
                )));
            }
            Ok(())
        };

        aligned("in_ring", self.in_ring.offset, 4)?;
        aligned("out_ring", self.out_ring.offset, 4)?;
        aligned("debug_ring", self.debug_ring.offset, 4)?;
        aligned("control", self.control_offset, 4)?;
        aligned("metrics", self.metrics_offset, 4)?;
        aligned("tree", self.tree_offset, 4)?;
        aligned("ntp_start", self.ntp_start_offset, 8)?;

        for (name, ring) in [
            ("in_ring", &self.in_ring),
            ("out_ring", &self.out_ring),
            ("debug_ring", &self.debug_ring),
        ] {
            if ring.size < 2 * RECORD_HEADER_BYTES {
                return Err(Error::InvalidLayout(format!(
                    "{name} of {} bytes cannot hold a record",
                    ring.size
                )));
            }
            if ring.size % RECORD_ALIGN != 0 {
                return Err(Error::InvalidLayout(format!(
                    "{name} size {} not a multiple of {RECORD_ALIGN}",
                    ring.size
                )));
            }
        }

        if self.block_frames == 0 {
            return Err(Error::InvalidLayout("block_frames is zero".into()));
        }
        if self.scheduler_slot_bytes < RECORD_HEADER_BYTES {
            return Err(Error::InvalidLayout(format!(
                "scheduler_slot_bytes {} too small",
                self.scheduler_slot_bytes
            )));
        }

        // No block may overlap another or spill past the region end.
        let snapshot = self.snapshot_span();
        let bus_bytes_in = self.input_channels * self.block_frames * 4;
        let bus_bytes_out = self.output_channels * self.block_frames * 4;
        let mut spans: Vec<(&str, RegionSpan)> = vec![
            ("engine_heap", self.engine_heap),
            ("input_bus", RegionSpan { offset: self.input_bus_offset, size: bus_bytes_in }),
            ("output_bus", RegionSpan { offset: self.output_bus_offset, size: bus_bytes_out }),
            ("in_ring", self.in_ring),
            ("out_ring", self.out_ring),
            ("debug_ring", self.debug_ring),
            ("control", RegionSpan { offset: self.control_offset, size: crate::control::CONTROL_BYTES }),
            ("metrics+tree", snapshot),
            ("ntp_start", RegionSpan { offset: self.ntp_start_offset, size: 8 }),
            ("drift", RegionSpan { offset: self.drift_offset, size: 4 }),
            ("clock", RegionSpan { offset: self.clock_offset, size: 4 }),
            ("capture", self.capture),
            ("sample_pool", self.sample_pool),
        ];
        spans.sort_by_key(|(_, s)| s.offset);
        for pair in spans.windows(2) {
            let (a_name, a) = pair[0];
            let (b_name, b) = pair[1];
            if a.end() > b.offset {
                return Err(Error::InvalidLayout(format!(
                    "{a_name} [{}..{}) overlaps {b_name} at {}",
                    a.offset,
                    a.end(),
                    b.offset
                )));
            }
        }
        if let Some((name, last)) = spans.last() {
            if last.end() > self.region_bytes {
                return Err(Error::InvalidLayout(format!(
                    "{name} ends at {} past region of {} bytes",
                    last.end(),
                    self.region_bytes
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> LayoutDescriptor {
        LayoutDescriptor::packed(256, 1024, 1024, 512, 512, 4096, 2, 128)
    }

    #[test]
    fn packed_layout_validates() {
        small().validate().unwrap();
    }

    #[test]
    fn overlap_is_rejected() {
        let mut l = small();
        l.out_ring.offset = l.in_ring.offset + 4;
        let err = l.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidLayout(_)), "{err}");
    }

    #[test]
    fn misaligned_ntp_cell_is_rejected() {
        let mut l = small();
        l.ntp_start_offset += 4;
        assert!(l.validate().is_err());
    }

    #[test]
    fn undersized_ring_is_rejected() {
        let mut l = small();
        l.debug_ring.size = RECORD_HEADER_BYTES;
        assert!(l.validate().is_err());
    }

    #[test]
    fn truncated_region_is_rejected() {
        let mut l = small();
        l.region_bytes = l.sample_pool.offset;
        assert!(l.validate().is_err());
    }

    #[test]
    fn snapshot_span_covers_metrics_and_tree() {
        let l = small();
        let s = l.snapshot_span();
        assert_eq!(s.offset, l.metrics_offset);
        assert_eq!(s.end(), l.tree_offset + TREE_WORDS * 4);
    }
}
