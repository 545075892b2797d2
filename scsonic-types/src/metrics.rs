//! Descriptive schema over the engine's flat metrics block.
//!
//! The metrics block is an array of 32-bit words at a fixed offset in the
//! shared region, written only by the engine. The same schema reads either
//! the live block or a snapshot byte-copy, so both transport modes share
//! one surface.

/// Sentinel meaning "gauge has not been written yet" (used by headroom
/// minima, which only ever decrease).
pub const METRIC_UNSET: u32 = 0xFFFF_FFFF;

/// Number of 32-bit words in the metrics block.
pub const METRIC_WORDS: usize = 16;

/// Word index of each metric within the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum MetricId {
    /// OSC messages the engine consumed from the IN ring.
    OscInReceived = 0,
    /// Corrupt records skipped by scan-recovery.
    OscInCorrupted = 1,
    /// Bytes consumed from the IN ring.
    OscInBytes = 2,
    /// Replies the engine framed into the OUT ring.
    OscOutSent = 3,
    /// Text lines framed into the DEBUG ring.
    DebugLines = 4,
    /// Audio callbacks processed since boot.
    AudioCallbacks = 5,
    /// Worst observed callback cost in microseconds (current window).
    CallbackMaxUs = 6,
    /// Smallest observed free space in the IN ring, in bytes.
    InRingHeadroomMin = 7,
    /// Live nodes in the tree mirror.
    NodeCount = 8,
    /// Tree mirror version.
    TreeVersion = 9,
    /// World sample rate in Hz.
    SampleRate = 10,
    /// Frames per audio callback.
    BlockFrames = 11,
    /// Raw status flag word (see control-block status bits).
    EngineStatus = 12,
    /// Occupied slots in the engine's internal bundle scheduler.
    SchedSlotsUsed = 13,
    /// Bundles the engine's internal scheduler refused.
    SchedDropped = 14,
}

/// How a metric's value behaves over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Cumulative since boot.
    Counter,
    /// Point-in-time snapshot.
    Gauge,
    /// Written once at init.
    Constant,
    /// Bit flags / discrete states.
    Enum,
}

/// Static description of one metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricDesc {
    pub id: MetricId,
    pub name: &'static str,
    pub kind: MetricKind,
    pub unit: &'static str,
}

/// The full schema, in word order.
pub const METRICS: &[MetricDesc] = &[
    MetricDesc { id: MetricId::OscInReceived, name: "osc_in_received", kind: MetricKind::Counter, unit: "messages" },
    MetricDesc { id: MetricId::OscInCorrupted, name: "osc_in_corrupted", kind: MetricKind::Counter, unit: "records" },
    MetricDesc { id: MetricId::OscInBytes, name: "osc_in_bytes", kind: MetricKind::Counter, unit: "bytes" },
    MetricDesc { id: MetricId::OscOutSent, name: "osc_out_sent", kind: MetricKind::Counter, unit: "messages" },
    MetricDesc { id: MetricId::DebugLines, name: "debug_lines", kind: MetricKind::Counter, unit: "lines" },
    MetricDesc { id: MetricId::AudioCallbacks, name: "audio_callbacks", kind: MetricKind::Counter, unit: "callbacks" },
    MetricDesc { id: MetricId::CallbackMaxUs, name: "callback_max_us", kind: MetricKind::Gauge, unit: "us" },
    MetricDesc { id: MetricId::InRingHeadroomMin, name: "in_ring_headroom_min", kind: MetricKind::Gauge, unit: "bytes" },
    MetricDesc { id: MetricId::NodeCount, name: "node_count", kind: MetricKind::Gauge, unit: "nodes" },
    MetricDesc { id: MetricId::TreeVersion, name: "tree_version", kind: MetricKind::Gauge, unit: "" },
    MetricDesc { id: MetricId::SampleRate, name: "sample_rate", kind: MetricKind::Constant, unit: "hz" },
    MetricDesc { id: MetricId::BlockFrames, name: "block_frames", kind: MetricKind::Constant, unit: "frames" },
    MetricDesc { id: MetricId::EngineStatus, name: "engine_status", kind: MetricKind::Enum, unit: "flags" },
    MetricDesc { id: MetricId::SchedSlotsUsed, name: "sched_slots_used", kind: MetricKind::Gauge, unit: "slots" },
    MetricDesc { id: MetricId::SchedDropped, name: "sched_dropped", kind: MetricKind::Counter, unit: "bundles" },
];

/// Read-only view over a metrics word array (live block or snapshot copy).
#[derive(Debug, Clone, Copy)]
pub struct MetricsView<'a> {
    words: &'a [u32],
}

impl<'a> MetricsView<'a> {
    /// Wrap a word slice. The slice must hold at least [`METRIC_WORDS`]
    /// entries.
    pub fn new(words: &'a [u32]) -> Self {
        debug_assert!(words.len() >= METRIC_WORDS);
        Self { words }
    }

    pub fn get(&self, id: MetricId) -> u32 {
        self.words[id as usize]
    }

    /// `None` while the gauge still carries the unset sentinel.
    pub fn get_gauge(&self, id: MetricId) -> Option<u32> {
        match self.words[id as usize] {
            METRIC_UNSET => None,
            v => Some(v),
        }
    }

    /// Iterate `(descriptor, value)` pairs in schema order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static MetricDesc, u32)> + '_ {
        METRICS.iter().map(|d| (d, self.words[d.id as usize]))
    }
}
