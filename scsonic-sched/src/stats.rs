//! Client-side scheduling counters.
//!
//! These live outside the engine's metrics block: they describe what the
//! prescheduler and the facade's bypass path did, not what the engine
//! observed. All fields are atomics so the facade can read them while the
//! scheduler worker runs.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use scsonic_types::metrics::METRIC_UNSET;

/// Shared counter block. Counters are cumulative; gauges follow the
/// metrics-block conventions (`METRIC_UNSET` = never written).
#[derive(Debug)]
pub struct SchedulerStats {
    /// Bundles accepted into the heap.
    pub scheduled: AtomicU64,
    /// Events handed to the IN path (heap and retry paths combined).
    pub dispatched: AtomicU64,
    /// Events removed by cancel_* before dispatch.
    pub cancelled: AtomicU64,
    /// Events that popped after their execution time.
    pub late: AtomicU64,
    /// schedule() calls refused because heap + retry hit capacity.
    pub queue_full: AtomicU64,
    /// Events parked in the retry queue after a full buffer.
    pub retry_queued: AtomicU64,
    /// Retry-queue entries that eventually dispatched.
    pub retry_succeeded: AtomicU64,
    /// Retry drains that hit a full buffer again.
    pub retry_requeued: AtomicU64,
    /// Current heap + retry cardinality.
    pub pending: AtomicUsize,
    /// High-water mark of `pending`.
    pub pending_peak: AtomicUsize,
    /// Worst observed lateness, milliseconds.
    pub max_late_ms: AtomicU32,
    /// Smallest observed dispatch headroom, milliseconds.
    pub min_headroom_ms: AtomicU32,
    /// Bypass traffic by category.
    pub bypass_non_bundle: AtomicU64,
    pub bypass_immediate: AtomicU64,
    pub bypass_near_future: AtomicU64,
    pub bypass_late: AtomicU64,
    /// Bypass attempts that lost the race and fell back to the
    /// prescheduler's blocking path.
    pub direct_fallback: AtomicU64,
    /// Total messages the facade sent, all paths.
    pub messages_sent: AtomicU64,
}

impl SchedulerStats {
    pub fn new() -> Self {
        Self {
            scheduled: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            late: AtomicU64::new(0),
            queue_full: AtomicU64::new(0),
            retry_queued: AtomicU64::new(0),
            retry_succeeded: AtomicU64::new(0),
            retry_requeued: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
            pending_peak: AtomicUsize::new(0),
            max_late_ms: AtomicU32::new(0),
            min_headroom_ms: AtomicU32::new(METRIC_UNSET),
            bypass_non_bundle: AtomicU64::new(0),
            bypass_immediate: AtomicU64::new(0),
            bypass_near_future: AtomicU64::new(0),
            bypass_late: AtomicU64::new(0),
            direct_fallback: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Record the current cardinality and bump the peak if needed.
    pub fn set_pending(&self, pending: usize) {
        self.pending.store(pending, Ordering::Relaxed);
        self.pending_peak.fetch_max(pending, Ordering::Relaxed);
    }

    /// Fold a lateness observation into the max gauge.
    pub fn observe_late(&self, late_ms: u32) {
        self.late.fetch_add(1, Ordering::Relaxed);
        self.max_late_ms.fetch_max(late_ms, Ordering::Relaxed);
    }

    /// Fold a headroom observation into the min gauge (sentinel-guarded).
    pub fn observe_headroom(&self, headroom_ms: u32) {
        self.min_headroom_ms
            .fetch_min(headroom_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            retry_queued: self.retry_queued.load(Ordering::Relaxed),
            retry_succeeded: self.retry_succeeded.load(Ordering::Relaxed),
            retry_requeued: self.retry_requeued.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            pending_peak: self.pending_peak.load(Ordering::Relaxed),
            max_late_ms: self.max_late_ms.load(Ordering::Relaxed),
            min_headroom_ms: match self.min_headroom_ms.load(Ordering::Relaxed) {
                METRIC_UNSET => None,
                v => Some(v),
            },
            bypass_non_bundle: self.bypass_non_bundle.load(Ordering::Relaxed),
            bypass_immediate: self.bypass_immediate.load(Ordering::Relaxed),
            bypass_near_future: self.bypass_near_future.load(Ordering::Relaxed),
            bypass_late: self.bypass_late.load(Ordering::Relaxed),
            direct_fallback: self.direct_fallback.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
        }
    }
}

impl Default for SchedulerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain copy of the counters at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub scheduled: u64,
    pub dispatched: u64,
    pub cancelled: u64,
    pub late: u64,
    pub queue_full: u64,
    pub retry_queued: u64,
    pub retry_succeeded: u64,
    pub retry_requeued: u64,
    pub pending: usize,
    pub pending_peak: usize,
    pub max_late_ms: u32,
    pub min_headroom_ms: Option<u32>,
    pub bypass_non_bundle: u64,
    pub bypass_immediate: u64,
    pub bypass_near_future: u64,
    pub bypass_late: u64,
    pub direct_fallback: u64,
    pub messages_sent: u64,
}
