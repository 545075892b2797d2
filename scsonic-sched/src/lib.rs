//! # scsonic-sched
//!
//! Timing for the transport: the NTP time base, the classifier that
//! decides whether a datagram bypasses scheduling, and the prescheduler —
//! a time-ordered dispatch queue with tag-based cancellation and bounded
//! retry, hosted on its own worker thread.

pub mod classify;
pub mod ntp;
pub mod prescheduler;
pub mod sink;
pub mod stats;

pub use classify::{bundle_timetag, classify, BundleCategory, DEFAULT_BYPASS_LOOKAHEAD};
pub use ntp::{NtpClock, NTP_UNIX_OFFSET};
pub use prescheduler::{Prescheduler, PreschedulerConfig, SchedulerPort, MAX_SCHEDULE_AHEAD_SECS};
pub use sink::{DispatchSink, SharedSink};
pub use stats::{SchedulerStats, StatsSnapshot};
