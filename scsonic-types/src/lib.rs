//! # scsonic-types
//!
//! Shared type definitions for the scsonic transport layer.
//! This crate contains data structures used across scsonic-shm,
//! scsonic-sched, scsonic-engine, and scsonic-core.

pub mod args;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod tree;

pub use args::OscArg;
pub use config::{Config, Mode, WorldOptions};
pub use error::{Error, Result};
pub use events::{Event, EventKind, StateSnapshot};
pub use metrics::{MetricDesc, MetricId, MetricKind, MetricsView, METRICS, METRIC_UNSET};
pub use tree::{NodeTree, NodeTreeEntry};

/// Label attached to scheduled events so a whole session's worth of
/// pending bundles can be cancelled at once.
pub type SessionId = u32;

/// Identifies which execution context produced a message, for logging
/// and per-writer diagnostics. The main controller is source 0.
pub type SourceId = u32;

/// Source id used by the main controller's own sends.
pub const MAIN_SOURCE: SourceId = 0;
