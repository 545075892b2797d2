//! Events delivered to facade subscribers.

use serde::{Deserialize, Serialize};

use crate::tree::NodeTree;

/// Subscription key. Every [`Event`] maps to exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Session plumbing is up; clients (re)build groups and routing here.
    Setup,
    /// Session is fully usable.
    Ready,
    /// Audio clock restarted after a suspension.
    Resumed,
    /// A decoded OSC reply from the engine.
    Reply,
    /// A line of engine diagnostics text.
    Debug,
    /// Engine status flags changed.
    Status,
    /// Metrics + node-tree snapshot.
    Snapshot,
    /// An error surfaced asynchronously (engine fault, handler failure).
    Error,
}

/// A metrics + node-tree capture, decoded from the contiguous
/// metrics/tree span.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub metrics: Vec<u32>,
    pub tree: NodeTree,
}

impl StateSnapshot {
    /// Schema-aware view over the captured metric words.
    pub fn metrics_view(&self) -> crate::metrics::MetricsView<'_> {
        crate::metrics::MetricsView::new(&self.metrics)
    }
}

/// Payload delivered to subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    Setup,
    Ready,
    Resumed,
    Reply(rosc::OscMessage),
    Debug(String),
    Status { flags: u32 },
    Snapshot(StateSnapshot),
    Error(String),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Setup => EventKind::Setup,
            Event::Ready => EventKind::Ready,
            Event::Resumed => EventKind::Resumed,
            Event::Reply(_) => EventKind::Reply,
            Event::Debug(_) => EventKind::Debug,
            Event::Status { .. } => EventKind::Status,
            Event::Snapshot(_) => EventKind::Snapshot,
            Event::Error(_) => EventKind::Error,
        }
    }
}
