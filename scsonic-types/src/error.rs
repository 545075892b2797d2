//! Error kinds for the transport layer, classified by recovery policy.
//!
//! Caller-contract errors are raised synchronously at the call site and
//! change no state. Transient overload is absorbed internally where
//! possible (`BufferFull` and `LockContended` fall back to the
//! prescheduler's blocking dispatch); everything else is surfaced.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The prescheduler's heap plus retry queue reached capacity.
    #[error("prescheduler queue full ({pending} pending, capacity {capacity})")]
    QueueFull { pending: usize, capacity: usize },

    /// A bundle payload exceeds the engine scheduler's slot size.
    #[error("bundle of {size} bytes exceeds engine scheduler slot ({limit} bytes)")]
    BundleTooLarge { size: usize, limit: usize },

    /// A bundle is timestamped more than the far-future limit ahead.
    #[error("bundle scheduled {ahead:.3}s ahead exceeds the {limit:.0}s limit")]
    BundleTooFarFuture { ahead: f64, limit: f64 },

    /// A framed record cannot fit in the ring even when empty.
    #[error("record of {size} bytes exceeds ring capacity ({max} bytes)")]
    RecordTooLarge { size: usize, max: usize },

    /// Not enough free space in the ring for the aligned record.
    #[error("ring buffer full")]
    BufferFull,

    /// Non-blocking lock acquisition failed.
    #[error("writer lock contended")]
    LockContended,

    /// The blocking lock wait exhausted its cumulative timeout.
    #[error("writer lock wait timed out")]
    LockTimeout,

    /// No matching /synced reply arrived within the sync window.
    #[error("sync id {0} timed out")]
    SyncTimeout(i32),

    /// A command on the blocked list was refused, with a remediation hint.
    #[error("{addr} is not supported here: {hint}")]
    BlockedCommand { addr: String, hint: String },

    /// An operation that requires a live session was called too early
    /// (or after destroy).
    #[error("session not initialised (state: {0})")]
    NotInitialised(String),

    /// The engine's layout export failed validation.
    #[error("invalid memory layout: {0}")]
    InvalidLayout(String),

    /// The engine signalled a fatal error through the status flags, or an
    /// engine export misbehaved.
    #[error("engine error: {0}")]
    EngineError(String),

    /// OSC encode/decode failure from the codec boundary.
    #[error("osc codec error: {0}")]
    Codec(String),

    /// A worker the operation depends on has shut down.
    #[error("worker disconnected: {0}")]
    Disconnected(&'static str),
}

impl Error {
    /// Caller-contract errors: synchronous, no state change.
    pub fn is_caller_contract(&self) -> bool {
        matches!(
            self,
            Error::BlockedCommand { .. }
                | Error::BundleTooLarge { .. }
                | Error::BundleTooFarFuture { .. }
                | Error::RecordTooLarge { .. }
                | Error::NotInitialised(_)
        )
    }

    /// Transient overload that internal fallback paths may absorb.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::QueueFull { .. } | Error::BufferFull | Error::LockContended
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_covers_contract_errors() {
        assert!(Error::NotInitialised("Uninitialised".into()).is_caller_contract());
        assert!(Error::BundleTooLarge { size: 9000, limit: 8192 }.is_caller_contract());
        assert!(!Error::BufferFull.is_caller_contract());
    }

    #[test]
    fn transient_kinds() {
        assert!(Error::BufferFull.is_transient());
        assert!(Error::LockContended.is_transient());
        assert!(!Error::SyncTimeout(1).is_transient());
    }

    #[test]
    fn display_carries_context() {
        let e = Error::BlockedCommand {
            addr: "/d_load".into(),
            hint: "send the compiled definition with /d_recv".into(),
        };
        let s = e.to_string();
        assert!(s.contains("/d_load"));
        assert!(s.contains("/d_recv"));
    }
}
