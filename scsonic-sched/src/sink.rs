//! Where dispatched datagrams go.
//!
//! The prescheduler does not care which transport mode is active; it
//! hands payloads to a [`DispatchSink`]. The shared-memory sink wraps the
//! locked ring writer; the message-passing sink lives with the audio
//! processor (a bounded channel whose consumer is the audio thread).

use std::sync::Arc;
use std::time::Duration;

use scsonic_shm::{RingWriter, WaitOutcome, WriteOptions};
use scsonic_types::{Result, SourceId};

/// A blocking-capable path into the IN stream.
pub trait DispatchSink: Send + Sync {
    /// Deliver one datagram. `Err(BufferFull)` must be retryable.
    fn dispatch(&self, payload: &[u8], source: SourceId) -> Result<()>;

    /// Progress token of the consumer side, observed before parking.
    fn space_token(&self) -> u32;

    /// Block until the consumer moves past `token`, or until `timeout`.
    /// Returns `true` if progress was observed.
    fn wait_for_space(&self, token: u32, timeout: Duration) -> bool;

    /// Payload bytes a single record may carry.
    fn max_payload(&self) -> usize;
}

/// Shared-memory sink: the blocking write path over the IN ring lock.
pub struct SharedSink {
    writer: Arc<RingWriter>,
}

impl SharedSink {
    pub fn new(writer: Arc<RingWriter>) -> Self {
        Self { writer }
    }
}

impl DispatchSink for SharedSink {
    fn dispatch(&self, payload: &[u8], source: SourceId) -> Result<()> {
        self.writer.write(payload, source, WriteOptions::worker())
    }

    fn space_token(&self) -> u32 {
        self.writer.in_tail()
    }

    fn wait_for_space(&self, token: u32, timeout: Duration) -> bool {
        self.writer.wait_for_space(token, timeout) == WaitOutcome::Changed
    }

    fn max_payload(&self) -> usize {
        self.writer.max_payload()
    }
}
