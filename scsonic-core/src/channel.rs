//! Transferable OSC input capability.
//!
//! An `OscChannel` lets another execution context send into the IN path
//! without routing through the session facade: it carries the
//! mode-appropriate write endpoint, a port into the prescheduler for
//! far-future bundles and contention fallback, and a source id so the
//! engine-side log can attribute traffic per writer. The plain-data half
//! travels as a [`ChannelDescriptor`] (bincode); endpoints reattach at
//! the owning session.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use scsonic_sched::{classify, DispatchSink, NtpClock, SchedulerPort};
use scsonic_shm::{RingWriter, WriteOptions};
use scsonic_types::{Error, Mode, Result, SessionId, SourceId};

use scsonic_engine::PostedSink;

/// The mode-appropriate write endpoint.
pub enum ChannelPath {
    /// Shared-memory mode: the locked ring writer.
    Shared(Arc<RingWriter>),
    /// Message-passing mode: the posted-datagram channel.
    Posted(Arc<PostedSink>),
}

pub struct OscChannel {
    pub(crate) path: ChannelPath,
    pub(crate) sched: SchedulerPort,
    pub(crate) clock: NtpClock,
    pub(crate) bypass_lookahead: f64,
    pub(crate) source: SourceId,
    pub(crate) blocking: bool,
}

impl OscChannel {
    /// Send a raw datagram with no session/tag labels.
    pub fn send(&self, datagram: &[u8]) -> Result<()> {
        self.send_tagged(datagram, 0, None)
    }

    /// Send a raw datagram. Far-future bundles go through the
    /// prescheduler under the given labels; everything else takes the
    /// direct path, falling back to the prescheduler's blocking dispatch
    /// on contention (the source id rides along on every path).
    pub fn send_tagged(
        &self,
        datagram: &[u8],
        session_id: SessionId,
        run_tag: Option<String>,
    ) -> Result<()> {
        let category = classify(
            datagram,
            Some(self.clock.now()),
            self.bypass_lookahead,
        );
        if !category.bypasses() {
            return self
                .sched
                .schedule(datagram.to_vec(), session_id, run_tag, self.source);
        }

        let direct = match &self.path {
            ChannelPath::Shared(writer) => {
                let opts = if self.blocking {
                    WriteOptions::worker()
                } else {
                    WriteOptions::main_thread()
                };
                writer.write(datagram, self.source, opts)
            }
            ChannelPath::Posted(sink) => sink.dispatch(datagram, self.source),
        };
        match direct {
            Err(Error::LockContended) | Err(Error::BufferFull) => {
                self.sched.direct_dispatch(datagram.to_vec(), self.source)
            }
            other => other,
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    /// The serialisable half of the handle.
    pub fn descriptor(&self) -> ChannelDescriptor {
        ChannelDescriptor {
            mode: match self.path {
                ChannelPath::Shared(_) => Mode::SharedMemory,
                ChannelPath::Posted(_) => Mode::MessagePassing,
            },
            bypass_lookahead: self.bypass_lookahead,
            source: self.source,
            blocking: self.blocking,
        }
    }
}

/// Plain-data description of a channel; both endpoints must agree on the
/// session it reattaches to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub mode: Mode,
    pub bypass_lookahead: f64,
    pub source: SourceId,
    pub blocking: bool,
}

impl ChannelDescriptor {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| Error::Codec(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(d, _)| d)
            .map_err(|e| Error::Codec(e.to_string()))
    }
}
