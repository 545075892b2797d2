//! Reply and debug reader workers (shared-memory mode).
//!
//! Each reader parks on its ring's head word and drains on wake, copying
//! every payload into an owned buffer (allocation is legal here; these
//! are worker threads, not the audio callback). Sequence gaps between
//! consecutive records mean the writer lapped us; gaps are counted and
//! reported rather than silently swallowed. Gap arithmetic wraps with
//! the u32 sequence, so detection survives counter wrap unless exactly
//! 2^32 records vanish at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;

use scsonic_shm::{RingId, SharedRegion};

/// How long a reader parks before re-checking the stop flag.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Batches posted by the readers.
#[derive(Debug)]
pub enum ReaderEvent {
    /// Raw OSC reply datagrams from OUT, in ring order.
    Replies(Vec<Vec<u8>>),
    /// Decoded diagnostics lines from DEBUG, trailing newline trimmed.
    DebugLines(Vec<String>),
    /// `count` records were lost on `ring` (sequence discontinuity).
    Dropped { ring: RingId, count: u32 },
}

/// Join handles plus the shared stop flag.
pub struct ReaderHandles {
    stop: Arc<AtomicBool>,
    reply: Option<JoinHandle<()>>,
    debug: Option<JoinHandle<()>>,
}

impl ReaderHandles {
    /// Signal both readers and join them.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(h) = self.reply.take() {
            let _ = h.join();
        }
        if let Some(h) = self.debug.take() {
            let _ = h.join();
        }
    }
}

/// Spawn the two reader workers.
pub fn spawn_readers(
    region: Arc<SharedRegion>,
    events: Sender<ReaderEvent>,
) -> ReaderHandles {
    let stop = Arc::new(AtomicBool::new(false));

    let reply = {
        let region = Arc::clone(&region);
        let events = events.clone();
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("reply-reader".into())
            .spawn(move || reader_loop(region, events, stop, RingId::Out))
            .expect("failed to spawn reply-reader thread")
    };
    let debug = {
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("debug-reader".into())
            .spawn(move || reader_loop(region, events, stop, RingId::Debug))
            .expect("failed to spawn debug-reader thread")
    };

    ReaderHandles {
        stop,
        reply: Some(reply),
        debug: Some(debug),
    }
}

fn reader_loop(
    region: Arc<SharedRegion>,
    events: Sender<ReaderEvent>,
    stop: Arc<AtomicBool>,
    id: RingId,
) {
    let mut next_seq: Option<u32> = None;

    while !stop.load(Ordering::Acquire) {
        // Drain first: records may predate this wait round.
        let ring = region.ring(id);
        let mut payloads: Vec<Vec<u8>> = Vec::new();
        let mut dropped = 0u32;
        let mut corrupted = 0u32;
        ring.drain(
            256,
            |info| {
                if let Some(expected) = next_seq {
                    let gap = info.seq.wrapping_sub(expected);
                    if gap != 0 {
                        dropped += gap;
                    }
                }
                next_seq = Some(info.seq.wrapping_add(1));
                payloads.push(ring.payload(&info));
            },
            |_| corrupted += 1,
        );

        if corrupted > 0 {
            log::warn!(target: "engine::readers", "{corrupted} corrupt records skipped in {id:?}");
        }
        if dropped > 0 {
            let _ = events.send(ReaderEvent::Dropped { ring: id, count: dropped });
        }
        if payloads.is_empty() {
            // Nothing pending: park until the head moves again.
            let head = region.control(id.head_word()).load(Ordering::Acquire);
            let _ = region.wait(id.head_word(), head, WAIT_SLICE);
            continue;
        }
        let event = match id {
            RingId::Debug => ReaderEvent::DebugLines(
                payloads.iter().map(|p| decode_debug_line(p)).collect(),
            ),
            _ => ReaderEvent::Replies(payloads),
        };
        if events.send(event).is_err() {
            break; // facade is gone
        }
    }
}

/// UTF-8 decode a DEBUG payload, trimming ring padding and one trailing
/// newline.
pub fn decode_debug_line(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    let trimmed = text.trim_end_matches('\0');
    trimmed.strip_suffix('\n').unwrap_or(trimmed).to_string()
}
