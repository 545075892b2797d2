//! The IN-ring writer lock.
//!
//! All client-side writers of the IN ring serialise through one 32-bit
//! lock word acquired by compare-and-swap. Main-thread callers never
//! block (spin limit 0, one attempt); worker callers may wait on the lock
//! word in bounded slices. The lock holder frames the record, publishes
//! the new head with a release store, wakes one head waiter, then
//! releases the lock and wakes one lock waiter.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use scsonic_types::{Error, Result, SourceId};

use crate::control::ControlWord;
use crate::region::{RingId, SharedRegion, WaitOutcome};

/// One bounded wait slice on the lock word.
pub const LOCK_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Cumulative bound on blocking lock acquisition. A defensive upper
/// bound against pathological deadlock.
pub const LOCK_WAIT_TOTAL: Duration = Duration::from_secs(10);

/// Per-call write behaviour.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// Extra CAS attempts after the first (main thread: 0).
    pub spin: u32,
    /// Whether the caller may wait on the lock word.
    pub blocking: bool,
}

impl WriteOptions {
    /// Main-controller contract: one attempt, never block.
    pub fn main_thread() -> Self {
        Self { spin: 0, blocking: false }
    }

    /// Worker contract: short spin, then bounded waits.
    pub fn worker() -> Self {
        Self { spin: 16, blocking: true }
    }
}

/// Lock-protected writer for the IN ring.
pub struct RingWriter {
    region: Arc<SharedRegion>,
}

impl RingWriter {
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self { region }
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Largest payload the IN ring can hold.
    pub fn max_payload(&self) -> usize {
        self.region.ring(RingId::In).max_payload()
    }

    /// Current consumer tail, for space waits.
    pub fn in_tail(&self) -> u32 {
        self.region.control(ControlWord::InTail).load(Ordering::Acquire)
    }

    /// Block until the engine consumes past `seen_tail` (or timeout).
    pub fn wait_for_space(&self, seen_tail: u32, timeout: Duration) -> WaitOutcome {
        self.region.wait(ControlWord::InTail, seen_tail, timeout)
    }

    /// Frame `payload` into the IN ring.
    pub fn write(&self, payload: &[u8], source: SourceId, opts: WriteOptions) -> Result<()> {
        self.acquire(opts)?;
        let result = self.locked_write(payload, source);
        self.release();
        result
    }

    fn acquire(&self, opts: WriteOptions) -> Result<()> {
        let lock = self.region.control(ControlWord::Lock);

        for _ in 0..=opts.spin {
            if lock
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
            std::hint::spin_loop();
        }

        if !opts.blocking {
            return Err(Error::LockContended);
        }

        let start = Instant::now();
        loop {
            self.region.wait(ControlWord::Lock, 1, LOCK_WAIT_SLICE);
            if lock
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
            if start.elapsed() >= LOCK_WAIT_TOTAL {
                log::error!(target: "shm::writer", "lock wait exhausted after {:?}", start.elapsed());
                return Err(Error::LockTimeout);
            }
        }
    }

    fn locked_write(&self, payload: &[u8], source: SourceId) -> Result<()> {
        let ring = self.region.ring(RingId::In);
        let head_w = self.region.control(ControlWord::InHead);
        let tail_w = self.region.control(ControlWord::InTail);
        let seq_w = self.region.control(ControlWord::InSeq);

        let head = head_w.load(Ordering::Relaxed);
        let tail = tail_w.load(Ordering::Acquire);
        let seq = seq_w.load(Ordering::Relaxed);

        let new_head = ring.try_write(head, tail, payload, seq, source)?;
        seq_w.store(seq.wrapping_add(1), Ordering::Relaxed);
        head_w.store(new_head, Ordering::Release);
        self.region.notify_one(ControlWord::InHead);
        Ok(())
    }

    fn release(&self) {
        self.region
            .control(ControlWord::Lock)
            .store(0, Ordering::Release);
        self.region.notify_one(ControlWord::Lock);
    }
}
