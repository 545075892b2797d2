//! The shared byte region and its wait/notify sites.
//!
//! One aligned allocation holds the engine heap, the three rings, the
//! control block, metrics, the tree mirror, timing cells, and the sample
//! pool. Control words are accessed as `AtomicU32` views into the
//! allocation; bulk payload bytes move through raw copies ordered by the
//! ring protocol (payload written before the head's release store, read
//! after an acquire load).
//!
//! Blocking waits mirror the shared-memory wait primitive: each control
//! word has a Mutex+Condvar site, writers notify after publishing, and
//! waiters recheck the word under the site lock so wakeups cannot be lost.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use scsonic_types::Result;

use crate::control::{ControlWord, CONTROL_WORD_COUNT};
use crate::layout::{LayoutDescriptor, RegionSpan};
use crate::ring::RingView;

/// Which of the three rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingId {
    /// Client → engine OSC.
    In,
    /// Engine → client OSC replies.
    Out,
    /// Engine → client diagnostics text.
    Debug,
}

impl RingId {
    pub fn head_word(self) -> ControlWord {
        match self {
            RingId::In => ControlWord::InHead,
            RingId::Out => ControlWord::OutHead,
            RingId::Debug => ControlWord::DebugHead,
        }
    }

    pub fn tail_word(self) -> ControlWord {
        match self {
            RingId::In => ControlWord::InTail,
            RingId::Out => ControlWord::OutTail,
            RingId::Debug => ControlWord::DebugTail,
        }
    }

    pub fn seq_word(self) -> ControlWord {
        match self {
            RingId::In => ControlWord::InSeq,
            RingId::Out => ControlWord::OutSeq,
            RingId::Debug => ControlWord::DebugSeq,
        }
    }
}

/// Result of a bounded wait on a control word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The word no longer holds the expected value.
    Changed,
    /// The timeout elapsed with the word unchanged.
    TimedOut,
}

struct WaitSite {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitSite {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }
}

/// The shared coordination region.
pub struct SharedRegion {
    words: Box<[UnsafeCell<u32>]>,
    layout: LayoutDescriptor,
    waits: [WaitSite; CONTROL_WORD_COUNT],
}

// Safety: concurrent access is coordinated entirely through the atomic
// control words; bulk byte ranges have a single writer at a time under
// the ring protocol (head/tail ownership plus the writer lock).
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocate a zeroed region for a validated layout.
    pub fn new(layout: LayoutDescriptor) -> Result<Self> {
        layout.validate()?;
        let word_count = layout.region_bytes / 4;
        let words: Box<[UnsafeCell<u32>]> =
            (0..word_count).map(|_| UnsafeCell::new(0)).collect();
        Ok(Self {
            words,
            layout,
            waits: std::array::from_fn(|_| WaitSite::new()),
        })
    }

    pub fn layout(&self) -> &LayoutDescriptor {
        &self.layout
    }

    fn base(&self) -> *mut u8 {
        self.words.as_ptr() as *mut u8
    }

    /// Atomic view of a 4-aligned u32 cell anywhere in the region.
    pub fn atomic_at(&self, byte_offset: usize) -> &AtomicU32 {
        assert!(byte_offset % 4 == 0, "atomic access must be 4-aligned");
        assert!(byte_offset + 4 <= self.layout.region_bytes);
        // Safety: in-bounds, aligned, and AtomicU32 has the same layout
        // as the backing u32 cell.
        unsafe { &*(self.base().add(byte_offset) as *const AtomicU32) }
    }

    /// Atomic view of a control word.
    pub fn control(&self, word: ControlWord) -> &AtomicU32 {
        self.atomic_at(word.byte_offset(self.layout.control_offset))
    }

    /// Copy bytes into the region. The caller must own the destination
    /// range under the ring protocol (or be the sole writer of the block).
    pub fn copy_in(&self, byte_offset: usize, src: &[u8]) {
        assert!(byte_offset + src.len() <= self.layout.region_bytes);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base().add(byte_offset), src.len());
        }
    }

    /// Copy bytes out of the region.
    pub fn copy_out(&self, byte_offset: usize, dst: &mut [u8]) {
        assert!(byte_offset + dst.len() <= self.layout.region_bytes);
        unsafe {
            std::ptr::copy_nonoverlapping(self.base().add(byte_offset), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Fill a range with a byte value.
    pub fn fill(&self, span: RegionSpan, value: u8) {
        assert!(span.end() <= self.layout.region_bytes);
        unsafe {
            std::ptr::write_bytes(self.base().add(span.offset), value, span.size);
        }
    }

    /// Copy f32 samples into the region (audio bus transfers).
    pub fn copy_f32_in(&self, byte_offset: usize, src: &[f32]) {
        assert!(byte_offset + src.len() * 4 <= self.layout.region_bytes);
        // Safety: same bounds discipline as copy_in; f32 has no invalid
        // bit patterns.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr() as *const u8,
                self.base().add(byte_offset),
                src.len() * 4,
            );
        }
    }

    /// Copy f32 samples out of the region.
    pub fn copy_f32_out(&self, byte_offset: usize, dst: &mut [f32]) {
        assert!(byte_offset + dst.len() * 4 <= self.layout.region_bytes);
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base().add(byte_offset),
                dst.as_mut_ptr() as *mut u8,
                dst.len() * 4,
            );
        }
    }

    /// Read the f64 cell at `byte_offset` (little-endian).
    pub fn read_f64(&self, byte_offset: usize) -> f64 {
        let mut bytes = [0u8; 8];
        self.copy_out(byte_offset, &mut bytes);
        f64::from_le_bytes(bytes)
    }

    /// Write the f64 cell at `byte_offset` (little-endian).
    pub fn write_f64(&self, byte_offset: usize, value: f64) {
        self.copy_in(byte_offset, &value.to_le_bytes());
    }

    /// Framed-record view of one ring.
    pub fn ring(&self, id: RingId) -> RingView<'_> {
        let spec = match id {
            RingId::In => self.layout.in_ring,
            RingId::Out => self.layout.out_ring,
            RingId::Debug => self.layout.debug_ring,
        };
        RingView::new(self, spec, id)
    }

    /// Block until `word` no longer holds `expected`, or until `timeout`.
    pub fn wait(&self, word: ControlWord, expected: u32, timeout: Duration) -> WaitOutcome {
        let site = &self.waits[word as usize];
        let atomic = self.control(word);
        let deadline = Instant::now() + timeout;

        let mut guard = site.lock.lock().unwrap();
        loop {
            if atomic.load(Ordering::Acquire) != expected {
                return WaitOutcome::Changed;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            let (g, result) = site.cond.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
            if result.timed_out() && atomic.load(Ordering::Acquire) == expected {
                return WaitOutcome::TimedOut;
            }
        }
    }

    /// Wake one waiter on a control word. Callers publish the new value
    /// first; the site lock orders the notification against the recheck.
    pub fn notify_one(&self, word: ControlWord) {
        let site = &self.waits[word as usize];
        let _guard = site.lock.lock().unwrap();
        site.cond.notify_one();
    }

    /// Wake all waiters on a control word.
    pub fn notify_all(&self, word: ControlWord) {
        let site = &self.waits[word as usize];
        let _guard = site.lock.lock().unwrap();
        site.cond.notify_all();
    }
}
