//! Callback-cost telemetry, allocation-free.
//!
//! A fixed ring of duration samples collected inside the audio callback.
//! The worst observed cost of the current window is published into the
//! engine metrics block so both modes surface it the same way.

use std::time::Duration;

use scsonic_shm::SharedRegion;
use scsonic_types::metrics::MetricId;

/// Samples retained per window.
const WINDOW: usize = 256;

pub struct CallbackTelemetry {
    samples_us: [u32; WINDOW],
    idx: usize,
    filled: usize,
    window_max_us: u32,
    /// Callback budget derived from block size and sample rate.
    budget_us: u32,
    overruns: u64,
}

impl CallbackTelemetry {
    /// `block_frames / sample_rate` is the hard budget per callback.
    pub fn new(block_frames: usize, sample_rate: f64) -> Self {
        let budget_us = (block_frames as f64 / sample_rate * 1e6) as u32;
        Self {
            samples_us: [0; WINDOW],
            idx: 0,
            filled: 0,
            window_max_us: 0,
            budget_us,
            overruns: 0,
        }
    }

    /// Record one callback's cost.
    #[inline]
    pub fn record(&mut self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u32::MAX as u128) as u32;
        self.samples_us[self.idx] = us;
        self.idx = (self.idx + 1) % WINDOW;
        if self.filled < WINDOW {
            self.filled += 1;
        }
        if us > self.window_max_us {
            self.window_max_us = us;
        }
        if us > self.budget_us {
            self.overruns += 1;
        }
    }

    /// Callbacks that blew the budget since construction.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Publish the window max into the metrics block and start a new
    /// window. Called from the audio thread on the snapshot cadence.
    pub fn publish(&mut self, region: &SharedRegion) {
        let offset = region.layout().metrics_offset + (MetricId::CallbackMaxUs as usize) * 4;
        region
            .atomic_at(offset)
            .store(self.window_max_us, std::sync::atomic::Ordering::Relaxed);
        self.window_max_us = 0;
    }

    /// Mean cost over the retained window, microseconds.
    pub fn mean_us(&self) -> u32 {
        if self.filled == 0 {
            return 0;
        }
        let sum: u64 = self.samples_us[..self.filled].iter().map(|&x| x as u64).sum();
        (sum / self.filled as u64) as u32
    }
}
