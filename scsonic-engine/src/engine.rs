//! The engine's exports as a trait.
//!
//! The synthesis engine is a black box: it consumes OSC from the IN ring,
//! produces audio into its output buses, and emits replies, diagnostics,
//! metrics, and the node-tree mirror. `SynthEngine` captures exactly the
//! exports the audio-thread processor consumes, so the processor never
//! hard-codes anything about the engine build.

use scsonic_shm::{LayoutDescriptor, SharedRegion};
use scsonic_types::{Result, WorldOptions};

/// Object-safe abstraction over the engine binary's exports.
pub trait SynthEngine: Send {
    /// Identification string (name/version) for logs and the setup event.
    fn id_string(&self) -> &str;

    /// The layout descriptor: every offset and size constant of the
    /// shared region, fixed at engine build time.
    fn layout(&self) -> LayoutDescriptor;

    /// Write world options into the region and prepare for processing at
    /// `sample_rate`.
    fn init(
        &mut self,
        region: &SharedRegion,
        sample_rate: f64,
        options: &WorldOptions,
    ) -> Result<()>;

    /// One audio block: consume IN, synthesize `block_frames` frames into
    /// the output buses, emit replies/debug/metrics/tree. `clock_seconds`
    /// is the host audio clock.
    fn process(
        &mut self,
        region: &SharedRegion,
        clock_seconds: f64,
        out_channels: usize,
        in_channels: usize,
    );

    /// Drop everything in the engine's internal bundle scheduler.
    fn clear_scheduler(&mut self, region: &SharedRegion);

    /// Current input-bus byte offset. May move after a re-init.
    fn input_bus_offset(&self) -> usize;

    /// Current output-bus byte offset. May move after a re-init.
    fn output_bus_offset(&self) -> usize;
}
