//! # scsonic-engine
//!
//! The audio-thread side of the transport: the [`SynthEngine`] trait (the
//! engine's exports as an object-safe abstraction), the allocation-free
//! per-callback processor, the reply/debug reader workers, pooled batch
//! buffers, and a recording test engine that implements enough engine
//! semantics for end-to-end tests.

pub mod engine;
pub mod host;
pub mod pool;
pub mod processor;
pub mod readers;
pub mod telemetry;
pub mod testing;

pub use engine::SynthEngine;
pub use pool::{BufferPool, PooledBuffer};
pub use processor::{
    AudioProcessor, EngineBatch, PostedDatagram, PostedSink, ProcessorCtl, ProcessorLink,
    ProcessorMode, SpaceSignal,
};
pub use readers::{spawn_readers, ReaderEvent, ReaderHandles};
pub use telemetry::CallbackTelemetry;
pub use testing::{TestEngine, TestEngineControl};
