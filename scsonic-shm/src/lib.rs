//! # scsonic-shm
//!
//! The shared coordination region between client code and the synthesis
//! engine: three framed byte rings (IN client→engine, OUT engine→client,
//! DEBUG engine→client), a 48-byte control block of atomic words, the
//! metrics block, the node-tree mirror, timing cells, and the sample-pool
//! arena. Every offset comes from the engine's layout export; nothing in
//! this crate hard-codes positions.

pub mod control;
pub mod layout;
pub mod region;
pub mod ring;
pub mod writer;

pub use control::{status, ControlWord, CONTROL_BYTES};
pub use layout::{
    LayoutDescriptor, RegionSpan, PADDING_MAGIC, RECORD_ALIGN, RECORD_HEADER_BYTES, RECORD_MAGIC,
};
pub use region::{RingId, SharedRegion, WaitOutcome};
pub use ring::{available, RecordInfo, RingView};
pub use writer::{RingWriter, WriteOptions};
