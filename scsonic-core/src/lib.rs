//! # scsonic-core
//!
//! The client-facing facade over the transport: session lifecycle,
//! event subscription, send/sendRaw routing with the direct-write fast
//! path, the sync fence, purge, buffer-command rewriting over the sample
//! pool, and transferable `OscChannel` handles.

pub mod channel;
pub mod events;
pub mod rewrite;
pub mod send;
pub mod session;

pub use channel::{ChannelDescriptor, OscChannel};
pub use events::{EventHub, Subscription};
pub use rewrite::{blocked_hint, SamplePool};
pub use send::MAX_BUNDLE_MESSAGE_BYTES;
pub use session::{SendMeta, Session, SessionState, SYNC_TIMEOUT};

pub use scsonic_types::{
    Config, Error, Event, EventKind, Mode, NodeTree, OscArg, Result, StateSnapshot, WorldOptions,
};
