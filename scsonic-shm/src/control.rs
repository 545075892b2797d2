//! The 48-byte control block: ring pointers, sequence counters, status
//! flags, the writer lock, and the logging tail.

/// Size of the control block in bytes (12 u32 words).
pub const CONTROL_BYTES: usize = 48;

/// Word index of each control field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ControlWord {
    /// Next write position in the IN ring.
    InHead = 0,
    /// Next read position in the IN ring. Written only by the engine.
    InTail = 1,
    OutHead = 2,
    OutTail = 3,
    DebugHead = 4,
    DebugTail = 5,
    /// Next record sequence number per ring.
    InSeq = 6,
    OutSeq = 7,
    DebugSeq = 8,
    /// Status flag word (see [`status`]).
    Status = 9,
    /// Writer lock: 0 = free, 1 = held.
    Lock = 10,
    /// Secondary IN tail used by the audio thread to snapshot the stream
    /// for logging without disturbing the engine's consumer tail.
    /// Message-passing mode only.
    InLogTail = 11,
}

pub const CONTROL_WORD_COUNT: usize = 12;

impl ControlWord {
    /// Absolute byte offset of this word given the control block offset.
    pub fn byte_offset(self, control_offset: usize) -> usize {
        control_offset + (self as usize) * 4
    }
}

/// Bits of the status flag word.
pub mod status {
    /// A writer found the IN ring full.
    pub const BUFFER_FULL: u32 = 1 << 0;
    /// The engine detected a reader falling behind.
    pub const OVERRUN: u32 = 1 << 1;
    /// The engine hit a fatal internal error.
    pub const ENGINE_ERROR: u32 = 1 << 2;
    /// The sample pool can no longer satisfy contiguous allocations.
    pub const FRAGMENTED: u32 = 1 << 3;

    /// Bits cleared after each status event is posted. `FRAGMENTED`
    /// persists until the pool is reset.
    pub const NON_STICKY: u32 = BUFFER_FULL | OVERRUN | ENGINE_ERROR;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_holds_all_words() {
        assert_eq!(CONTROL_WORD_COUNT * 4, CONTROL_BYTES);
        assert!((ControlWord::InLogTail as usize) < CONTROL_WORD_COUNT);
    }

    #[test]
    fn byte_offsets_are_word_strided() {
        assert_eq!(ControlWord::InHead.byte_offset(100), 100);
        assert_eq!(ControlWord::Lock.byte_offset(100), 140);
    }
}
