//! Fixed pool of batch buffers recycled over a channel.
//!
//! The audio thread takes a buffer with `try_recv` (never blocking, never
//! allocating), fills it, and ships it to the dispatcher inside an
//! [`crate::EngineBatch`]. Dropping the buffer on the consumer side sends
//! it home. An exhausted pool means the consumer is behind; the caller
//! drops the batch and counts it.

use std::ops::{Deref, DerefMut};

use crossbeam_channel::{bounded, Receiver, Sender};

/// A pool of `count` buffers of `capacity` bytes each.
pub struct BufferPool {
    free_rx: Receiver<Vec<u8>>,
    free_tx: Sender<Vec<u8>>,
}

impl BufferPool {
    pub fn new(count: usize, capacity: usize) -> Self {
        let (free_tx, free_rx) = bounded(count);
        for _ in 0..count {
            free_tx
                .send(Vec::with_capacity(capacity))
                .expect("pool channel sized to count");
        }
        Self { free_rx, free_tx }
    }

    /// Take a cleared buffer, or `None` if the pool is exhausted.
    pub fn take(&self) -> Option<PooledBuffer> {
        self.free_rx.try_recv().ok().map(|mut buf| {
            buf.clear();
            PooledBuffer {
                buf: Some(buf),
                home: self.free_tx.clone(),
            }
        })
    }

    /// Buffers currently at home.
    pub fn free_count(&self) -> usize {
        self.free_rx.len()
    }
}

/// A buffer on loan from a [`BufferPool`]; returns home on drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    home: Sender<Vec<u8>>,
}

impl PooledBuffer {
    /// Append a length-prefixed record (u32 little-endian length, then
    /// the bytes). The batch framing used between the audio thread and
    /// the dispatcher.
    pub fn push_record(&mut self, bytes: &[u8]) {
        let buf = self.buf.as_mut().expect("buffer present until drop");
        buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(bytes);
    }

    /// Iterate the length-prefixed records back out.
    pub fn records(&self) -> RecordIter<'_> {
        RecordIter {
            data: self.buf.as_deref().expect("buffer present until drop"),
            pos: 0,
        }
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            // If the pool is gone the buffer just deallocates.
            let _ = self.home.send(buf);
        }
    }
}

/// Iterator over length-prefixed records in a batch buffer.
pub struct RecordIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.pos + 4 > self.data.len() {
            return None;
        }
        let len = u32::from_le_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]) as usize;
        let start = self.pos + 4;
        if start + len > self.data.len() {
            return None;
        }
        self.pos = start + len;
        Some(&self.data[start..start + len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_fill_return_cycle() {
        let pool = BufferPool::new(2, 64);
        assert_eq!(pool.free_count(), 2);

        let mut a = pool.take().unwrap();
        a.push_record(b"one");
        let _b = pool.take().unwrap();
        assert!(pool.take().is_none(), "pool of two is exhausted");

        drop(a);
        assert_eq!(pool.free_count(), 1);
        // Returned buffers come back cleared.
        let c = pool.take().unwrap();
        assert!(c.is_empty());
    }

    #[test]
    fn records_roundtrip() {
        let pool = BufferPool::new(1, 64);
        let mut buf = pool.take().unwrap();
        buf.push_record(b"/status.reply");
        buf.push_record(b"");
        buf.push_record(b"xyz");
        let records: Vec<&[u8]> = buf.records().collect();
        assert_eq!(records, vec![&b"/status.reply"[..], &b""[..], &b"xyz"[..]]);
    }

    #[test]
    fn truncated_batch_stops_cleanly() {
        let pool = BufferPool::new(1, 64);
        let mut buf = pool.take().unwrap();
        buf.push_record(b"abc");
        buf.extend_from_slice(&10u32.to_le_bytes()); // length with no body
        let records: Vec<&[u8]> = buf.records().collect();
        assert_eq!(records, vec![&b"abc"[..]]);
    }
}
