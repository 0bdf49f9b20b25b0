//! # Frame Buffer Pool
//!
//! The fixed set of PCM buffers a session circulates through the engine.
//!
//! ## Design
//!
//! - **Arena + index**: every buffer is an owned allocation tagged with its slot
//! - **Ownership**: a buffer moves into the engine on enqueue and back to the
//!   buffer callback when it is full, so exactly one side can touch it
//! - **Capacity**: fixed at creation; the pool never grows
//! - **Cursor**: the slot the next filled buffer must carry, wrapping modulo N
//!
//! ## Usage
//!
//! ```rust
//! use core_decode::pool::FrameBufferPool;
//!
//! let mut pool = FrameBufferPool::new(4, 2304);
//! let buffers = pool.allocate().unwrap();
//! assert_eq!(buffers.len(), 4);
//!
//! assert_eq!(pool.expected(), 0);
//! pool.next();
//! assert_eq!(pool.expected(), 1);
//! ```

use crate::error::{DecodeError, Result};
use std::fmt;

/// One pool buffer.
pub struct FrameBuffer {
    slot: usize,
    data: Box<[u8]>,
    filled: usize,
}

impl FrameBuffer {
    fn new(slot: usize, size: usize) -> Self {
        Self {
            slot,
            data: vec![0u8; size].into_boxed_slice(),
            filled: 0,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written by the engine since the buffer was last handed out.
    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.data.len()
    }

    /// The filled prefix.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// The unfilled tail, for the engine to write into.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Mark `n` more bytes of the tail as filled.
    pub fn advance(&mut self, n: usize) {
        self.filled = (self.filled + n).min(self.data.len());
    }

    /// Zero the unfilled tail and mark the buffer full.
    pub fn pad_with_silence(&mut self) {
        self.data[self.filled..].fill(0);
        self.filled = self.data.len();
    }

    /// Forget the contents before handing the buffer back to the engine.
    pub fn reset(&mut self) {
        self.filled = 0;
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("slot", &self.slot)
            .field("filled", &self.filled)
            .field("capacity", &self.data.len())
            .finish()
    }
}

/// Fixed pool of `count` buffers of `size` bytes plus the drain cursor.
#[derive(Debug)]
pub struct FrameBufferPool {
    count: usize,
    size: usize,
    cursor: usize,
    allocated: bool,
}

impl FrameBufferPool {
    pub fn new(count: usize, size: usize) -> Self {
        Self {
            count,
            size,
            cursor: 0,
            allocated: false,
        }
    }

    /// Hand out the `count` buffers, slots `0..count`. Only once per pool.
    pub fn allocate(&mut self) -> Result<Vec<FrameBuffer>> {
        if self.allocated {
            return Err(DecodeError::Internal(
                "frame buffer pool already allocated".to_string(),
            ));
        }
        if self.count == 0 || self.size == 0 {
            return Err(DecodeError::InvalidConfig(format!(
                "frame buffer pool needs a non-zero geometry, got {} x {} bytes",
                self.count, self.size
            )));
        }
        self.allocated = true;
        Ok((0..self.count)
            .map(|slot| FrameBuffer::new(slot, self.size))
            .collect())
    }

    /// Slot the next filled buffer must carry.
    pub fn expected(&self) -> usize {
        self.cursor
    }

    /// Advance the cursor by one buffer and return the new expected slot.
    pub fn next(&mut self) -> usize {
        self.cursor = (self.cursor + 1) % self.count;
        self.cursor
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_once() {
        let mut pool = FrameBufferPool::new(4, 2304);
        let buffers = pool.allocate().unwrap();

        let slots: Vec<usize> = buffers.iter().map(FrameBuffer::slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 3]);
        assert!(buffers.iter().all(|b| b.capacity() == 2304 && b.filled() == 0));

        assert!(matches!(pool.allocate(), Err(DecodeError::Internal(_))));
    }

    #[test]
    fn test_zero_geometry_rejected() {
        assert!(FrameBufferPool::new(0, 2304).allocate().is_err());
        assert!(FrameBufferPool::new(4, 0).allocate().is_err());
    }

    #[test]
    fn test_cursor_wraps() {
        let mut pool = FrameBufferPool::new(4, 16);
        let seen: Vec<usize> = (0..9)
            .map(|_| {
                let slot = pool.expected();
                pool.next();
                slot
            })
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn test_fill_and_pad() {
        let mut pool = FrameBufferPool::new(1, 8);
        let mut buffer = pool.allocate().unwrap().remove(0);

        buffer.spare_mut()[..3].copy_from_slice(&[1, 2, 3]);
        buffer.advance(3);
        assert_eq!(buffer.as_slice(), &[1, 2, 3]);
        assert!(!buffer.is_full());

        buffer.spare_mut().fill(9);
        buffer.pad_with_silence();
        assert!(buffer.is_full());
        assert_eq!(buffer.as_slice(), &[1, 2, 3, 0, 0, 0, 0, 0]);

        buffer.reset();
        assert_eq!(buffer.filled(), 0);
        buffer.advance(100);
        assert_eq!(buffer.filled(), 8);
    }
}
