//! Bounded byte ring holding the delayed reference stream.
//!
//! The ring is a fixed-capacity window over the most recent reference
//! blocks. Writes always succeed: once the window is full the oldest
//! bytes are overwritten and become unreadable. Reads are bounds-checked
//! and FIFO. A single owner mutates the ring; there is no internal
//! locking.

use thiserror::Error;
use tracing::trace;

/// Size of one sample on the wire (signed 32-bit little-endian PCM).
pub const BYTES_PER_SAMPLE: usize = 4;

#[derive(Error, Debug)]
pub enum RingBufferError {
    #[error("ring underflow: requested {requested} bytes, {available} available")]
    Underflow { requested: usize, available: usize },

    #[error("invalid ring capacity: {0}")]
    InvalidCapacity(usize),
}

/// Fixed-capacity circular byte store with overwrite-on-full eviction.
pub struct RingBuffer {
    data: Vec<u8>,
    head: usize,
    tail: usize,
    count: usize,
}

impl RingBuffer {
    /// Create a ring with the given capacity in bytes.
    ///
    /// The capacity must be a nonzero multiple of [`BYTES_PER_SAMPLE`] so
    /// that sample lanes never straddle the storage boundary.
    pub fn new(capacity: usize) -> Result<Self, RingBufferError> {
        if capacity == 0 || capacity % BYTES_PER_SAMPLE != 0 {
            return Err(RingBufferError::InvalidCapacity(capacity));
        }

        Ok(Self {
            data: vec![0; capacity],
            head: 0,
            tail: 0,
            count: 0,
        })
    }

    /// Append bytes at the tail, wrapping at the end of storage.
    ///
    /// A wrapping write is split into two copies. Writing more than the
    /// remaining free space overwrites the oldest unread bytes; a single
    /// write larger than the whole capacity keeps only its newest
    /// `capacity` bytes.
    pub fn enqueue(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        let capacity = self.data.len();
        let src = if bytes.len() > capacity {
            &bytes[bytes.len() - capacity..]
        } else {
            bytes
        };

        let len = src.len();
        let first = (capacity - self.tail).min(len);
        self.data[self.tail..self.tail + first].copy_from_slice(&src[..first]);
        if len > first {
            self.data[..len - first].copy_from_slice(&src[first..]);
        }
        self.tail = (self.tail + len) % capacity;

        if self.count + bytes.len() > capacity {
            // Oldest bytes were overwritten; the read side resumes at the
            // oldest surviving byte, which now sits at the new tail.
            self.head = self.tail;
            self.count = capacity;
            trace!(written = bytes.len(), "ring overwrote oldest data");
        } else {
            self.count += len;
        }
    }

    /// Remove and return `n` bytes from the head, in FIFO order.
    pub fn dequeue(&mut self, n: usize) -> Result<Vec<u8>, RingBufferError> {
        if n > self.count {
            return Err(RingBufferError::Underflow {
                requested: n,
                available: self.count,
            });
        }

        let capacity = self.data.len();
        let mut out = vec![0; n];
        let first = (capacity - self.head).min(n);
        out[..first].copy_from_slice(&self.data[self.head..self.head + first]);
        if n > first {
            out[first..].copy_from_slice(&self.data[..n - first]);
        }
        self.head = (self.head + n) % capacity;
        self.count -= n;

        Ok(out)
    }

    /// Read the `index`-th 4-byte sample of the logical content, counted
    /// from the head. The caller keeps `index` below [`Self::sample_len`].
    pub fn sample_at(&self, index: usize) -> i32 {
        let capacity = self.data.len();
        let base = (self.head + index * BYTES_PER_SAMPLE) % capacity;

        let mut word = [0u8; BYTES_PER_SAMPLE];
        for (k, byte) in word.iter_mut().enumerate() {
            *byte = self.data[(base + k) % capacity];
        }
        i32::from_le_bytes(word)
    }

    /// Number of bytes currently held.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Number of whole samples currently held.
    pub fn sample_len(&self) -> usize {
        self.count / BYTES_PER_SAMPLE
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Drop all content without releasing storage.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }
}
