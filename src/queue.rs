//! Byte queue over a ring of chunks.
//!
//! Chunks are pushed in arrival order and consumed from the front. `shift`
//! removes exactly `n` bytes no matter how they are spread over the pushed
//! chunks; a request that lies inside the front chunk is returned as a
//! zero-copy slice of it.
//!
//! # Invariants
//! - `slots.len()` is a power of two and `count <= slots.len()`.
//! - Slots in the logical range `[head, head + count)` (wrapping by mask)
//!   are `Some` and hold non-empty chunks; all other slots are `None`.
//! - `bytes_len` is the sum of the lengths of the held chunks.

use std::borrow::Cow;

use bytes::{Bytes, BytesMut};

use crate::error::{TarError, TarResult};

const INITIAL_SLOTS: usize = 16;

/// FIFO byte buffer made of owned chunks
#[derive(Debug)]
pub struct ByteQueue {
    slots: Vec<Option<Bytes>>,
    head: usize,
    count: usize,
    bytes_len: usize,
    inserted_len: u64,
}

impl Default for ByteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteQueue {
    pub fn new() -> Self {
        Self {
            slots: vec![None; INITIAL_SLOTS],
            head: 0,
            count: 0,
            bytes_len: 0,
            inserted_len: 0,
        }
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.bytes_len
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_len == 0
    }

    /// Bytes pushed over the lifetime of the queue
    pub fn inserted_len(&self) -> u64 {
        self.inserted_len
    }

    /// Number of chunks currently held
    pub fn chunk_count(&self) -> usize {
        self.count
    }

    /// Append a chunk. Empty chunks are dropped.
    pub fn push(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        if self.count == self.slots.len() {
            self.grow();
        }
        let tail = (self.head + self.count) & self.mask();
        self.bytes_len += chunk.len();
        self.inserted_len += chunk.len() as u64;
        self.slots[tail] = Some(chunk);
        self.count += 1;
    }

    /// Remove and return exactly `n` bytes
    pub fn shift(&mut self, n: usize) -> TarResult<Bytes> {
        self.ensure(n)?;
        if self.front().is_some_and(|front| front.len() >= n) {
            let mut piece = Bytes::new();
            self.consume(n, |p| piece = p);
            return Ok(piece);
        }
        let mut out = BytesMut::with_capacity(n);
        self.consume(n, |p| out.extend_from_slice(&p));
        Ok(out.freeze())
    }

    /// Remove `n` bytes, appending them to `out`
    pub fn shift_into(&mut self, n: usize, out: &mut Vec<u8>) -> TarResult<()> {
        self.ensure(n)?;
        out.reserve(n);
        self.consume(n, |p| out.extend_from_slice(&p));
        Ok(())
    }

    /// Remove and drop `n` bytes
    pub fn skip(&mut self, n: usize) -> TarResult<()> {
        self.ensure(n)?;
        self.consume(n, drop);
        Ok(())
    }

    /// Read the first `n` bytes without consuming them. Borrows when they
    /// lie inside the front chunk, copies otherwise.
    pub fn peek(&self, n: usize) -> TarResult<Cow<'_, [u8]>> {
        self.ensure(n)?;
        if let Some(front) = self.front().filter(|front| front.len() >= n) {
            return Ok(Cow::Borrowed(&front[..n]));
        }
        let mut out = Vec::with_capacity(n);
        for i in 0..self.count {
            let Some(chunk) = &self.slots[(self.head + i) & self.mask()] else {
                break;
            };
            let take = (n - out.len()).min(chunk.len());
            out.extend_from_slice(&chunk[..take]);
            if out.len() == n {
                break;
            }
        }
        Ok(Cow::Owned(out))
    }

    fn ensure(&self, n: usize) -> TarResult<()> {
        if n > self.bytes_len {
            return Err(TarError::InsufficientBytes {
                requested: n,
                available: self.bytes_len,
            });
        }
        Ok(())
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    fn front(&self) -> Option<&Bytes> {
        if self.count == 0 {
            return None;
        }
        self.slots[self.head].as_ref()
    }

    /// Hand the next `n` bytes to `sink` chunk by chunk. Caller checks `n`.
    fn consume(&mut self, n: usize, mut sink: impl FnMut(Bytes)) {
        let mask = self.mask();
        let mut remaining = n;
        while remaining > 0 {
            let Some(front) = self.slots[self.head].as_mut() else {
                break;
            };
            let piece = if front.len() <= remaining {
                let piece = std::mem::take(front);
                self.slots[self.head] = None;
                self.head = (self.head + 1) & mask;
                self.count -= 1;
                piece
            } else {
                front.split_to(remaining)
            };
            remaining -= piece.len();
            self.bytes_len -= piece.len();
            sink(piece);
        }
    }

    /// Double the slot ring, moving the held chunks to the front
    fn grow(&mut self) {
        let mask = self.mask();
        let capacity = self.slots.len() * 2;
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..self.count {
            slots.push(self.slots[(self.head + i) & mask].take());
        }
        slots.resize(capacity, None);
        self.slots = slots;
        self.head = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn queue_of(chunks: &[&[u8]]) -> ByteQueue {
        let mut queue = ByteQueue::new();
        for chunk in chunks {
            queue.push(chunk.to_vec());
        }
        queue
    }

    #[test]
    fn shift_within_one_chunk() {
        let mut queue = queue_of(&[b"hello world"]);
        assert_eq!(queue.shift(5).unwrap(), &b"hello"[..]);
        assert_eq!(queue.len(), 6);
        assert_eq!(queue.chunk_count(), 1);
        assert_eq!(queue.shift(6).unwrap(), &b" world"[..]);
        assert!(queue.is_empty());
        assert_eq!(queue.chunk_count(), 0);
    }

    #[test]
    fn shift_across_chunks() {
        let mut queue = queue_of(&[b"ab", b"cde", b"f", b"ghij"]);
        assert_eq!(queue.shift(4).unwrap(), &b"abcd"[..]);
        assert_eq!(queue.shift(0).unwrap(), &b""[..]);
        assert_eq!(queue.shift(5).unwrap(), &b"efghi"[..]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.inserted_len(), 10);
    }

    #[test]
    fn peek_does_not_consume() {
        let queue = queue_of(&[b"abc", b"def"]);
        assert!(matches!(queue.peek(2).unwrap(), Cow::Borrowed(b"ab")));
        assert_eq!(&*queue.peek(5).unwrap(), b"abcde");
        assert_eq!(queue.len(), 6);
    }

    #[test]
    fn insufficient_bytes() {
        let mut queue = queue_of(&[b"abc"]);
        assert!(matches!(
            queue.shift(4),
            Err(TarError::InsufficientBytes { requested: 4, available: 3 })
        ));
        assert!(queue.peek(4).is_err());
        assert!(queue.skip(4).is_err());
        // failed requests leave the queue untouched
        assert_eq!(queue.shift(3).unwrap(), &b"abc"[..]);
    }

    #[test]
    fn grows_past_initial_slots() {
        let mut queue = ByteQueue::new();
        // wrap the ring before it has to grow
        for _ in 0..10 {
            queue.push(vec![0u8]);
        }
        queue.skip(10).unwrap();
        for i in 0..100u8 {
            queue.push(vec![i, i]);
        }
        assert_eq!(queue.chunk_count(), 100);
        let mut out = Vec::new();
        queue.shift_into(200, &mut out).unwrap();
        let expected: Vec<u8> = (0..100u8).flat_map(|i| [i, i]).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn empty_chunks_are_dropped() {
        let mut queue = ByteQueue::new();
        queue.push(Vec::new());
        assert_eq!(queue.chunk_count(), 0);
        assert!(queue.peek(0).unwrap().is_empty());
    }
}
