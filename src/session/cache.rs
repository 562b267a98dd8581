//! Ordered byte-chunk queue
//!
//! Holds data that arrives before the far leg is ready, and the write
//! backlog of every socket a session feeds.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::collections::vec_deque::IntoIter;

/// FIFO of byte chunks
#[derive(Debug, Default)]
pub struct BufferQueue {
    chunks: VecDeque<Bytes>,
    bytes: usize,
}

impl BufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk; empty chunks are skipped
    pub fn push(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Take every queued chunk in arrival order, leaving the queue empty
    pub fn drain(&mut self) -> IntoIter<Bytes> {
        self.bytes = 0;
        std::mem::take(&mut self.chunks).into_iter()
    }

    /// Oldest chunk still (partly) queued
    pub fn front(&self) -> Option<&Bytes> {
        self.chunks.front()
    }

    /// Drop `n` bytes from the front of the queue
    pub fn consume(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let step = n.min(front.len());
            front.advance(step);
            self.bytes -= step;
            n -= step;
            if front.is_empty() {
                self.chunks.pop_front();
            }
        }
    }

    /// Forget everything queued
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }

    /// Number of queued chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total queued payload bytes
    pub fn total_bytes(&self) -> usize {
        self.bytes
    }
}
