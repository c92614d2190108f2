//! Bounded FIFO of messages awaiting a registered relay connection
//!
//! Messages submitted while the channel is not registered wait here and are
//! flushed in submission order after the next successful registration. When
//! full, the oldest entry is evicted to admit the newest.

use super::protocol::{ClientMessage, PayloadKind};
use std::collections::VecDeque;
use std::time::SystemTime;
use tracing::warn;

/// Default queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Message held for later transmission
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub sequence: u64,
    pub kind: PayloadKind,
    pub message: ClientMessage,
    pub queued_at: SystemTime,
}

impl QueuedMessage {
    pub fn new(sequence: u64, kind: PayloadKind, message: ClientMessage) -> Self {
        Self {
            sequence,
            kind,
            message,
            queued_at: SystemTime::now(),
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub entries: usize,
    pub capacity: usize,
    /// Messages dropped by overflow since creation
    pub evicted_total: u64,
    pub oldest_sequence: Option<u64>,
    pub newest_sequence: Option<u64>,
}

#[derive(Debug)]
pub struct PendingQueue {
    buffer: VecDeque<QueuedMessage>,
    capacity: usize,
    evicted_total: u64,
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            evicted_total: 0,
        }
    }

    /// Append a message, evicting the oldest when full.
    ///
    /// Returns the evicted message, if any.
    pub fn push(&mut self, message: QueuedMessage) -> Option<QueuedMessage> {
        let evicted = if self.buffer.len() >= self.capacity {
            self.buffer.pop_front()
        } else {
            None
        };
        if let Some(dropped) = &evicted {
            self.evicted_total += 1;
            warn!(
                sequence = dropped.sequence,
                kind = dropped.kind.as_str(),
                capacity = self.capacity,
                "Pending queue full, dropped oldest message"
            );
        }
        self.buffer.push_back(message);
        evicted
    }

    /// Put a message back at the head after a failed flush.
    ///
    /// If the queue filled up in the meantime the message is the oldest
    /// entry and is dropped instead.
    pub fn requeue_front(&mut self, message: QueuedMessage) -> bool {
        if self.buffer.len() >= self.capacity {
            self.evicted_total += 1;
            warn!(sequence = message.sequence, "Pending queue full, dropped requeued message");
            return false;
        }
        self.buffer.push_front(message);
        true
    }

    pub fn pop_front(&mut self) -> Option<QueuedMessage> {
        self.buffer.pop_front()
    }

    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.buffer.drain(..).collect()
    }

    /// Sequence numbers currently queued, oldest first
    pub fn sequences(&self) -> Vec<u64> {
        self.buffer.iter().map(|m| m.sequence).collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            entries: self.buffer.len(),
            capacity: self.capacity,
            evicted_total: self.evicted_total,
            oldest_sequence: self.buffer.front().map(|m| m.sequence),
            newest_sequence: self.buffer.back().map(|m| m.sequence),
        }
    }
}
