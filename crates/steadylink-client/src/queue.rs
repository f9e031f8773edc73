/*
[INPUT]:  Payloads accepted from callers while any non-terminal state is current
[OUTPUT]: Sequence-stamped messages dispatched oldest first, held until acknowledged
[POS]:    Core - bounded FIFO with reject-on-full backpressure
[UPDATE]: When overflow policy or batching changes
*/

use chrono::Utc;
use std::collections::VecDeque;

use crate::error::{ClientError, Result};
use crate::types::{OutboundMessage, Payload};

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

/// Bounded outbound buffer.
///
/// A message stays in the queue until the transport confirms it was written.
/// The oldest `in_flight` entries have been handed to the transport; the rest
/// are still waiting. Both count against `capacity`.
///
/// Sequence numbers come from a counter that only moves forward, so a number is
/// never handed out twice, even across `clear`.
#[derive(Debug)]
pub struct OutboundQueue {
    messages: VecDeque<OutboundMessage>,
    capacity: usize,
    in_flight: usize,
    next_sequence: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity.min(DEFAULT_MAX_QUEUE_SIZE)),
            capacity,
            in_flight: 0,
            next_sequence: 1,
        }
    }

    /// Stamp and append a payload. Rejects when full; nothing is evicted.
    pub fn enqueue(&mut self, payload: Payload) -> Result<u64> {
        if self.messages.len() >= self.capacity {
            return Err(ClientError::QueueFull {
                capacity: self.capacity,
            });
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.messages.push_back(OutboundMessage {
            payload,
            enqueued_at: Utc::now(),
            sequence,
        });
        Ok(sequence)
    }

    /// Hand out up to `max_n` waiting messages, oldest first. They stay
    /// queued as in flight until acknowledged or rewound.
    pub fn dispatch_batch(&mut self, max_n: usize) -> Vec<OutboundMessage> {
        let take = max_n.min(self.pending());
        let batch: Vec<OutboundMessage> = self
            .messages
            .iter()
            .skip(self.in_flight)
            .take(take)
            .cloned()
            .collect();
        self.in_flight += batch.len();
        batch
    }

    /// Drop in-flight messages up to and including `sequence`. Returns how
    /// many were removed.
    pub fn acknowledge(&mut self, sequence: u64) -> usize {
        let mut acked = 0;
        while self.in_flight > 0 {
            match self.messages.front() {
                Some(message) if message.sequence <= sequence => {
                    self.messages.pop_front();
                    self.in_flight -= 1;
                    acked += 1;
                }
                _ => break,
            }
        }
        acked
    }

    /// Put unacknowledged messages back in line for the next episode.
    /// Returns how many were rewound.
    pub fn rewind(&mut self) -> usize {
        std::mem::take(&mut self.in_flight)
    }

    /// Messages held, in flight or waiting.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Messages not yet handed to a transport.
    pub fn pending(&self) -> usize {
        self.messages.len() - self.in_flight
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence of the oldest message still held.
    pub fn peek_sequence(&self) -> Option<u64> {
        self.messages.front().map(|message| message.sequence)
    }

    /// Drop every message, in flight or not. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.messages.len();
        self.messages.clear();
        self.in_flight = 0;
        dropped
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_SIZE)
    }
}
