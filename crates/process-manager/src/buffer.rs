//! Outbound buffer: bounded FIFO for envelopes queued while the channel is
//! not yet writable (worker still starting).
//!
//! At capacity, `offer` hands the envelope back instead of growing; the
//! master signals `messageBufferFull` and rejects the triggering operation.

use std::collections::VecDeque;

use crate::bridge::protocol::Envelope;

pub struct OutboundBuffer {
    queue: VecDeque<Envelope>,
    capacity: usize,
}

impl OutboundBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
        }
    }

    /// Queue an envelope; at capacity the envelope is returned to the caller.
    pub fn offer(&mut self, envelope: Envelope) -> Result<(), Envelope> {
        if self.queue.len() >= self.capacity {
            return Err(envelope);
        }
        self.queue.push_back(envelope);
        Ok(())
    }

    /// Take everything, strictly in the order it was offered.
    pub fn drain(&mut self) -> Vec<Envelope> {
        self.queue.drain(..).collect()
    }

    /// Discard everything; returns the number of envelopes dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
