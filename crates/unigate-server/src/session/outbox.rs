//! Bounded queue of outbound envelopes for replay on resume.
//!
//! Holds messages addressed to a session while it has no live connection.
//! When full, the oldest message is dropped so a client that never returns
//! cannot make the server keep unbounded history.

use std::collections::VecDeque;
use unigate_core::Envelope;

#[derive(Debug)]
pub struct Outbox {
    queue: VecDeque<Envelope>,
    capacity: usize,
    /// Total messages dropped because the queue was full.
    dropped: u64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    /// Queue a message, dropping the oldest one if full.
    pub fn push(&mut self, envelope: Envelope) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.queue.len() == self.capacity {
            self.queue.pop_front();
            self.dropped += 1;
        }
        self.queue.push_back(envelope);
    }

    /// Put back messages that were handed to a connection but never sent.
    ///
    /// They are older than anything already queued, so they go in front, in
    /// their original order.
    pub fn requeue_front(&mut self, unsent: Vec<Envelope>) {
        for envelope in unsent.into_iter().rev() {
            self.queue.push_front(envelope);
        }
        while self.queue.len() > self.capacity {
            self.queue.pop_front();
            self.dropped += 1;
        }
    }

    /// Take everything, oldest first.
    pub fn drain(&mut self) -> Vec<Envelope> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(n: u64) -> Envelope {
        Envelope::new("TEST", json!(n))
    }

    fn numbers(envs: &[Envelope]) -> Vec<u64> {
        envs.iter().map(|e| e.data.as_u64().unwrap()).collect()
    }

    #[test]
    fn drains_in_order() {
        let mut outbox = Outbox::new(10);
        for n in 0..3 {
            outbox.push(msg(n));
        }
        assert_eq!(numbers(&outbox.drain()), vec![0, 1, 2]);
        assert!(outbox.is_empty());
    }

    #[test]
    fn full_outbox_drops_oldest() {
        let mut outbox = Outbox::new(3);
        for n in 0..5 {
            outbox.push(msg(n));
        }
        assert_eq!(outbox.dropped(), 2);
        assert_eq!(numbers(&outbox.drain()), vec![2, 3, 4]);
    }

    #[test]
    fn requeued_messages_go_first() {
        let mut outbox = Outbox::new(10);
        outbox.push(msg(3));
        outbox.requeue_front(vec![msg(1), msg(2)]);
        assert_eq!(numbers(&outbox.drain()), vec![1, 2, 3]);
    }

    #[test]
    fn zero_capacity() {
        let mut outbox = Outbox::new(0);
        outbox.push(msg(1));
        assert!(outbox.is_empty());
        assert_eq!(outbox.dropped(), 1);
    }
}
