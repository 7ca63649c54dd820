use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::codec::Publish;
use crate::types::Origin;

/// Position of a message in the backlog of its session. Increases
/// monotonically, also across a handover or a restart.
pub type QueueSeq = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub seq: QueueSeq,
    pub from: Origin,
    pub publish: Publish,
}

/// Bounded backlog of a session: messages waiting for inflight credit, or for
/// the client to come back. When full the oldest entry gives way.
#[derive(Debug)]
pub struct MessageQueue {
    cap: usize,
    next: QueueSeq,
    items: VecDeque<QueuedMessage>,
}

impl MessageQueue {
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self { cap, next: 1, items: VecDeque::new() }
    }

    /// Appends a message and returns it together with the entry dropped to
    /// make room, if any. With zero capacity the message itself is dropped.
    #[inline]
    pub fn push(&mut self, from: Origin, publish: Publish) -> (QueuedMessage, Option<QueuedMessage>) {
        let m = QueuedMessage { seq: self.next, from, publish };
        self.next += 1;
        if self.cap == 0 {
            return (m.clone(), Some(m));
        }
        let dropped = if self.items.len() >= self.cap { self.items.pop_front() } else { None };
        self.items.push_back(m.clone());
        (m, dropped)
    }

    #[inline]
    pub fn pop(&mut self) -> Option<QueuedMessage> {
        self.items.pop_front()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.items.drain(..).collect()
    }

    /// Takes back messages of an earlier session, keeping their sequence
    /// numbers. Returns those dropped for lack of room.
    pub fn restore(&mut self, mut messages: Vec<QueuedMessage>) -> Vec<QueuedMessage> {
        messages.sort_by_key(|m| m.seq);
        let mut dropped = Vec::new();
        for m in messages {
            self.next = self.next.max(m.seq + 1);
            if self.cap == 0 {
                dropped.push(m);
                continue;
            }
            if self.items.len() >= self.cap {
                dropped.extend(self.items.pop_front());
            }
            self.items.push_back(m);
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::QoS;

    fn p(payload: &'static str) -> Publish {
        Publish::new("t", payload, QoS::AtMostOnce, false)
    }

    #[test]
    fn oldest_is_dropped_when_full() {
        let from = Origin::client("c".into());
        let mut q = MessageQueue::new(2);
        assert!(q.push(from.clone(), p("1")).1.is_none());
        assert!(q.push(from.clone(), p("2")).1.is_none());
        let (pushed, dropped) = q.push(from.clone(), p("3"));
        let dropped = dropped.unwrap();
        assert_eq!(dropped.publish.payload, "1");
        assert_eq!(dropped.seq, 1);
        assert_eq!(pushed.seq, 3);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().publish.payload, "2");
        assert_eq!(q.drain().len(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn zero_capacity_drops_everything() {
        let mut q = MessageQueue::new(0);
        let (pushed, dropped) = q.push(Origin::client("c".into()), p("1"));
        assert_eq!(dropped.unwrap().seq, pushed.seq);
        assert!(q.is_empty());
    }

    #[test]
    fn restored_sequence_continues() {
        let from = Origin::client("c".into());
        let stored = vec![
            QueuedMessage { seq: 9, from: from.clone(), publish: p("b") },
            QueuedMessage { seq: 4, from: from.clone(), publish: p("a") },
        ];
        let mut q = MessageQueue::new(8);
        assert!(q.restore(stored).is_empty());
        let (pushed, _) = q.push(from, p("c"));
        assert_eq!(pushed.seq, 10);
        let order = q.drain().into_iter().map(|m| m.publish.payload).collect::<Vec<_>>();
        assert_eq!(order, vec!["a", "b", "c"]);
    }
}
