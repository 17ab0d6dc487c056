//! Outgoing request queue.
//!
//! Holds requests that have been submitted but not yet written to the
//! server, allocates their sequence numbers, and decides which one may be
//! transmitted next.

use std::collections::VecDeque;

use serde_json::Value;

/// Where a request lands in the queue relative to ones already waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueingType {
    /// Jumps ahead of any trailing low-priority requests.
    #[default]
    Normal,
    /// Appended; normal requests may be inserted ahead of it.
    LowPriority,
    /// Appended; nothing is reordered across it.
    Fence,
}

/// How a request participates in response correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expectation {
    /// Fire-and-forget; no response is tracked.
    NoResult,
    /// Holds the one-at-a-time dispatch throttle until answered.
    Sync,
    /// Answered out of band; never blocks the throttle.
    Async,
}

#[derive(Debug)]
pub(crate) struct QueuedRequest {
    pub seq: u64,
    pub command: String,
    pub arguments: Option<Value>,
    pub expectation: Expectation,
    pub queueing: QueueingType,
}

impl QueuedRequest {
    pub fn is_async(&self) -> bool {
        self.expectation == Expectation::Async
    }
}

#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    queue: VecDeque<QueuedRequest>,
    next_seq: u64,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next sequence number. Strictly increasing for the
    /// lifetime of this queue, which lives exactly as long as one server
    /// instance.
    pub fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn enqueue(&mut self, item: QueuedRequest) {
        if item.queueing == QueueingType::Normal {
            let index = self
                .queue
                .iter()
                .rposition(|q| q.queueing != QueueingType::LowPriority)
                .map_or(0, |i| i + 1);
            self.queue.insert(index, item);
        } else {
            self.queue.push_back(item);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&QueuedRequest> {
        self.queue.get(index)
    }

    /// Index of the next request allowed to go out.
    ///
    /// With no synchronous response outstanding that is simply the head.
    /// While one is outstanding, async requests may overtake queued
    /// synchronous requests, but never a fire-and-forget request or a fence:
    /// those carry buffer state later requests depend on.
    pub fn next_dispatchable(&self, sync_outstanding: bool) -> Option<usize> {
        if !sync_outstanding {
            return (!self.queue.is_empty()).then_some(0);
        }
        for (index, item) in self.queue.iter().enumerate() {
            if item.queueing == QueueingType::Fence {
                return None;
            }
            match item.expectation {
                Expectation::Async => return Some(index),
                Expectation::NoResult => return None,
                Expectation::Sync => {}
            }
        }
        None
    }

    pub fn remove(&mut self, index: usize) -> Option<QueuedRequest> {
        self.queue.remove(index)
    }

    /// Remove a still-queued request. Returns `None` if it already went out.
    pub fn try_cancel(&mut self, seq: u64) -> Option<QueuedRequest> {
        let index = self.queue.iter().position(|q| q.seq == seq)?;
        self.queue.remove(index)
    }

    /// Drop everything still waiting, e.g. when the server instance dies.
    pub fn drain(&mut self) -> Vec<QueuedRequest> {
        self.queue.drain(..).collect()
    }
}
