//! Correlates responses with the requests that are waiting for them.
//!
//! Every tracked request owns exactly one [`Responder`]. Consuming the
//! responder is the only way to complete a request, so each request
//! completes at most once; [`CallbackCorrelator::destroy`] guarantees the
//! "at least once" half when the server instance goes away.

use std::collections::{HashMap, HashSet};

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::errors::RequestError;
use crate::protocol::Response;
use crate::queue::Expectation;

pub(crate) type Reply = oneshot::Sender<Result<Response, RequestError>>;

/// Who receives a request's outcome.
#[derive(Debug)]
pub(crate) enum Responder {
    /// A caller awaiting a future.
    Caller(Reply),
    /// The engine's own bulk diagnostics request.
    GetErr,
}

#[derive(Debug)]
pub(crate) struct PendingCallback {
    pub command: String,
    pub responder: Responder,
    pub started_at: Instant,
}

impl PendingCallback {
    pub fn new(command: impl Into<String>, responder: Responder, started_at: Instant) -> Self {
        Self {
            command: command.into(),
            responder,
            started_at,
        }
    }

    /// Deliver an outcome to a caller. Internal responders are returned so
    /// the engine can route them.
    pub fn resolve(self, result: Result<Response, RequestError>) -> Option<Responder> {
        match self.responder {
            Responder::Caller(tx) => {
                // The caller may have given up (cancelled); that is fine.
                let _ = tx.send(result);
                None
            }
            internal @ Responder::GetErr => Some(internal),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CallbackCorrelator {
    sync_callbacks: HashMap<u64, PendingCallback>,
    async_callbacks: HashMap<u64, PendingCallback>,
    /// Sync requests written to the server and not yet answered. Its size is
    /// the dispatch throttle.
    pending_responses: HashSet<u64>,
    in_flight_async: HashSet<u64>,
}

impl CallbackCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, seq: u64, callback: PendingCallback, is_async: bool) {
        if is_async {
            self.async_callbacks.insert(seq, callback);
        } else {
            self.sync_callbacks.insert(seq, callback);
        }
    }

    /// Record that `seq` was written to the server.
    pub fn mark_sent(&mut self, seq: u64, expectation: Expectation) {
        match expectation {
            Expectation::Sync => {
                self.pending_responses.insert(seq);
            }
            Expectation::Async => {
                self.in_flight_async.insert(seq);
            }
            Expectation::NoResult => {}
        }
    }

    /// Remove and return the callback for `seq`, releasing its throttle slot.
    pub fn fetch(&mut self, seq: u64) -> Option<PendingCallback> {
        self.pending_responses.remove(&seq);
        self.in_flight_async.remove(&seq);
        self.sync_callbacks
            .remove(&seq)
            .or_else(|| self.async_callbacks.remove(&seq))
    }

    pub fn is_tracked(&self, seq: u64) -> bool {
        self.sync_callbacks.contains_key(&seq) || self.async_callbacks.contains_key(&seq)
    }

    /// Whether `seq` is an async request still awaiting completion.
    pub fn is_async(&self, seq: u64) -> bool {
        self.async_callbacks.contains_key(&seq)
    }

    pub fn pending_sync_responses(&self) -> usize {
        self.pending_responses.len()
    }

    pub fn in_flight_async(&self) -> usize {
        self.in_flight_async.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sync_callbacks.len() + self.async_callbacks.len()
    }

    /// Reject every tracked callback with `cause` and reset the throttle.
    ///
    /// Returns how many callbacks were rejected.
    pub fn destroy(&mut self, cause: &RequestError) -> usize {
        let callbacks: Vec<PendingCallback> = self
            .sync_callbacks
            .drain()
            .chain(self.async_callbacks.drain())
            .map(|(_, cb)| cb)
            .collect();
        let count = callbacks.len();
        for callback in callbacks {
            let _ = callback.resolve(Err(cause.clone()));
        }
        self.pending_responses.clear();
        self.in_flight_async.clear();
        count
    }
}
