//! Request pipeline for one server instance.
//!
//! [`ServerChannel`] ties the queue, the callback table and the cancellation
//! bridge to the instance's writer. It lives exactly as long as the instance;
//! a restart builds a new one, which is what resets sequence numbers.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::callbacks::{CallbackCorrelator, PendingCallback, Responder};
use crate::cancellation::CancellationBridge;
use crate::errors::RequestError;
use crate::protocol::{RawResponse, Request, Response};
use crate::queue::{Expectation, QueueingType, QueuedRequest, RequestQueue};

pub(crate) enum WriterCommand {
    Send(Value),
    Shutdown,
}

/// What [`ServerChannel::cancel_seq`] managed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelOutcome {
    /// Removed from the queue; never written.
    Dequeued,
    /// Already written; a sentinel was written for the server.
    Signalled,
    /// Already written and the server cannot be signalled.
    InFlight,
    /// Not known to this instance.
    NotFound,
}

pub(crate) struct ServerChannel {
    queue: RequestQueue,
    callbacks: CallbackCorrelator,
    cancellation: CancellationBridge,
    writer: mpsc::UnboundedSender<WriterCommand>,
    max_in_flight_async: usize,
    /// Caller ticket → sequence number, for cancellation.
    tickets: HashMap<u64, u64>,
    seq_tickets: HashMap<u64, u64>,
}

impl ServerChannel {
    pub fn new(
        writer: mpsc::UnboundedSender<WriterCommand>,
        cancellation: CancellationBridge,
        max_in_flight_async: usize,
    ) -> Self {
        Self {
            queue: RequestQueue::new(),
            callbacks: CallbackCorrelator::new(),
            cancellation,
            writer,
            max_in_flight_async: max_in_flight_async.max(1),
            tickets: HashMap::new(),
            seq_tickets: HashMap::new(),
        }
    }

    /// Queue a request and dispatch whatever the throttle allows.
    ///
    /// A `NoResult` request is not tracked; its responder, if any, is
    /// resolved at once with an empty body.
    #[allow(clippy::too_many_arguments)]
    pub fn submit(
        &mut self,
        command: &str,
        arguments: Option<Value>,
        expectation: Expectation,
        queueing: QueueingType,
        responder: Option<Responder>,
        ticket: Option<u64>,
        now: Instant,
    ) -> u64 {
        let seq = self.queue.allocate_seq();
        match (expectation, responder) {
            (Expectation::NoResult, Some(responder)) => {
                let done = PendingCallback::new(command, responder, now);
                let _ = done.resolve(Ok(Response::empty(seq, command)));
            }
            (Expectation::NoResult, None) => {}
            (_, Some(responder)) => {
                self.callbacks.add(
                    seq,
                    PendingCallback::new(command, responder, now),
                    expectation == Expectation::Async,
                );
                if let Some(ticket) = ticket {
                    self.tickets.insert(ticket, seq);
                    self.seq_tickets.insert(seq, ticket);
                }
            }
            (_, None) => {
                tracing::warn!(command, "Request expecting a result has no responder");
            }
        }

        self.queue.enqueue(QueuedRequest {
            seq,
            command: command.to_string(),
            arguments,
            expectation,
            queueing,
        });
        self.send_next_requests();
        seq
    }

    /// Write queued requests until the throttle or the async cap says stop.
    pub fn send_next_requests(&mut self) {
        loop {
            let sync_outstanding = self.callbacks.pending_sync_responses() > 0;
            let Some(index) = self.queue.next_dispatchable(sync_outstanding) else {
                return;
            };
            let at_async_cap = self.callbacks.in_flight_async() >= self.max_in_flight_async;
            if at_async_cap && self.queue.get(index).is_some_and(QueuedRequest::is_async) {
                return;
            }
            let Some(item) = self.queue.remove(index) else {
                return;
            };
            self.write(item);
        }
    }

    fn write(&mut self, item: QueuedRequest) {
        let seq = item.seq;
        let expectation = item.expectation;
        let request = Request::new(seq, item.command, item.arguments);
        match serde_json::to_value(&request) {
            Ok(frame) => {
                tracing::debug!(seq, command = %request.command, "Sending request");
                if self.writer.send(WriterCommand::Send(frame)).is_err() {
                    // The exit notification will fail everything still tracked.
                    tracing::debug!(seq, "Writer closed; request not delivered");
                }
                self.callbacks.mark_sent(seq, expectation);
            }
            Err(e) => {
                tracing::warn!(seq, "Failed to serialize request: {e}");
                if let Some(callback) = self.callbacks.fetch(seq) {
                    let _ = callback.resolve(Err(RequestError::from_server(
                        &request.command,
                        Some(&e.to_string()),
                    )));
                }
            }
        }
    }

    /// Complete the request a response belongs to.
    ///
    /// Returns the sequence number when the request was the engine's own
    /// bulk diagnostics request.
    pub fn handle_response(&mut self, response: RawResponse) -> Option<u64> {
        let seq = response.request_seq;
        let outcome = if response.success {
            Ok(Response {
                request_seq: seq,
                command: response.command,
                body: response.body,
            })
        } else {
            let error = RequestError::from_server(&response.command, response.message.as_deref());
            if let RequestError::Server { message, stack, .. } = &error {
                tracing::debug!(seq, command = %response.command, %message, ?stack, "Request failed");
            }
            Err(error)
        };
        self.complete(seq, outcome)
    }

    /// An async request may also finish through a `requestCompleted` event.
    pub fn handle_request_completed(&mut self, seq: u64) -> Option<u64> {
        if !self.callbacks.is_async(seq) {
            return None;
        }
        self.complete(seq, Ok(Response::empty(seq, "requestCompleted")))
    }

    fn complete(&mut self, seq: u64, outcome: Result<Response, RequestError>) -> Option<u64> {
        self.cancellation.cleanup(seq);
        if let Some(ticket) = self.seq_tickets.remove(&seq) {
            self.tickets.remove(&ticket);
        }
        let internal = match self.callbacks.fetch(seq) {
            Some(callback) => {
                tracing::debug!(
                    seq,
                    command = %callback.command,
                    elapsed_ms = callback.started_at.elapsed().as_millis() as u64,
                    "Request completed"
                );
                callback.resolve(outcome).map(|_| seq)
            }
            None => {
                tracing::debug!(seq, "Completion for untracked request");
                None
            }
        };
        self.send_next_requests();
        internal
    }

    pub fn cancel_ticket(&mut self, ticket: u64) -> CancelOutcome {
        match self.tickets.get(&ticket).copied() {
            Some(seq) => self.cancel_seq(seq),
            None => CancelOutcome::NotFound,
        }
    }

    /// Cancel `seq`. A queued request is removed and rejected; an in-flight
    /// one keeps its callback until the server answers so the throttle stays
    /// accurate.
    pub fn cancel_seq(&mut self, seq: u64) -> CancelOutcome {
        if self.queue.try_cancel(seq).is_some() {
            if let Some(ticket) = self.seq_tickets.remove(&seq) {
                self.tickets.remove(&ticket);
            }
            if let Some(callback) = self.callbacks.fetch(seq) {
                let _ = callback.resolve(Err(RequestError::Cancelled));
            }
            tracing::debug!(seq, "Cancelled queued request");
            self.send_next_requests();
            return CancelOutcome::Dequeued;
        }
        if !self.callbacks.is_tracked(seq) {
            return CancelOutcome::NotFound;
        }
        if self.cancellation.signal(seq) {
            CancelOutcome::Signalled
        } else {
            CancelOutcome::InFlight
        }
    }

    /// Fail everything this instance still owes an answer for.
    pub fn detach(&mut self, cause: &RequestError) -> usize {
        let dropped = self.queue.drain().len();
        let rejected = self.callbacks.destroy(cause);
        self.cancellation.cleanup_all();
        self.tickets.clear();
        self.seq_tickets.clear();
        let _ = self.writer.send(WriterCommand::Shutdown);
        tracing::debug!(dropped, rejected, "Detached server channel");
        rejected
    }

    pub fn pending_sync_responses(&self) -> usize {
        self.callbacks.pending_sync_responses()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}
