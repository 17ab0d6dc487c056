//! Status of automatic type acquisition.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Tracks outstanding typings installs by event id.
///
/// A begin without a matching end inside `timeout` is treated as finished so
/// that a lost end event cannot leave the client "acquiring" forever.
#[derive(Debug)]
pub(crate) struct TypingsTracker {
    timeout: Duration,
    outstanding: HashMap<u64, Instant>,
    installer_failure_reported: bool,
}

impl TypingsTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            outstanding: HashMap::new(),
            installer_failure_reported: false,
        }
    }

    pub fn begin(&mut self, event_id: u64, now: Instant) {
        self.outstanding.insert(event_id, now + self.timeout);
    }

    /// Returns whether `event_id` was still outstanding.
    pub fn end(&mut self, event_id: u64) -> bool {
        self.outstanding.remove(&event_id).is_some()
    }

    /// Drop installs whose timeout has passed, returning their ids.
    pub fn expire(&mut self, now: Instant) -> Vec<u64> {
        let mut expired: Vec<u64> = self
            .outstanding
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        for id in &expired {
            self.outstanding.remove(id);
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.outstanding.values().min().copied()
    }

    pub fn is_acquiring(&self) -> bool {
        !self.outstanding.is_empty()
    }

    /// Returns `true` the first time the installer failure is reported and
    /// `false` afterwards.
    pub fn report_installer_failure(&mut self) -> bool {
        !std::mem::replace(&mut self.installer_failure_reported, true)
    }

    /// Forget outstanding installs, e.g. when the server instance dies.
    pub fn reset(&mut self) {
        self.outstanding.clear();
    }
}
