//! Trailing-edge debounce timer driven by the event loop.

use std::time::Duration;

use tokio::time::Instant;

/// Holds at most one pending payload. Each [`Delayer::trigger`] restarts the
/// timer and replaces the payload, so only the last trigger before the
/// deadline matters.
#[derive(Debug)]
pub(crate) struct Delayer<T> {
    pending: Option<(Instant, T)>,
}

impl<T> Default for Delayer<T> {
    fn default() -> Self {
        Self { pending: None }
    }
}

impl<T> Delayer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&mut self, now: Instant, delay: Duration, payload: T) {
        self.pending = Some((now + delay, payload));
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(at, _)| *at)
    }

    #[cfg(test)]
    pub fn is_triggered(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the payload if its deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        match &self.pending {
            Some((at, _)) if *at <= now => self.pending.take().map(|(_, payload)| payload),
            _ => None,
        }
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_due_before_deadline() {
        let now = Instant::now();
        let mut delayer = Delayer::new();
        delayer.trigger(now, Duration::from_millis(300), "a");
        assert!(delayer.take_due(now + Duration::from_millis(299)).is_none());
        assert_eq!(delayer.take_due(now + Duration::from_millis(300)), Some("a"));
        assert!(!delayer.is_triggered());
    }

    #[test]
    fn test_last_trigger_wins() {
        let now = Instant::now();
        let mut delayer = Delayer::new();
        delayer.trigger(now, Duration::from_millis(800), "first");
        let later = now + Duration::from_millis(100);
        delayer.trigger(later, Duration::from_millis(300), "second");

        assert_eq!(delayer.deadline(), Some(later + Duration::from_millis(300)));
        assert_eq!(
            delayer.take_due(later + Duration::from_millis(300)),
            Some("second")
        );
    }

    #[test]
    fn test_cancel_clears() {
        let now = Instant::now();
        let mut delayer = Delayer::new();
        delayer.trigger(now, Duration::ZERO, 1);
        delayer.cancel();
        assert!(delayer.deadline().is_none());
        assert!(delayer.take_due(now).is_none());
    }
}
