use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, sleep_until};

/// Exponential delay between polls while the oracle is unavailable.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: None,
        }
    }

    /// Delay to wait before the next attempt; doubles on every call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.initial,
            Some(previous) => previous.saturating_mul(2).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    /// Forget escalation after the oracle answered.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Deadline shared by every poll.
///
/// A rate-limit answer for one order pushes the deadline for all of them.
#[derive(Debug, Default)]
pub struct Throttle {
    deadline: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep until no deadline is pending. The lock is never held across the
    /// sleep, and a deadline pushed meanwhile is honoured.
    pub async fn wait(&self) {
        loop {
            let deadline = *self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
            match deadline {
                Some(deadline) if deadline > Instant::now() => sleep_until(deadline).await,
                _ => return,
            }
        }
    }

    /// Hold every poll back for at least `retry_after`.
    pub fn defer(&self, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        let mut deadline = self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        if deadline.is_none_or(|current| current < until) {
            *deadline = Some(until);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
