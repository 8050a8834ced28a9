use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::time::Instant;

/// Computes reconnect delays: exponential growth from an initial delay up to a maximum, with up to
/// half of each delay removed at random so that many clients do not reconnect in lockstep.
///
/// A connection that stays up for at least the reset interval starts the sequence over.
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    reset_interval: Duration,
    attempts: u32,
    connected_at: Option<Instant>,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration, reset_interval: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            reset_interval,
            attempts: 0,
            connected_at: None,
        }
    }

    /// Record that a connection was established.
    pub(crate) fn connected(&mut self) {
        self.connected_at = Some(Instant::now());
    }

    /// The delay before the next connection attempt.
    pub(crate) fn next_delay(&mut self) -> Duration {
        if let Some(connected_at) = self.connected_at.take() {
            if connected_at.elapsed() >= self.reset_interval {
                self.attempts = 0;
            }
        }

        let delay = self.base_delay();
        self.attempts = self.attempts.saturating_add(1);
        jitter(delay)
    }

    fn base_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempts);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

fn jitter(delay: Duration) -> Duration {
    delay - thread_rng().gen_range(Duration::ZERO..=delay / 2)
}
