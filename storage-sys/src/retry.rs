// SPDX-License-Identifier: GPL-3.0-only

use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::Result;

/// Bounded retry of retryable failures with a doubling delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first one
    pub attempts: u32,
    /// Delay before the second try
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// Single attempt, no retry.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn run<T>(&self, operation: &str, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
        let attempts = self.attempts.max(1);
        let mut delay = self.backoff;
        let mut tried = 1;
        loop {
            match attempt() {
                Err(err) if err.is_retryable() && tried < attempts => {
                    warn!(
                        operation,
                        attempt = tried,
                        attempts,
                        "retrying in {delay:?}: {err}"
                    );
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    tried += 1;
                }
                result => return result,
            }
        }
    }
}
