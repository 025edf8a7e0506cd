// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

/// Tracks how much of an optional time budget is left.
///
/// A `None` budget means the operation is unbounded and never expires.
/// `poll_timeout_ms` converts the remaining budget into the millisecond
/// form `poll(2)` expects, where `-1` blocks indefinitely.
#[derive(Debug, Clone)]
pub struct Deadline {
    start: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub fn new(limit: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            limit,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn is_unbounded(&self) -> bool {
        self.limit.is_none()
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn expired(&self) -> bool {
        match self.limit {
            Some(limit) => self.start.elapsed() >= limit,
            None => false,
        }
    }

    /// Remaining budget, saturating at zero. `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.limit.map(|limit| limit.saturating_sub(self.start.elapsed()))
    }

    /// Remaining budget in `poll(2)` form: `-1` for unbounded, otherwise
    /// milliseconds clamped into `0..=i32::MAX`.
    pub fn poll_timeout_ms(&self) -> i32 {
        match self.remaining() {
            None => -1,
            Some(rem) => rem.as_millis().min(i32::MAX as u128) as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_never_expires() {
        let deadline = Deadline::unbounded();
        assert!(deadline.is_unbounded());
        assert!(!deadline.expired());
        assert_eq!(deadline.remaining(), None);
        assert_eq!(deadline.poll_timeout_ms(), -1);
    }

    #[test]
    fn bounded_counts_down() {
        let deadline = Deadline::new(Some(Duration::from_millis(50)));
        assert!(!deadline.is_unbounded());
        let remaining = deadline.remaining().unwrap();
        assert!(remaining <= Duration::from_millis(50));
        assert!(deadline.poll_timeout_ms() <= 50);
        assert!(deadline.poll_timeout_ms() >= 0);
    }

    #[test]
    fn bounded_expires() {
        let deadline = Deadline::new(Some(Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
        assert_eq!(deadline.poll_timeout_ms(), 0);
    }

    #[test]
    fn zero_budget_is_already_expired() {
        let deadline = Deadline::new(Some(Duration::ZERO));
        assert!(deadline.expired());
        assert_eq!(deadline.poll_timeout_ms(), 0);
    }
}
