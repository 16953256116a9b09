//! # Fibonacci Backoff
//!
//! Retry delays for nodes whose reconciliation keeps failing. The sequence
//! grows more slowly than an exponential one so a flapping API server is not
//! abandoned for long. With the default 5s floor and 5m cap it runs 5s, 5s,
//! 10s, 15s, 25s, 40s, 65s, 105s, 170s, 275s, then stays at 300s.

#[cfg(test)]
use std::time::Duration;

/// Fibonacci backoff calculator, in whole seconds
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Floor, restored on reset
    min_seconds: u64,
    prev_seconds: u64,
    current_seconds: u64,
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a new backoff starting at `min_seconds` and capped at `max_seconds`.
    ///
    /// A zero floor is raised to one second so the sequence always grows.
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        let min_seconds = min_seconds.max(1);
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds: max_seconds.max(min_seconds),
        }
    }

    /// Get the next backoff duration in seconds and advance the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result = self.current_seconds;

        let next = self.prev_seconds.saturating_add(self.current_seconds);
        self.prev_seconds = self.current_seconds;
        self.current_seconds = next.min(self.max_seconds);

        result
    }

    /// Get the next backoff duration as a `Duration` and advance the sequence
    #[cfg(test)]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::new(5, 60);

        let sequence: Vec<u64> = (0..9).map(|_| backoff.next_backoff_seconds()).collect();
        assert_eq!(sequence, vec![5, 5, 10, 15, 25, 40, 60, 60, 60]);
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = FibonacciBackoff::new(5, 300);

        assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(10));

        backoff.reset();

        assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn test_degenerate_bounds() {
        let mut backoff = FibonacciBackoff::new(0, 0);
        assert_eq!(backoff.next_backoff_seconds(), 1);
        assert_eq!(backoff.next_backoff_seconds(), 1);
        assert_eq!(backoff.next_backoff_seconds(), 1);
    }
}
