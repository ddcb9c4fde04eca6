//! # Fibonacci Backoff
//!
//! Progressive retry delays for failed reconciliations, in minutes:
//! 1m, 1m, 2m, 3m, 5m, 8m, then capped at 10m.

use std::time::Duration;

/// Fibonacci backoff calculator
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    prev_minutes: u64,
    current_minutes: u64,
    max_minutes: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with specified minimum and maximum values in minutes
    #[must_use]
    pub fn new(min_minutes: u64, max_minutes: u64) -> Self {
        Self {
            prev_minutes: 0,
            current_minutes: min_minutes,
            max_minutes,
        }
    }

    /// Returns the current delay and advances the sequence.
    pub fn next_backoff(&mut self) -> Duration {
        let result = Duration::from_secs(self.current_minutes * 60);
        let next_minutes = self.prev_minutes + self.current_minutes;
        self.prev_minutes = self.current_minutes;
        self.current_minutes = std::cmp::min(next_minutes, self.max_minutes);
        result
    }
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(1, 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(backoff: &mut FibonacciBackoff) -> u64 {
        backoff.next_backoff().as_secs() / 60
    }

    #[test]
    fn test_fibonacci_backoff_sequence_and_cap() {
        let mut backoff = FibonacciBackoff::default();
        let seq: Vec<u64> = (0..9).map(|_| minutes(&mut backoff)).collect();
        assert_eq!(seq, vec![1, 1, 2, 3, 5, 8, 10, 10, 10]);
    }

    #[test]
    fn test_fibonacci_backoff_custom_bounds() {
        let mut backoff = FibonacciBackoff::new(2, 5);
        let seq: Vec<u64> = (0..5).map(|_| minutes(&mut backoff)).collect();
        assert_eq!(seq, vec![2, 2, 4, 5, 5]);
    }
}
