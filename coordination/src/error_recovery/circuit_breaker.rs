//! Circuit breaker guarding the worker/supervisor/planner child-process
//! calls against runaway failure loops.
//!
//! Unlike a per-model breaker, Error Recovery keeps exactly one breaker:
//! failures accumulate across every operation it classifies, and an open
//! breaker forces `ABORT` regardless of the triggering error's category.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    threshold: u32,
    reset_time: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_time: Duration) -> Self {
        Self {
            failures: 0,
            last_failure: None,
            opened_at: None,
            threshold,
            reset_time,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), CircuitState::Open)
    }

    /// Current state. An open breaker becomes half-open once `reset_time`
    /// has elapsed since it opened; the caller is then expected to make one
    /// probe attempt and feed the outcome back via `record_success` /
    /// `record_failure`.
    pub fn state(&self) -> CircuitState {
        match self.opened_at {
            None => CircuitState::Closed,
            Some(opened_at) => {
                if opened_at.elapsed() >= self.reset_time {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
        }
    }

    /// Each success decrements the failure count by one and fully closes
    /// the breaker once it reaches zero.
    pub fn record_success(&mut self) {
        if self.failures > 0 {
            self.failures -= 1;
        }
        if self.failures == 0 {
            self.opened_at = None;
        }
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());
        if self.failures >= self.threshold && self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        } else if matches!(self.state(), CircuitState::HalfOpen) {
            // The half-open probe failed: reopen for another full cooldown.
            self.opened_at = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_by_default() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(60));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_after_reset_time() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn success_decrements_and_closes() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failures(), 1);
        breaker.record_success();
        assert_eq!(breaker.failures(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn failed_half_open_probe_reopens() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
