//! Smart Error Recovery: classification, backoff, circuit breaker.
//!
//! One `ErrorRecovery` instance is owned by the Workflow Engine for the
//! lifetime of a run. It is not `Clone` and not shared across threads; the
//! engine's iteration path is its only mutator (§5 of the design).

pub mod circuit_breaker;
pub mod classifier;
pub mod strategy;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use classifier::ErrorCategory;
pub use strategy::{backoff_for, Backoff, ContextAction, Strategy};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::data_model::MAX_ERROR_HISTORY;

#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub normalized_message: String,
    pub category: ErrorCategory,
    pub timestamp: DateTime<Utc>,
    pub context_tag: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("operation {operation_id} exhausted retries for category {category} after {attempts} attempts: {message}")]
    Exhausted {
        operation_id: String,
        category: ErrorCategory,
        attempts: u32,
        message: String,
    },
    #[error("circuit breaker open, aborting operation {operation_id}: {message}")]
    CircuitOpen { operation_id: String, message: String },
}

pub struct ErrorRecovery {
    config: RetryConfig,
    breaker: CircuitBreaker,
    retry_counters: HashMap<String, u32>,
    history: Vec<ErrorEntry>,
}

/// What the caller should do next, already accounting for the circuit
/// breaker and the per-category retry ceiling.
pub enum Decision {
    Retry { strategy: Strategy, backoff: Backoff },
    SkipStep,
    Escalate,
    Abort,
}

impl ErrorRecovery {
    pub fn new(config: RetryConfig) -> Self {
        let threshold = config.circuit_breaker_threshold;
        let reset = Duration::from_secs(config.circuit_breaker_reset_time_secs);
        Self {
            config,
            breaker: CircuitBreaker::new(threshold, reset),
            retry_counters: HashMap::new(),
            history: Vec::new(),
        }
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Records a failure and decides what the caller should do. `operation_id`
    /// scopes the per-operation retry counter (separate from the shared
    /// circuit breaker, which accumulates across every operation).
    pub fn handle_failure(
        &mut self,
        operation_id: &str,
        raw_message: &str,
        context_tag: Option<&str>,
    ) -> Decision {
        let category = classifier::classify(raw_message);
        self.record_error(category, raw_message, context_tag);
        self.breaker.record_failure();

        if self.breaker.is_open() {
            return Decision::Abort;
        }

        let retry_count = *self.retry_counters.get(operation_id).unwrap_or(&0);
        if retry_count >= category.max_retries() || category == ErrorCategory::Permanent {
            self.retry_counters.remove(operation_id);
            return match strategy::strategy_for(category, retry_count) {
                Strategy::Abort => Decision::Abort,
                Strategy::SkipStep => Decision::SkipStep,
                _ => Decision::Escalate,
            };
        }

        self.retry_counters.insert(operation_id.to_string(), retry_count + 1);
        let strategy = strategy::strategy_for(category, retry_count);
        match strategy {
            Strategy::SkipStep => Decision::SkipStep,
            Strategy::Escalate => Decision::Escalate,
            Strategy::Abort => Decision::Abort,
            _ => {
                let backoff = backoff_for(
                    strategy,
                    retry_count,
                    self.config.base_delay_ms,
                    self.config.max_delay_ms,
                    self.config.jitter_factor,
                );
                Decision::Retry { strategy, backoff }
            }
        }
    }

    /// Resets the operation's retry counter and decrements the circuit
    /// breaker's failure count.
    pub fn handle_success(&mut self, operation_id: &str) {
        self.retry_counters.remove(operation_id);
        self.breaker.record_success();
    }

    fn record_error(&mut self, category: ErrorCategory, raw_message: &str, context_tag: Option<&str>) {
        self.history.push(ErrorEntry {
            normalized_message: normalize(raw_message),
            category,
            timestamp: Utc::now(),
            context_tag: context_tag.map(|s| s.to_string()),
        });
        if self.history.len() > MAX_ERROR_HISTORY {
            let excess = self.history.len() - MAX_ERROR_HISTORY;
            self.history.drain(0..excess);
        }
    }

    /// Counts of errors per category within the trailing window.
    pub fn trend(&self, window: Duration) -> HashMap<ErrorCategory, u32> {
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
        let mut counts = HashMap::new();
        for entry in self.history.iter().filter(|e| e.timestamp >= cutoff) {
            *counts.entry(entry.category).or_insert(0) += 1;
        }
        counts
    }

    pub fn history(&self) -> &[ErrorEntry] {
        &self.history
    }
}

fn normalize(message: &str) -> String {
    message.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recovery() -> ErrorRecovery {
        ErrorRecovery::new(RetryConfig {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 1000,
            circuit_breaker_threshold: 5,
            circuit_breaker_reset_time_secs: 60,
            jitter_factor: 0.5,
        })
    }

    #[test]
    fn permanent_error_aborts_immediately() {
        let mut recovery = recovery();
        let decision = recovery.handle_failure("op-1", "invalid api key supplied", None);
        assert!(matches!(decision, Decision::Abort));
    }

    #[test]
    fn transient_error_retries_then_escalates() {
        let mut recovery = recovery();
        for _ in 0..5 {
            let decision = recovery.handle_failure("op-1", "ETIMEDOUT connecting to host", None);
            assert!(matches!(decision, Decision::Retry { .. }));
        }
        let decision = recovery.handle_failure("op-1", "ETIMEDOUT connecting to host", None);
        assert!(matches!(decision, Decision::Escalate));
    }

    #[test]
    fn success_resets_operation_counter() {
        let mut recovery = recovery();
        recovery.handle_failure("op-1", "ETIMEDOUT", None);
        recovery.handle_success("op-1");
        assert_eq!(*recovery.retry_counters.get("op-1").unwrap_or(&0), 0);
    }

    #[test]
    fn circuit_breaker_forces_abort_after_threshold() {
        let mut recovery = recovery();
        for i in 0..5 {
            let op = format!("op-{i}");
            recovery.handle_failure(&op, "internal error 500", None);
        }
        let decision = recovery.handle_failure("op-new", "internal error 500", None);
        assert!(matches!(decision, Decision::Abort));
    }

    #[test]
    fn history_is_bounded() {
        let mut recovery = recovery();
        for _ in 0..(MAX_ERROR_HISTORY + 10) {
            recovery.breaker = CircuitBreaker::new(1000, Duration::from_secs(60));
            recovery.record_error(ErrorCategory::Internal, "internal error 500", None);
        }
        assert_eq!(recovery.history().len(), MAX_ERROR_HISTORY);
    }
}
