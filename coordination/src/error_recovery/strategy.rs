//! Recovery strategies and the per-category strategy ladder.

use super::classifier::ErrorCategory;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RetryImmediate,
    RetryBackoff,
    RetryExtended,
    TrimContext,
    ResetContext,
    SimplifyRequest,
    SkipStep,
    Escalate,
    Abort,
}

impl Strategy {
    pub fn is_retryable(self) -> bool {
        !matches!(self, Strategy::SkipStep | Strategy::Escalate | Strategy::Abort)
    }
}

/// The ladder is indexed by retry attempt number (0-based); once the
/// ladder's entries are exhausted, the last entry repeats.
fn ladder(category: ErrorCategory) -> &'static [Strategy] {
    use Strategy::*;
    match category {
        ErrorCategory::Permanent => &[Abort],
        ErrorCategory::Transient => &[RetryBackoff, RetryBackoff, RetryExtended, Escalate],
        ErrorCategory::RateLimit => &[RetryBackoff, RetryBackoff, RetryExtended, Escalate],
        ErrorCategory::Timeout => &[RetryExtended, SimplifyRequest, SkipStep, Escalate],
        ErrorCategory::Context => &[TrimContext, ResetContext, SimplifyRequest, Escalate],
        ErrorCategory::Permission => &[Escalate],
        ErrorCategory::Validation => &[SimplifyRequest, RetryImmediate, SkipStep, Escalate],
        ErrorCategory::Resource => &[RetryImmediate, SkipStep, Escalate],
        ErrorCategory::Internal => &[RetryBackoff, RetryBackoff, Escalate],
    }
}

/// Picks the strategy for the `retry_count`-th attempt (0-based) at this
/// category, per the ladder above.
pub fn strategy_for(category: ErrorCategory, retry_count: u32) -> Strategy {
    let rungs = ladder(category);
    let idx = (retry_count as usize).min(rungs.len() - 1);
    rungs[idx]
}

/// A recovery action that affects the worker's conversation context, to be
/// relayed to the caller alongside the retry delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextAction {
    Trim { keep_recent: usize },
    Reset,
    Simplify { suggestions: Vec<String> },
}

pub struct Backoff {
    pub delay: Duration,
    pub pre_delay: Duration,
    pub context_action: Option<ContextAction>,
}

/// Computes the delay (and any context-affecting side action) for a given
/// strategy and attempt number. `base`/`max` come from `RetryConfig`.
pub fn backoff_for(
    strategy: Strategy,
    attempt: u32,
    base_ms: u64,
    max_ms: u64,
    jitter_factor: f64,
) -> Backoff {
    let mut rng = rand::thread_rng();
    let jitter = || rng.gen_range(jitter_factor..1.0);
    match strategy {
        Strategy::RetryImmediate => Backoff {
            delay: Duration::ZERO,
            pre_delay: Duration::ZERO,
            context_action: None,
        },
        Strategy::RetryBackoff => {
            let raw = base_ms as f64 * 2f64.powi(attempt as i32) + jitter() * base_ms as f64;
            Backoff {
                delay: Duration::from_millis((raw as u64).min(max_ms)),
                pre_delay: Duration::ZERO,
                context_action: None,
            }
        }
        Strategy::RetryExtended => {
            let raw = 3.0 * base_ms as f64 * 2f64.powi(attempt as i32) + jitter() * base_ms as f64;
            Backoff {
                delay: Duration::from_millis((raw as u64).min(2 * max_ms)),
                pre_delay: Duration::ZERO,
                context_action: None,
            }
        }
        Strategy::TrimContext => Backoff {
            delay: Duration::ZERO,
            pre_delay: Duration::from_millis(500),
            context_action: Some(ContextAction::Trim { keep_recent: 5 }),
        },
        Strategy::ResetContext => Backoff {
            delay: Duration::ZERO,
            pre_delay: Duration::from_millis(500),
            context_action: Some(ContextAction::Reset),
        },
        Strategy::SimplifyRequest => Backoff {
            delay: Duration::ZERO,
            pre_delay: Duration::from_secs(1),
            context_action: Some(ContextAction::Simplify {
                suggestions: vec![
                    "break the step into smaller pieces".to_string(),
                    "drop optional requirements for this attempt".to_string(),
                ],
            }),
        },
        Strategy::SkipStep | Strategy::Escalate | Strategy::Abort => Backoff {
            delay: Duration::ZERO,
            pre_delay: Duration::ZERO,
            context_action: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_repeats_last_rung_past_its_length() {
        assert_eq!(strategy_for(ErrorCategory::Resource, 10), Strategy::Escalate);
    }

    #[test]
    fn permanent_always_aborts() {
        assert_eq!(strategy_for(ErrorCategory::Permanent, 0), Strategy::Abort);
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let backoff = backoff_for(Strategy::RetryBackoff, 20, 1000, 30_000, 0.5);
        assert!(backoff.delay.as_millis() as u64 <= 30_000);
    }

    #[test]
    fn retry_immediate_has_zero_delay() {
        let backoff = backoff_for(Strategy::RetryImmediate, 0, 1000, 30_000, 0.5);
        assert_eq!(backoff.delay, Duration::ZERO);
    }
}
