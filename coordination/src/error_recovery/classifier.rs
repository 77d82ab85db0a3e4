//! Static error taxonomy.
//!
//! Patterns are matched case-insensitively against the normalized error
//! message. `PERMANENT` is checked first, ahead of every other category, so
//! a message like "authentication failed: connection reset" classifies as
//! PERMANENT rather than TRANSIENT.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Permanent,
    Transient,
    RateLimit,
    Timeout,
    Context,
    Permission,
    Validation,
    Resource,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Transient => "transient",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Context => "context",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

impl ErrorCategory {
    /// Hard ceiling on retry attempts for this category, independent of
    /// whatever the strategy ladder would otherwise suggest.
    pub fn max_retries(self) -> u32 {
        match self {
            ErrorCategory::Permanent => 0,
            ErrorCategory::Permission => 0,
            ErrorCategory::Transient => 5,
            ErrorCategory::RateLimit => 4,
            ErrorCategory::Timeout => 3,
            ErrorCategory::Context => 2,
            ErrorCategory::Validation => 2,
            ErrorCategory::Resource => 2,
            ErrorCategory::Internal => 3,
        }
    }
}

static PERMANENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(invalid api key|authentication failed|unauthorized api|billing)").unwrap()
});

static TRANSIENT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(econnreset|etimedout|\b503\b|network)").unwrap());

static RATE_LIMIT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(rate limit|\b429\b|overloaded|throttl)").unwrap());

static TIMEOUT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(timed out|timeout|deadline)").unwrap());

static CONTEXT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(context (too long|too large)|token limit exceeded)").unwrap()
});

static PERMISSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(permission|unauthorized|\b403\b)").unwrap());

static VALIDATION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(invalid|malformed|schema)").unwrap());

static RESOURCE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(not found|\b404\b)").unwrap());

static INTERNAL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(internal error|\b500\b)").unwrap());

/// Classify a (normalized) error message into one of the nine categories.
/// Falls back to `Internal` when nothing matches, mirroring the "be
/// conservative and still retry a little" default for unrecognized shapes.
pub fn classify(message: &str) -> ErrorCategory {
    if PERMANENT_PATTERN.is_match(message) {
        ErrorCategory::Permanent
    } else if RATE_LIMIT_PATTERN.is_match(message) {
        ErrorCategory::RateLimit
    } else if TRANSIENT_PATTERN.is_match(message) {
        ErrorCategory::Transient
    } else if TIMEOUT_PATTERN.is_match(message) {
        ErrorCategory::Timeout
    } else if CONTEXT_PATTERN.is_match(message) {
        ErrorCategory::Context
    } else if PERMISSION_PATTERN.is_match(message) {
        ErrorCategory::Permission
    } else if RESOURCE_PATTERN.is_match(message) {
        ErrorCategory::Resource
    } else if VALIDATION_PATTERN.is_match(message) {
        ErrorCategory::Validation
    } else if INTERNAL_PATTERN.is_match(message) {
        ErrorCategory::Internal
    } else {
        ErrorCategory::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_takes_priority_over_transient() {
        let msg = "authentication failed: connection reset (ECONNRESET)";
        assert_eq!(classify(msg), ErrorCategory::Permanent);
    }

    #[test]
    fn rate_limit_detected() {
        assert_eq!(classify("429 too many requests, rate limit hit"), ErrorCategory::RateLimit);
    }

    #[test]
    fn timeout_detected() {
        assert_eq!(classify("request timed out after 30s"), ErrorCategory::Timeout);
    }

    #[test]
    fn context_detected() {
        assert_eq!(classify("token limit exceeded for this request"), ErrorCategory::Context);
    }

    #[test]
    fn unknown_falls_back_to_internal() {
        assert_eq!(classify("the flux capacitor is misaligned"), ErrorCategory::Internal);
    }

    #[test]
    fn max_retries_table_matches_spec() {
        assert_eq!(ErrorCategory::Permanent.max_retries(), 0);
        assert_eq!(ErrorCategory::Permission.max_retries(), 0);
        assert_eq!(ErrorCategory::Transient.max_retries(), 5);
        assert_eq!(ErrorCategory::RateLimit.max_retries(), 4);
        assert_eq!(ErrorCategory::Timeout.max_retries(), 3);
        assert_eq!(ErrorCategory::Context.max_retries(), 2);
        assert_eq!(ErrorCategory::Validation.max_retries(), 2);
        assert_eq!(ErrorCategory::Resource.max_retries(), 2);
        assert_eq!(ErrorCategory::Internal.max_retries(), 3);
    }
}
