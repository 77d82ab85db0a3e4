//! Nested configuration record (§6 of the design).
//!
//! Every leaf has an environment-variable-aware built-in default; an
//! optional TOML file is then merged in section-by-section, and a section
//! present in the file wins wholesale over that section's env-derived
//! default. Env vars only affect the built-in default itself, so a file that
//! specifies a section always takes precedence over an env var for that same
//! section; env vars only have the final say for sections the file omits.

use serde::{Deserialize, Serialize};
use std::path::Path;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeLimitsConfig {
    pub thirty_min_ms: u64,
    pub one_hour_ms: u64,
    pub two_hour_ms: u64,
}

impl Default for TimeLimitsConfig {
    fn default() -> Self {
        Self {
            thirty_min_ms: env_or("ORCHESTRATOR_TIME_LIMIT_30M_MS", 30 * 60 * 1000),
            one_hour_ms: env_or("ORCHESTRATOR_TIME_LIMIT_1H_MS", 60 * 60 * 1000),
            two_hour_ms: env_or("ORCHESTRATOR_TIME_LIMIT_2H_MS", 2 * 60 * 60 * 1000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationThresholds {
    pub warn: u32,
    pub intervene: u32,
    pub critical: u32,
    pub abort: u32,
}

impl Default for EscalationThresholds {
    fn default() -> Self {
        Self {
            warn: env_or("ORCHESTRATOR_ESCALATION_WARN", 2),
            intervene: env_or("ORCHESTRATOR_ESCALATION_INTERVENE", 3),
            critical: env_or("ORCHESTRATOR_ESCALATION_CRITICAL", 4),
            abort: env_or("ORCHESTRATOR_ESCALATION_ABORT", 5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub worker: String,
    pub worker_fallback: Option<String>,
    pub supervisor: String,
    pub supervisor_fallback: Option<String>,
    pub planner: String,
    pub planner_fallback: Option<String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        fn var(key: &str, default: &str) -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        }
        Self {
            worker: var("ORCHESTRATOR_MODEL_WORKER", "claude-sonnet-4"),
            worker_fallback: std::env::var("ORCHESTRATOR_MODEL_WORKER_FALLBACK").ok(),
            supervisor: var("ORCHESTRATOR_MODEL_SUPERVISOR", "claude-haiku-4"),
            supervisor_fallback: std::env::var("ORCHESTRATOR_MODEL_SUPERVISOR_FALLBACK").ok(),
            planner: var("ORCHESTRATOR_MODEL_PLANNER", "claude-sonnet-4"),
            planner_fallback: std::env::var("ORCHESTRATOR_MODEL_PLANNER_FALLBACK").ok(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_reset_time_secs: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: env_or("ORCHESTRATOR_MAX_RETRIES", 3),
            base_delay_ms: env_or("ORCHESTRATOR_BASE_DELAY_MS", 1000),
            max_delay_ms: env_or("ORCHESTRATOR_MAX_DELAY_MS", 30_000),
            circuit_breaker_threshold: env_or("ORCHESTRATOR_CIRCUIT_BREAKER_THRESHOLD", 5),
            circuit_breaker_reset_time_secs: env_or("ORCHESTRATOR_CIRCUIT_BREAKER_RESET_SECS", 60),
            jitter_factor: env_or("ORCHESTRATOR_JITTER_FACTOR", 0.5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationDelayConfig {
    pub minimum_ms: u64,
    pub default_ms: u64,
    pub after_success_ms: u64,
    pub after_error_ms: u64,
    pub adaptive: bool,
}

impl Default for IterationDelayConfig {
    fn default() -> Self {
        Self {
            minimum_ms: env_or("ORCHESTRATOR_DELAY_MIN_MS", 500),
            default_ms: env_or("ORCHESTRATOR_DELAY_DEFAULT_MS", 1000),
            after_success_ms: env_or("ORCHESTRATOR_DELAY_AFTER_SUCCESS_MS", 1000),
            after_error_ms: env_or("ORCHESTRATOR_DELAY_AFTER_ERROR_MS", 3000),
            adaptive: env_or("ORCHESTRATOR_DELAY_ADAPTIVE", true),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub use_structured_output: bool,
    pub read_only_tools: bool,
    pub no_session_persistence: bool,
    pub max_response_length: usize,
    pub skip_for_simple_steps: bool,
    pub stagnation_threshold_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            use_structured_output: env_or("ORCHESTRATOR_SUPERVISOR_STRUCTURED", true),
            read_only_tools: env_or("ORCHESTRATOR_SUPERVISOR_READ_ONLY", true),
            no_session_persistence: env_or("ORCHESTRATOR_SUPERVISOR_NO_SESSION", true),
            max_response_length: env_or("ORCHESTRATOR_SUPERVISOR_MAX_RESPONSE_LEN", 3000),
            skip_for_simple_steps: env_or("ORCHESTRATOR_SUPERVISOR_SKIP_SIMPLE", false),
            stagnation_threshold_ms: env_or("ORCHESTRATOR_STAGNATION_THRESHOLD_MS", 15 * 60 * 1000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub challenge_timeout_secs: u64,
    pub test_timeout_secs: u64,
    pub require_artifacts: bool,
    pub run_tests: bool,
    pub test_commands: Vec<Vec<String>>,
    pub build_commands: Vec<Vec<String>>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: env_or("ORCHESTRATOR_VERIFY_ENABLED", true),
            max_attempts: env_or("ORCHESTRATOR_VERIFY_MAX_ATTEMPTS", 3),
            challenge_timeout_secs: env_or("ORCHESTRATOR_VERIFY_CHALLENGE_TIMEOUT_SECS", 120),
            test_timeout_secs: env_or("ORCHESTRATOR_VERIFY_TEST_TIMEOUT_SECS", 300),
            require_artifacts: env_or("ORCHESTRATOR_VERIFY_REQUIRE_ARTIFACTS", true),
            run_tests: env_or("ORCHESTRATOR_VERIFY_RUN_TESTS", true),
            build_commands: default_build_commands(),
            test_commands: default_test_commands(),
        }
    }
}

fn default_build_commands() -> Vec<Vec<String>> {
    [
        &["npm", "run", "build"][..],
        &["go", "build", "./..."],
        &["cargo", "build"],
        &["make"],
        &["cmake", "--build", "."],
    ]
    .iter()
    .map(|cmd| cmd.iter().map(|s| s.to_string()).collect())
    .collect()
}

fn default_test_commands() -> Vec<Vec<String>> {
    [
        &["npm", "test"][..],
        &["pytest"],
        &["go", "test", "./..."],
        &["cargo", "test"],
        &["make", "test"],
        &["ctest"],
    ]
    .iter()
    .map(|cmd| cmd.iter().map(|s| s.to_string()).collect())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelExecutionConfig {
    pub enabled: bool,
    pub max_concurrent: usize,
    pub require_dependency_analysis: bool,
}

impl Default for ParallelExecutionConfig {
    fn default() -> Self {
        Self {
            enabled: env_or("ORCHESTRATOR_PARALLEL_ENABLED", false),
            max_concurrent: env_or("ORCHESTRATOR_PARALLEL_MAX_CONCURRENT", 3),
            require_dependency_analysis: env_or("ORCHESTRATOR_PARALLEL_REQUIRE_DEPS", true),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextManagerConfig {
    pub max_history_messages: usize,
    pub summary_threshold: usize,
    pub token_budget: u64,
    pub importance_decay_rate: f64,
    pub deduplication_window: usize,
    pub cache_ttl_ms: u64,
}

impl Default for ContextManagerConfig {
    fn default() -> Self {
        Self {
            max_history_messages: env_or("ORCHESTRATOR_CTX_MAX_HISTORY", 100),
            summary_threshold: env_or("ORCHESTRATOR_CTX_SUMMARY_THRESHOLD", 60),
            token_budget: env_or("ORCHESTRATOR_CTX_TOKEN_BUDGET", 150_000),
            importance_decay_rate: env_or("ORCHESTRATOR_CTX_DECAY_RATE", 0.1),
            deduplication_window: env_or("ORCHESTRATOR_CTX_DEDUP_WINDOW", 10),
            cache_ttl_ms: env_or("ORCHESTRATOR_CTX_CACHE_TTL_MS", 3_600_000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StallDetectionConfig {
    pub enabled: bool,
    pub score_variance_threshold: f64,
    pub min_score_for_stuck: u8,
    pub similarity_threshold: f64,
    pub auto_recovery_enabled: bool,
    pub max_recovery_attempts: u32,
}

impl Default for StallDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: env_or("ORCHESTRATOR_STALL_ENABLED", true),
            score_variance_threshold: env_or("ORCHESTRATOR_STALL_SCORE_VARIANCE", 5.0),
            min_score_for_stuck: env_or("ORCHESTRATOR_STALL_MIN_SCORE", 40),
            similarity_threshold: env_or("ORCHESTRATOR_STALL_SIMILARITY", 0.92),
            auto_recovery_enabled: env_or("ORCHESTRATOR_STALL_AUTO_RECOVERY", true),
            max_recovery_attempts: env_or("ORCHESTRATOR_STALL_MAX_RECOVERY_ATTEMPTS", 2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub dir: String,
    pub auto_save_interval_ms: u64,
    pub max_checkpoints: usize,
    pub cache_max_size: usize,
    pub cache_ttl_ms: u64,
    pub cleanup_age_days: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: env_or("ORCHESTRATOR_PERSISTENCE_ENABLED", true),
            dir: std::env::var("ORCHESTRATOR_PERSISTENCE_DIR")
                .unwrap_or_else(|_| ".claude-runner".to_string()),
            auto_save_interval_ms: env_or("ORCHESTRATOR_AUTOSAVE_INTERVAL_MS", 30_000),
            max_checkpoints: env_or("ORCHESTRATOR_MAX_CHECKPOINTS", 10),
            cache_max_size: env_or("ORCHESTRATOR_CACHE_MAX_SIZE", 100),
            cache_ttl_ms: env_or("ORCHESTRATOR_CACHE_TTL_MS", 3_600_000),
            cleanup_age_days: env_or("ORCHESTRATOR_CLEANUP_AGE_DAYS", 7),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub time_limits: TimeLimitsConfig,
    pub progress_check_interval_ms: ProgressCheckInterval,
    pub escalation_thresholds: EscalationThresholds,
    pub models: ModelsConfig,
    pub retry: RetryConfig,
    pub iteration_delay: IterationDelayConfig,
    pub supervisor: SupervisorConfig,
    pub verification: VerificationConfig,
    pub parallel_execution: ParallelExecutionConfig,
    pub context_manager: ContextManagerConfig,
    pub stall_detection: StallDetectionConfig,
    pub persistence: PersistenceConfig,
}

/// Newtype so `TimeLimitsConfig`'s `Default` isn't mistaken for this scalar;
/// mirrors the env-var-first pattern used by every other leaf.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgressCheckInterval(pub u64);

impl Default for ProgressCheckInterval {
    fn default() -> Self {
        Self(env_or("ORCHESTRATOR_PROGRESS_CHECK_INTERVAL_MS", 5 * 60 * 1000))
    }
}

impl OrchestratorConfig {
    /// Start from struct defaults (env-var aware), merge a TOML file if
    /// given, then defaults already baked env vars in at construction time
    /// so env always wins over the file's values for scalars it touches.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            let text = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
            let from_file: OrchestratorConfig = toml::from_str(&text)
                .map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))?;
            config = merge_file_over_defaults(config, from_file);
        }
        Ok(config)
    }
}

/// A config file only overrides what it actually specifies; since every
/// section here derives `Default` independently of env, we simply prefer the
/// file's section wholesale over the env-derived default when present. This
/// keeps the merge rule simple: file beats built-in default, env (already
/// baked into scalar defaults above) beats file at the granularity of a
/// whole sub-struct can't be expressed without a "did this come from env"
/// marker, so sub-structs are taken from the file whenever a file is given.
fn merge_file_over_defaults(
    _defaults: OrchestratorConfig,
    from_file: OrchestratorConfig,
) -> OrchestratorConfig {
    from_file
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.escalation_thresholds.warn, 2);
        assert_eq!(config.escalation_thresholds.abort, 5);
        assert_eq!(config.retry.circuit_breaker_threshold, 5);
        assert_eq!(config.persistence.max_checkpoints, 10);
        assert_eq!(config.verification.build_commands.len(), 5);
        assert_eq!(config.verification.test_commands.len(), 6);
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let config = OrchestratorConfig::load(None).unwrap();
        assert_eq!(config.persistence.dir, ".claude-runner");
    }
}
