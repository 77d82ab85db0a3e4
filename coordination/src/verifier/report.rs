//! Structured output of a verification run (§4.H).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub outcome: GateOutcome,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_excerpt: Option<String>,
}

/// The three verification layers (evidence, artifacts, build/test probes)
/// each contribute gate results; `passed` is true only if every gate that
/// ran reported `Passed` or was legitimately `Skipped` (nothing to probe).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierReport {
    pub working_dir: String,
    pub gates: Vec<GateResult>,
    pub passed: bool,
    pub generated_at: DateTime<Utc>,
    pub total_duration_ms: u64,
}

impl VerifierReport {
    pub fn new(working_dir: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            gates: Vec::new(),
            passed: true,
            generated_at: Utc::now(),
            total_duration_ms: 0,
        }
    }

    pub fn add_gate(&mut self, result: GateResult) {
        if result.outcome == GateOutcome::Failed {
            self.passed = false;
        }
        self.gates.push(result);
    }

    pub fn failed_gates(&self) -> Vec<&GateResult> {
        self.gates.iter().filter(|g| g.outcome == GateOutcome::Failed).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_failed_gate_marks_the_report_failed() {
        let mut report = VerifierReport::new("/tmp/work");
        report.add_gate(GateResult {
            gate: "build".to_string(),
            outcome: GateOutcome::Passed,
            duration_ms: 10,
            exit_code: Some(0),
            stderr_excerpt: None,
        });
        assert!(report.passed);
        report.add_gate(GateResult {
            gate: "test".to_string(),
            outcome: GateOutcome::Failed,
            duration_ms: 10,
            exit_code: Some(1),
            stderr_excerpt: Some("assertion failed".to_string()),
        });
        assert!(!report.passed);
        assert_eq!(report.failed_gates().len(), 1);
    }
}
