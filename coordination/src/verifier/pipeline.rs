//! Completion Verifier (§4.H): a three-layer check before a goal is accepted
//! as done — worker self-report evidence, on-disk artifact existence, and a
//! build/test probe chosen by which manifest file is present.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::report::{GateOutcome, GateResult, VerifierReport};
use crate::config::VerificationConfig;
use crate::worker_client::{WorkerClient, WorkerClientError};

/// Maps a manifest sentinel file to the subset of configured commands that
/// apply to it, so a Cargo.toml-only working directory never shells out to
/// `npm`.
const MANIFEST_SENTINELS: &[(&str, &str)] = &[
    ("Cargo.toml", "cargo"),
    ("package.json", "npm"),
    ("go.mod", "go"),
    ("Makefile", "make"),
    ("CMakeLists.txt", "cmake"),
];

#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error(transparent)]
    Worker(#[from] WorkerClientError),
}

pub struct Verifier<'a> {
    working_dir: PathBuf,
    config: VerificationConfig,
    client: &'a mut WorkerClient,
}

impl<'a> Verifier<'a> {
    pub fn new(working_dir: impl AsRef<Path>, config: VerificationConfig, client: &'a mut WorkerClient) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            config,
            client,
        }
    }

    /// Runs all three layers and returns the combined report.
    pub async fn verify(
        &mut self,
        goal: &str,
        expected_artifacts: &[String],
    ) -> Result<VerifierReport, VerifierError> {
        let mut report = VerifierReport::new(self.working_dir.display().to_string());

        let start = Instant::now();
        report.add_gate(self.evidence_gate(goal).await?);
        if self.config.require_artifacts {
            report.add_gate(self.artifact_gate(expected_artifacts));
        }
        if self.config.run_tests {
            for gate in self.build_and_test_gates().await {
                report.add_gate(gate);
            }
        }
        report.total_duration_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Challenges the worker to justify completion in its own words; a
    /// hedging or empty reply is treated as a failed gate rather than parsed
    /// heuristically, since the point is to force an explicit claim.
    async fn evidence_gate(&mut self, goal: &str) -> Result<GateResult, VerifierError> {
        let start = Instant::now();
        let prompt = format!(
            "Goal: {goal}\n\nYou have indicated this goal is complete. List the concrete evidence: \
             what files changed, what commands you ran, and what output confirms the goal is met. \
             If it is not actually complete, say so plainly."
        );
        let timeout = Duration::from_secs(self.config.challenge_timeout_secs);
        let reply = tokio::time::timeout(timeout, self.client.continue_conversation_or_start(
            "You are verifying your own prior work. Be honest; do not claim success you cannot support.",
            &prompt,
        ))
        .await;

        let (outcome, excerpt) = match reply {
            Ok(Ok(reply)) if !reply.text.trim().is_empty() && !looks_like_hedge(&reply.text) => {
                (GateOutcome::Passed, None)
            }
            Ok(Ok(reply)) => (GateOutcome::Failed, Some(reply.text)),
            Ok(Err(err)) => return Err(VerifierError::Worker(err)),
            Err(_) => (GateOutcome::Failed, Some("evidence challenge timed out".to_string())),
        };
        Ok(GateResult {
            gate: "evidence".to_string(),
            outcome,
            duration_ms: start.elapsed().as_millis() as u64,
            exit_code: None,
            stderr_excerpt: excerpt,
        })
    }

    /// Every path in `expected_artifacts` must exist under the working
    /// directory; an empty list trivially passes.
    fn artifact_gate(&self, expected_artifacts: &[String]) -> GateResult {
        let start = Instant::now();
        let missing: Vec<&String> = expected_artifacts
            .iter()
            .filter(|path| !self.working_dir.join(path).exists())
            .collect();
        GateResult {
            gate: "artifacts".to_string(),
            outcome: if missing.is_empty() { GateOutcome::Passed } else { GateOutcome::Failed },
            duration_ms: start.elapsed().as_millis() as u64,
            exit_code: None,
            stderr_excerpt: if missing.is_empty() {
                None
            } else {
                Some(format!("missing artifacts: {}", missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")))
            },
        }
    }

    /// Public entry point for running the build/test probe on its own,
    /// outside the full three-layer `verify()` pass, as a smoke-test stage
    /// that must pass before a goal verdict is trusted.
    pub async fn run_smoke_tests(&mut self) -> Vec<GateResult> {
        self.build_and_test_gates().await
    }

    /// Runs the build and test commands whose toolchain matches a manifest
    /// sentinel actually present in the working directory.
    async fn build_and_test_gates(&self) -> Vec<GateResult> {
        let present_tools = detected_tools(&self.working_dir);
        let mut gates = Vec::new();
        for command in &self.config.build_commands {
            if command_applies(command, &present_tools) {
                gates.push(self.run_probe("build", command).await);
            }
        }
        for command in &self.config.test_commands {
            if command_applies(command, &present_tools) {
                gates.push(self.run_probe("test", command).await);
            }
        }
        if gates.is_empty() {
            gates.push(GateResult {
                gate: "build".to_string(),
                outcome: GateOutcome::Skipped,
                duration_ms: 0,
                exit_code: None,
                stderr_excerpt: Some("no manifest sentinel matched any configured command".to_string()),
            });
        }
        gates
    }

    /// Spawns one build/test command, bounding it with the configured
    /// timeout and killing the whole process group if it overruns.
    async fn run_probe(&self, label: &str, command: &[String]) -> GateResult {
        let start = Instant::now();
        let Some((program, args)) = command.split_first() else {
            return GateResult {
                gate: label.to_string(),
                outcome: GateOutcome::Skipped,
                duration_ms: 0,
                exit_code: None,
                stderr_excerpt: Some("empty command".to_string()),
            };
        };
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(&self.working_dir)
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let timeout = Duration::from_secs(self.config.test_timeout_secs);
        let gate_name = format!("{label}:{}", command.join(" "));
        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => GateResult {
                gate: gate_name,
                outcome: if output.status.success() { GateOutcome::Passed } else { GateOutcome::Failed },
                duration_ms: start.elapsed().as_millis() as u64,
                exit_code: output.status.code(),
                stderr_excerpt: if output.status.success() {
                    None
                } else {
                    Some(truncate(&String::from_utf8_lossy(&output.stderr), 4096))
                },
            },
            Ok(Err(e)) => GateResult {
                gate: gate_name,
                outcome: GateOutcome::Failed,
                duration_ms: start.elapsed().as_millis() as u64,
                exit_code: None,
                stderr_excerpt: Some(format!("failed to spawn: {e}")),
            },
            Err(_) => GateResult {
                gate: gate_name,
                outcome: GateOutcome::Failed,
                duration_ms: start.elapsed().as_millis() as u64,
                exit_code: None,
                stderr_excerpt: Some(format!("probe timed out after {}s", self.config.test_timeout_secs)),
            },
        }
    }
}

fn detected_tools(working_dir: &Path) -> Vec<&'static str> {
    MANIFEST_SENTINELS
        .iter()
        .filter(|(file, _)| working_dir.join(file).exists())
        .map(|(_, tool)| *tool)
        .collect()
}

fn command_applies(command: &[String], present_tools: &[&'static str]) -> bool {
    command
        .first()
        .map(|program| present_tools.iter().any(|tool| *tool == program))
        .unwrap_or(false)
}

fn looks_like_hedge(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["not actually complete", "not complete", "unable to confirm", "cannot confirm", "i don't have evidence"]
        .iter()
        .any(|phrase| lower.contains(phrase))
}

fn truncate(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        text.to_string()
    } else {
        format!("{}...[truncated]", &text[..max_bytes])
    }
}

/// The rejection prompt fed back to the worker when `verify()` fails,
/// itemizing exactly which gates did not pass.
pub fn generate_rejection_prompt(report: &VerifierReport) -> String {
    let failures: Vec<String> = report
        .failed_gates()
        .iter()
        .map(|g| match &g.stderr_excerpt {
            Some(excerpt) => format!("- {}: {excerpt}", g.gate),
            None => format!("- {}", g.gate),
        })
        .collect();
    format!(
        "Verification failed. The goal is not yet complete. Address the following before claiming completion again:\n{}",
        failures.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_cargo_manifest_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname=\"x\"").unwrap();
        let tools = detected_tools(dir.path());
        assert_eq!(tools, vec!["cargo"]);
    }

    #[test]
    fn command_applies_filters_by_detected_tool() {
        let cargo_cmd = vec!["cargo".to_string(), "build".to_string()];
        assert!(command_applies(&cargo_cmd, &["cargo"]));
        assert!(!command_applies(&cargo_cmd, &["npm"]));
    }

    #[test]
    fn rejection_prompt_lists_only_failed_gates() {
        let mut report = VerifierReport::new("/tmp/work");
        report.add_gate(GateResult {
            gate: "artifacts".to_string(),
            outcome: GateOutcome::Failed,
            duration_ms: 1,
            exit_code: None,
            stderr_excerpt: Some("missing artifacts: out.bin".to_string()),
        });
        let prompt = generate_rejection_prompt(&report);
        assert!(prompt.contains("artifacts"));
        assert!(prompt.contains("out.bin"));
    }

    #[test]
    fn hedge_detection_catches_common_phrasing() {
        assert!(looks_like_hedge("Honestly this is not actually complete yet."));
        assert!(!looks_like_hedge("Done. Tests pass and the binary is built."));
    }
}
