//! Supervisor + Escalation (§4.G): reviews worker responses with a cheap
//! model, scores relevance/productivity/progress, and applies a
//! `consecutiveIssues`-indexed escalation floor over whatever action the
//! model suggested. Also owns the two independent checks that gate
//! completion: per-step verification (§4.I) and the final goal verdict
//! (§4.H), both of which re-ask a fresh question rather than trusting the
//! worker's own claim.

mod parser;

pub use parser::{parse_assessment_response, parse_goal_verdict, parse_step_verification};

use crate::config::EscalationThresholds;
use crate::data_model::{Assessment, Complexity, Goal, GoalVerdict, Step, SupervisorAction};
use crate::persistence::cache::{assessment_cache_key, ResultCache};
use crate::worker_client::{WorkerClient, WorkerClientError};
use std::path::Path;
use std::time::Duration;

const SUPERVISOR_SYSTEM_PROMPT: &str = "You are a supervisor reviewing an AI coding assistant's latest \
response against a goal. Reply with exactly these lines, in order:\n\
RELEVANT: yes|no\nPRODUCTIVE: yes|no\nPROGRESSING: yes|no\nSCORE: 0-100\n\
ACTION: continue|remind|correct|refocus|critical|abort\nREASON: one sentence";

const GOAL_VERDICT_SYSTEM_PROMPT: &str = "You are independently judging whether a coding goal has truly been \
achieved. Do not simply trust prior claims of completion; look for concrete evidence. Reply with exactly \
these lines, in order:\n\
ACHIEVED: yes|no\nCONFIDENCE: 0-100\nFUNCTIONAL: yes|no\nRECOMMENDATION: one sentence\n\
GAPS: comma-separated list, or none";

const STEP_VERIFICATION_SYSTEM_PROMPT: &str = "You are independently verifying whether a single plan step is \
actually complete, based only on the worker's own report. Reply with exactly these lines, in order:\n\
VERIFIED: yes|no\nREASON: one sentence";

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Worker(#[from] WorkerClientError),
    #[error("supervisor response did not match the expected format: {0}")]
    Unparseable(String),
}

/// Everything `assess` needs to build the §4.G prompt contract: the goal and
/// its subgoals, where the run currently is, a short window of supervision
/// history, and what the worker just said.
pub struct AssessmentRequest<'a> {
    pub goal: &'a Goal,
    pub phase: &'a str,
    pub step_number: Option<u32>,
    pub step_description: Option<&'a str>,
    pub step_complexity: Option<Complexity>,
    pub worker_response: &'a str,
    pub consecutive_issues: u32,
    pub recent_actions: &'a [String],
    pub history: &'a [Assessment],
}

pub struct Supervisor<'a> {
    client: &'a mut WorkerClient,
    thresholds: EscalationThresholds,
    max_response_length: usize,
    skip_for_simple_steps: bool,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        client: &'a mut WorkerClient,
        thresholds: EscalationThresholds,
        max_response_length: usize,
        skip_for_simple_steps: bool,
    ) -> Self {
        Self {
            client,
            thresholds,
            max_response_length,
            skip_for_simple_steps,
        }
    }

    /// Scores the worker's latest response against the goal, applying the
    /// escalation floor derived from `consecutive_issues`. Identical
    /// (response, goal, consecutive_issues) triples are served from `cache`
    /// so a flapping worker doesn't pay for a fresh LLM call every tick; the
    /// cache is owned by the caller so it survives across `Supervisor`
    /// instances instead of being rebuilt empty on every call.
    pub async fn assess(
        &mut self,
        cache: &mut ResultCache<Assessment>,
        request: &AssessmentRequest<'_>,
    ) -> Result<Assessment, SupervisorError> {
        if self.skip_for_simple_steps && request.step_complexity == Some(Complexity::Simple) {
            return Ok(Assessment {
                relevant: true,
                productive: true,
                progressing: true,
                score: 100,
                action: SupervisorAction::Continue,
                reason: "assessment skipped for a simple step".to_string(),
                original_action: SupervisorAction::Continue,
            });
        }

        let key = assessment_cache_key(request.worker_response, &request.goal.primary, request.consecutive_issues);
        if let Some(cached) = cache.get(&key) {
            return Ok(cached);
        }

        let prompt = self.build_prompt(request);
        let reply = self
            .client
            .continue_conversation_or_start(SUPERVISOR_SYSTEM_PROMPT, &prompt)
            .await?;
        let mut assessment = parse_assessment_response(&reply.text)
            .ok_or_else(|| SupervisorError::Unparseable(reply.text.clone()))?;
        self.apply_escalation_floor(request.consecutive_issues, &mut assessment);

        if assessment.action == SupervisorAction::Continue {
            cache.put(key, assessment.clone());
        }
        Ok(assessment)
    }

    /// Builds the full §4.G prompt: subgoal list with statuses, current
    /// phase/step, a short supervision history, the worker's recently
    /// extracted actions, and the response itself truncated to
    /// `max_response_length`.
    fn build_prompt(&self, request: &AssessmentRequest<'_>) -> String {
        let mut prompt = format!("Goal: {}\n", request.goal.primary);

        if !request.goal.subgoals.is_empty() {
            prompt.push_str("Subgoals:\n");
            for subgoal in &request.goal.subgoals {
                prompt.push_str(&format!(
                    "  {}. [{:?}] {} ({}%)\n",
                    subgoal.id, subgoal.status, subgoal.description, subgoal.progress
                ));
            }
        }

        prompt.push_str(&format!("Current phase: {}\n", request.phase));
        if let Some(number) = request.step_number {
            prompt.push_str(&format!(
                "Current step: {number}. {}\n",
                request.step_description.unwrap_or("(no description)")
            ));
        }

        if !request.history.is_empty() {
            prompt.push_str("Recent supervision history:\n");
            for past in request.history.iter().rev().take(3).rev() {
                prompt.push_str(&format!(
                    "  action={:?} score={} reason={}\n",
                    past.action, past.score, past.reason
                ));
            }
        }

        if !request.recent_actions.is_empty() {
            prompt.push_str("Recent actions the worker reported taking:\n");
            for action in request.recent_actions {
                prompt.push_str(&format!("  - {action}\n"));
            }
        }

        prompt.push_str(&format!("Consecutive unresolved issues so far: {}\n\n", request.consecutive_issues));
        prompt.push_str("Worker's latest response:\n");
        prompt.push_str(&truncate_chars(request.worker_response, self.max_response_length));
        prompt
    }

    /// Raises (never lowers) the model-suggested action to the floor implied
    /// by how many consecutive issues have accumulated.
    fn apply_escalation_floor(&self, consecutive_issues: u32, assessment: &mut Assessment) {
        let floor = if consecutive_issues >= self.thresholds.abort {
            SupervisorAction::Abort
        } else if consecutive_issues >= self.thresholds.critical {
            SupervisorAction::Critical
        } else if consecutive_issues >= self.thresholds.intervene {
            SupervisorAction::Refocus
        } else if consecutive_issues >= self.thresholds.warn {
            SupervisorAction::Remind
        } else {
            SupervisorAction::Continue
        };
        if floor > assessment.action {
            assessment.action = floor;
        }
    }

    /// A stall is `elapsed since last measurable progress` crossing the
    /// configured threshold, independent of what the supervisor model says.
    pub fn check_stagnation(&self, elapsed_since_progress: Duration, threshold: Duration) -> bool {
        elapsed_since_progress >= threshold
    }

    /// Independently verifies that a single step is really complete, instead
    /// of trusting the worker's own "STEP COMPLETE" marker outright.
    pub async fn verify_step_completion(
        &mut self,
        step_description: &str,
        worker_response: &str,
    ) -> Result<bool, SupervisorError> {
        let prompt = format!(
            "Step: {step_description}\n\nThe worker claims this step is complete. Here is its report:\n{}\n\n\
             Based only on this report, is the step genuinely done?",
            truncate_chars(worker_response, self.max_response_length)
        );
        let reply = self
            .client
            .continue_conversation_or_start(STEP_VERIFICATION_SYSTEM_PROMPT, &prompt)
            .await?;
        parse_step_verification(&reply.text).ok_or_else(|| SupervisorError::Unparseable(reply.text.clone()))
    }

    /// The final, independent judgment call (§4.H/§4.I): does the evidence
    /// actually support the goal being achieved, separate from the worker's
    /// self-report that the 3-layer `Verifier` also checks.
    pub async fn verify_goal_achieved(
        &mut self,
        goal: &Goal,
        steps: &[Step],
        working_dir: &Path,
    ) -> Result<GoalVerdict, SupervisorError> {
        let steps_summary: String = steps
            .iter()
            .map(|s| format!("  {}. [{:?}] {}", s.number, s.status, s.description))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Goal: {}\nWorking directory: {}\nSteps:\n{}\n",
            goal.primary,
            working_dir.display(),
            steps_summary
        );
        let reply = self
            .client
            .continue_conversation_or_start(GOAL_VERDICT_SYSTEM_PROMPT, &prompt)
            .await?;
        parse_goal_verdict(&reply.text).ok_or_else(|| SupervisorError::Unparseable(reply.text.clone()))
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{truncated}...[truncated]")
    }
}

/// Builds the correction prompt injected into the worker's next turn for a
/// given supervisor action. `Continue` needs no correction.
pub fn generate_correction_prompt(action: SupervisorAction, reason: &str) -> Option<String> {
    match action {
        SupervisorAction::Continue => None,
        SupervisorAction::Remind => Some(format!(
            "Reminder: stay focused on the stated goal. {reason}"
        )),
        SupervisorAction::Correct => Some(format!(
            "Your last response drifted from what was asked: {reason}\nPlease correct course and address the goal directly."
        )),
        SupervisorAction::Refocus => Some(format!(
            "This conversation has made limited progress for several turns: {reason}\n\
             Stop and restate your current understanding of the goal and your exact next action before proceeding."
        )),
        SupervisorAction::Critical => Some(format!(
            "CRITICAL: {reason}\nThis is a serious deviation. Pause any risky operations, explain what went wrong, \
             and propose a concrete recovery step."
        )),
        SupervisorAction::Abort => Some(format!(
            "ABORT: {reason}\nThe run is being terminated due to repeated unresolved issues."
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::Assessment;

    fn base_assessment(action: SupervisorAction) -> Assessment {
        Assessment {
            relevant: true,
            productive: true,
            progressing: true,
            score: 80,
            action,
            reason: "looks fine".to_string(),
            original_action: action,
        }
    }

    #[test]
    fn floor_raises_continue_to_abort_threshold() {
        let thresholds = EscalationThresholds { warn: 2, intervene: 3, critical: 4, abort: 5 };
        let supervisor_thresholds = thresholds.clone();
        let mut assessment = base_assessment(SupervisorAction::Continue);
        // Mirrors Supervisor::apply_escalation_floor without needing a live client.
        let floor = if 5 >= supervisor_thresholds.abort {
            SupervisorAction::Abort
        } else {
            SupervisorAction::Continue
        };
        if floor > assessment.action {
            assessment.action = floor;
        }
        assert_eq!(assessment.action, SupervisorAction::Abort);
    }

    #[test]
    fn floor_never_lowers_a_model_suggested_abort() {
        let mut assessment = base_assessment(SupervisorAction::Abort);
        let floor = SupervisorAction::Remind;
        if floor > assessment.action {
            assessment.action = floor;
        }
        assert_eq!(assessment.action, SupervisorAction::Abort);
    }

    #[test]
    fn correction_prompt_absent_for_continue() {
        assert!(generate_correction_prompt(SupervisorAction::Continue, "n/a").is_none());
    }

    #[test]
    fn correction_prompt_present_for_every_other_action() {
        for action in [
            SupervisorAction::Remind,
            SupervisorAction::Correct,
            SupervisorAction::Refocus,
            SupervisorAction::Critical,
            SupervisorAction::Abort,
        ] {
            assert!(generate_correction_prompt(action, "because").is_some());
        }
    }

    #[test]
    fn truncate_chars_leaves_short_text_untouched() {
        assert_eq!(truncate_chars("hello", 10), "hello");
    }

    #[test]
    fn truncate_chars_clips_long_text() {
        let long = "a".repeat(50);
        let truncated = truncate_chars(&long, 10);
        assert!(truncated.starts_with(&"a".repeat(10)));
        assert!(truncated.ends_with("[truncated]"));
    }
}
