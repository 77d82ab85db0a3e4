//! Workflow Engine (§4.I): the top-level phase state machine driving a run
//! from planning through verification.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

use crate::config::OrchestratorConfig;
use crate::data_model::{Assessment, Checkpoint, Goal, Plan, SupervisorAction, WorkflowStatus};
use crate::error_recovery::{ContextAction, Decision, ErrorRecovery};
use crate::events::{EventBus, SharedEventBus, WorkflowEvent};
use crate::goal_tracker::GoalTracker;
use crate::persistence::{goal_hash, PersistenceStore, ResultCache, SessionRecord, SessionRecordStatus};
use crate::phase_manager::PhaseManager;
use crate::planner::Planner;
use crate::supervisor::{generate_correction_prompt, AssessmentRequest, Supervisor};
use crate::verifier::{generate_rejection_prompt, GateOutcome, Verifier};
use crate::worker_client::{WorkerClient, WorkerClientConfig};

const DUPLICATE_RESPONSE_WINDOW: usize = 3;
/// How many past assessments are kept for the supervisor prompt's "recent
/// supervision history" section.
const SUPERVISION_HISTORY_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowPhase {
    Init,
    Planning,
    PlanReview,
    Execution,
    Verification,
    Completed,
    VerificationFailed,
    TimeExpired,
    Aborted,
    Stopped,
}

impl WorkflowPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::VerificationFailed | Self::TimeExpired | Self::Aborted | Self::Stopped
        )
    }
}

/// Legal `(from, to)` phase transitions, per the run diagram
/// init → PLANNING → PLAN_REVIEW → EXECUTION → VERIFICATION →
/// {completed|verification_failed|time_expired|aborted|stopped}, with
/// EXECUTION ⇄ VERIFICATION allowed to loop on a failed verification attempt
/// and any non-terminal phase able to fall through to time_expired/aborted.
fn is_legal_transition(from: WorkflowPhase, to: WorkflowPhase) -> bool {
    use WorkflowPhase::*;
    if from.is_terminal() {
        return false;
    }
    match (from, to) {
        (Init, Planning) => true,
        (Planning, PlanReview) => true,
        (PlanReview, Execution) => true,
        (PlanReview, Planning) => true,
        (Execution, Verification) => true,
        (Execution, Execution) => true,
        (Verification, Completed) => true,
        (Verification, VerificationFailed) => true,
        (Verification, Execution) => true,
        (_, TimeExpired) => true,
        (_, Aborted) => true,
        (_, Stopped) => true,
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: WorkflowPhase,
    pub to: WorkflowPhase,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Worker(#[from] crate::worker_client::WorkerClientError),
    #[error(transparent)]
    Planner(#[from] crate::planner::PlannerError),
    #[error(transparent)]
    Supervisor(#[from] crate::supervisor::SupervisorError),
    #[error(transparent)]
    Verifier(#[from] crate::verifier::VerifierError),
    #[error(transparent)]
    Persistence(#[from] crate::persistence::PersistenceError),
    #[error("illegal phase transition {from:?} -> {to:?}")]
    IllegalTransition { from: WorkflowPhase, to: WorkflowPhase },
}

static ACTION_VERB_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[\s\-*]*\b(ran|wrote|created|updated|fixed|added|removed|refactored|tested|deployed|installed|configured)\b[^.\n]*").unwrap()
});

/// Matches an explicit "STEP COMPLETE" marker a worker is expected to emit
/// when it believes the current step is finished. Presence of the marker is
/// only the trigger for independent verification, not proof of completion by
/// itself.
static STEP_COMPLETE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)STEP\s+COMPLETE\b").unwrap());

pub struct WorkflowEngine {
    config: OrchestratorConfig,
    working_dir: PathBuf,
    session_id: String,

    phase: WorkflowPhase,
    transitions: Vec<TransitionRecord>,

    phase_manager: PhaseManager,
    goal_tracker: GoalTracker,
    error_recovery: ErrorRecovery,
    persistence: PersistenceStore,
    events: SharedEventBus,

    worker: WorkerClient,
    planner_client: WorkerClient,
    supervisor_client: WorkerClient,

    plan: Option<Plan>,

    consecutive_issues: u32,
    verification_attempts: u32,
    last_progress_check: DateTime<Utc>,
    last_autosave_at: DateTime<Utc>,
    last_meaningful_progress_at: DateTime<Utc>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
    recent_responses: VecDeque<String>,

    /// Survives across iterations so repeated identical assessments are
    /// served from cache instead of re-querying the supervisor model.
    assessment_cache: ResultCache<Assessment>,
    /// Bounded window of past assessments, fed into the supervisor prompt as
    /// short-term history.
    supervision_history: Vec<Assessment>,
    /// A worker reply to a correction/rejection/progress-check follow-up,
    /// held until the next step prompt so it still reaches the next
    /// assessment pass instead of being discarded.
    pending_worker_note: Option<String>,
}

pub struct RunReport {
    pub status: WorkflowStatus,
    pub transitions: Vec<TransitionRecord>,
    pub overall_progress: u8,
}

impl WorkflowEngine {
    pub fn new(goal: Goal, working_dir: PathBuf, time_limit: Duration, config: OrchestratorConfig) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let phase_names = goal.subgoals.iter().map(|s| s.description.clone()).collect();
        let progress_interval = Duration::from_millis(config.progress_check_interval_ms.0);
        let now = Utc::now();
        Self {
            persistence: PersistenceStore::new(&working_dir, config.persistence.clone()),
            phase_manager: PhaseManager::new(time_limit, phase_names, progress_interval),
            goal_tracker: GoalTracker::new(goal),
            error_recovery: ErrorRecovery::new(config.retry.clone()),
            events: EventBus::new().shared(),
            worker: WorkerClient::new(
                WorkerClientConfig::worker(config.models.worker.clone(), config.models.worker_fallback.clone()),
                working_dir.clone(),
            ),
            planner_client: WorkerClient::new(
                WorkerClientConfig::planner(config.models.planner.clone()),
                working_dir.clone(),
            ),
            supervisor_client: WorkerClient::new(
                WorkerClientConfig::supervisor(config.models.supervisor.clone()),
                working_dir.clone(),
            ),
            plan: None,
            consecutive_issues: 0,
            verification_attempts: 0,
            last_progress_check: now,
            last_autosave_at: now,
            last_meaningful_progress_at: now,
            stopped: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            recent_responses: VecDeque::with_capacity(DUPLICATE_RESPONSE_WINDOW),
            assessment_cache: ResultCache::new(config.persistence.cache_max_size, Duration::from_millis(config.persistence.cache_ttl_ms)),
            supervision_history: Vec::new(),
            pending_worker_note: None,
            config,
            working_dir,
            session_id,
            phase: WorkflowPhase::Init,
            transitions: Vec::new(),
        }
    }

    pub fn events(&self) -> SharedEventBus {
        self.events.clone()
    }

    /// External stop request (e.g. Ctrl-C handler); observed at the top of
    /// the next iteration.
    pub fn stop_handle(&self) -> Arc<std::sync::atomic::AtomicBool> {
        self.stopped.clone()
    }

    /// Restores a prior session's plan and position so `run()` continues it
    /// instead of starting over. Only the plan and session id survive a
    /// restart; escalation counters and verification attempts reset.
    pub fn resume_from(&mut self, record: SessionRecord) {
        self.session_id = record.session_id;
        self.goal_tracker.goal_mut().primary = record.goal_primary;
        self.phase = if record.plan.is_some() { WorkflowPhase::Execution } else { WorkflowPhase::Init };
        self.plan = record.plan;
    }

    fn transition(&mut self, to: WorkflowPhase, reason: impl Into<String>) -> Result<(), EngineError> {
        if !is_legal_transition(self.phase, to) {
            return Err(EngineError::IllegalTransition { from: self.phase, to });
        }
        let reason = reason.into();
        self.transitions.push(TransitionRecord { from: self.phase, to, reason: reason.clone(), at: Utc::now() });
        self.events.publish(WorkflowEvent::PhaseTransition {
            from: format!("{:?}", self.phase),
            to: format!("{to:?}"),
            timestamp: Utc::now(),
        });
        self.phase = to;
        Ok(())
    }

    /// Drives iterations until a terminal phase is reached.
    pub async fn run(&mut self) -> Result<RunReport, EngineError> {
        self.persistence.initialize().await?;
        match self.persistence.cleanup().await {
            Ok(removed) if removed > 0 => tracing::info!(removed, "cleaned up stale sessions"),
            Ok(_) => {}
            Err(err) => tracing::warn!(%err, "session cleanup failed, continuing"),
        }
        if self.phase == WorkflowPhase::Init {
            self.transition(WorkflowPhase::Planning, "starting run")?;
        }

        loop {
            if self.stopped.load(std::sync::atomic::Ordering::SeqCst) {
                self.transition(WorkflowPhase::Stopped, "external stop request")?;
                self.events
                    .publish(WorkflowEvent::Abort { reason: "stopped by operator".into(), timestamp: Utc::now() });
                break;
            }
            if self.phase_manager.remaining().is_zero() {
                self.transition(WorkflowPhase::TimeExpired, "time budget exhausted")?;
                break;
            }
            self.run_iteration().await?;
            if self.phase.is_terminal() {
                break;
            }
            let delay = self.adaptive_delay();
            tokio::time::sleep(delay).await;
        }

        let status = match self.phase {
            WorkflowPhase::Completed => WorkflowStatus::Completed,
            WorkflowPhase::VerificationFailed => WorkflowStatus::VerificationFailed,
            WorkflowPhase::TimeExpired => WorkflowStatus::TimeExpired,
            WorkflowPhase::Stopped => WorkflowStatus::Stopped,
            _ => WorkflowStatus::Aborted,
        };
        self.events
            .publish(WorkflowEvent::WorkflowFinished { status, timestamp: Utc::now() });
        Ok(RunReport {
            status,
            transitions: self.transitions.clone(),
            overall_progress: self.goal_tracker.overall_progress(),
        })
    }

    /// Builds and reviews a plan without executing any steps, for `--dry-run`.
    /// Stops as soon as the phase leaves `PlanReview` (either into `Execution`,
    /// meaning the plan was accepted, or back into `Planning` for a redraft,
    /// in which case this runs the redraft once more before returning).
    pub async fn plan_only(&mut self) -> Result<Option<Plan>, EngineError> {
        self.persistence.initialize().await?;
        self.transition(WorkflowPhase::Planning, "dry run: planning only")?;
        self.run_planning().await?;
        self.run_plan_review().await?;
        if self.phase == WorkflowPhase::Planning {
            self.run_planning().await?;
        }
        Ok(self.plan.clone())
    }

    fn current_step_number_or_zero(&self) -> u32 {
        self.plan.as_ref().and_then(|p| p.current_step()).map(|s| s.number).unwrap_or(0)
    }

    async fn run_iteration(&mut self) -> Result<(), EngineError> {
        if let Some((_, prompt)) = self.phase_manager.check_time_pressure() {
            if self.worker.session().session_id.is_some() {
                let step_number = self.current_step_number_or_zero();
                self.send_followup(step_number, &prompt).await?;
            }
        }
        self.phase_manager.record_checkpoint();

        if self.phase_manager.is_time_for_progress_check(self.last_progress_check) {
            self.last_progress_check = Utc::now();
            if self.worker.session().session_id.is_some() {
                let prompt = format!(
                    "Progress check: the goal tracker estimates {}% overall progress. \
                     Briefly confirm or correct this and state what remains.",
                    self.goal_tracker.overall_progress()
                );
                let step_number = self.current_step_number_or_zero();
                self.send_followup(step_number, &prompt).await?;
            }
        }

        match self.phase {
            WorkflowPhase::Planning => self.run_planning().await,
            WorkflowPhase::PlanReview => self.run_plan_review().await,
            WorkflowPhase::Execution => self.run_execution().await,
            WorkflowPhase::Verification => self.run_verification().await,
            _ => Ok(()),
        }
    }

    async fn run_planning(&mut self) -> Result<(), EngineError> {
        let goal_text = self.goal_tracker.goal().primary.clone();
        let plan = {
            let mut planner = Planner::new(&mut self.planner_client);
            planner.create_plan(&goal_text).await?
        };
        self.plan = Some(plan);
        self.save_session(SessionRecordStatus::Active).await?;
        self.transition(WorkflowPhase::PlanReview, "plan drafted")
    }

    /// A lightweight self-review gate: the supervisor model scores the plan
    /// the same way it scores a worker response, reusing the escalation
    /// ladder's `Refocus` action as the signal to redraft.
    async fn run_plan_review(&mut self) -> Result<(), EngineError> {
        let plan_summary = self
            .plan
            .as_ref()
            .map(|p| p.steps.iter().map(|s| s.description.clone()).collect::<Vec<_>>().join("; "))
            .unwrap_or_default();
        let assessment = {
            let goal = self.goal_tracker.goal().clone();
            let phase_str = format!("{:?}", self.phase);
            let request = AssessmentRequest {
                goal: &goal,
                phase: &phase_str,
                step_number: None,
                step_description: None,
                step_complexity: None,
                worker_response: &plan_summary,
                consecutive_issues: 0,
                recent_actions: &[],
                history: &self.supervision_history,
            };
            let mut supervisor = Supervisor::new(
                &mut self.supervisor_client,
                self.config.escalation_thresholds.clone(),
                self.config.supervisor.max_response_length,
                self.config.supervisor.skip_for_simple_steps,
            );
            supervisor.assess(&mut self.assessment_cache, &request).await?
        };
        if assessment.action == SupervisorAction::Refocus {
            self.transition(WorkflowPhase::Planning, "plan review rejected the draft plan")
        } else {
            self.transition(WorkflowPhase::Execution, "plan accepted")
        }
    }

    async fn run_execution(&mut self) -> Result<(), EngineError> {
        let Some(step) = self
            .plan
            .as_ref()
            .and_then(|p| p.current_step().or_else(|| p.current_sub_step()))
            .cloned()
        else {
            self.transition(WorkflowPhase::Verification, "no runnable step remains")?;
            return Ok(());
        };

        let mut prompt = format!("Execute step {}: {}", step.number, step.description);
        if let Some(note) = self.pending_worker_note.take() {
            prompt = format!("{prompt}\n\nYour reply to the last follow-up message was:\n{note}");
        }
        let reply = match self.worker.continue_conversation_or_start(
            "You are executing one step of a larger plan. Work only on the stated step. \
             When you believe the step is genuinely finished, say so explicitly with the words \
             \"STEP COMPLETE\".",
            &prompt,
        )
        .await
        {
            Ok(reply) => reply,
            Err(err) => {
                return self.handle_worker_error(step.number, &err.to_string()).await;
            }
        };
        self.error_recovery.handle_success(&step.number.to_string());
        self.process_response(&reply.text, step.number).await
    }

    async fn handle_worker_error(&mut self, step_number: u32, message: &str) -> Result<(), EngineError> {
        match self.error_recovery.handle_failure(&step_number.to_string(), message, None) {
            Decision::Retry { strategy, backoff } => {
                if !backoff.pre_delay.is_zero() {
                    tokio::time::sleep(backoff.pre_delay).await;
                }
                if let Some(action) = backoff.context_action {
                    let description = format!("{strategy:?} applied {action:?} before retrying");
                    match action {
                        ContextAction::Trim { keep_recent } => self.worker.trim_history(keep_recent),
                        ContextAction::Reset => self.worker.reset_context(),
                        ContextAction::Simplify { .. } => {}
                    }
                    self.events
                        .publish(WorkflowEvent::ContextAction { description, timestamp: Utc::now() });
                }
                tokio::time::sleep(backoff.delay).await;
                Ok(())
            }
            Decision::SkipStep => {
                if let Some(plan) = self.plan.as_mut() {
                    crate::planner::fail_current_step(plan, step_number, "skipped after exhausting retries");
                }
                self.attempt_decomposition_for_failed_step(step_number).await?;
                Ok(())
            }
            Decision::Escalate => {
                self.consecutive_issues += 1;
                self.events.publish(WorkflowEvent::Error {
                    message: message.to_string(),
                    category: "escalate".into(),
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            Decision::Abort => self.transition(WorkflowPhase::Aborted, format!("unrecoverable error: {message}")),
        }
    }

    /// Sends a follow-up prompt (correction, rejection, progress check, time
    /// pressure) on the active worker session, routing a failure through the
    /// normal error-recovery path and keeping a successful reply so it still
    /// informs the next assessment instead of being thrown away.
    async fn send_followup(&mut self, step_number: u32, prompt: &str) -> Result<(), EngineError> {
        match self.worker.continue_conversation(prompt).await {
            Ok(reply) => {
                self.pending_worker_note = Some(reply.text);
                Ok(())
            }
            Err(err) => self.handle_worker_error(step_number, &err.to_string()).await,
        }
    }

    /// Runs duplicate-response detection, updates goal/progress tracking,
    /// then dispatches to the supervisor and (when a step just finished) the
    /// step/sub-plan/completion handlers, in that pending order.
    async fn process_response(&mut self, response: &str, step_number: u32) -> Result<(), EngineError> {
        let is_duplicate = self.recent_responses.iter().any(|r| r == response);
        self.recent_responses.push_back(response.to_string());
        if self.recent_responses.len() > DUPLICATE_RESPONSE_WINDOW {
            self.recent_responses.pop_front();
        }

        let parsed = self.goal_tracker.parse_progress_from_response(response);
        self.events.publish(WorkflowEvent::Progress {
            percent: self.goal_tracker.overall_progress(),
            milestone: if parsed.completion_phrase_detected { Some("completion phrase detected".into()) } else { None },
            timestamp: Utc::now(),
        });

        let recent_actions = extract_recent_actions(response);
        let (step_description, step_complexity) = self
            .plan
            .as_ref()
            .and_then(|p| p.steps.iter().find(|s| s.number == step_number))
            .map(|s| (Some(s.description.clone()), Some(s.complexity)))
            .unwrap_or((None, None));

        let assessment = {
            let goal = self.goal_tracker.goal().clone();
            let phase_str = format!("{:?}", self.phase);
            let request = AssessmentRequest {
                goal: &goal,
                phase: &phase_str,
                step_number: Some(step_number),
                step_description: step_description.as_deref(),
                step_complexity,
                worker_response: response,
                consecutive_issues: self.consecutive_issues,
                recent_actions: &recent_actions,
                history: &self.supervision_history,
            };
            let mut supervisor = Supervisor::new(
                &mut self.supervisor_client,
                self.config.escalation_thresholds.clone(),
                self.config.supervisor.max_response_length,
                self.config.supervisor.skip_for_simple_steps,
            );
            supervisor.assess(&mut self.assessment_cache, &request).await?
        };

        self.supervision_history.push(assessment.clone());
        if self.supervision_history.len() > SUPERVISION_HISTORY_WINDOW {
            let excess = self.supervision_history.len() - SUPERVISION_HISTORY_WINDOW;
            self.supervision_history.drain(0..excess);
        }

        if is_duplicate || !assessment.progressing {
            self.consecutive_issues += 1;
        } else {
            self.consecutive_issues = 0;
            self.last_meaningful_progress_at = Utc::now();
        }

        self.events.publish(WorkflowEvent::Supervision {
            action: assessment.action,
            score: assessment.score,
            reason: assessment.reason.clone(),
            timestamp: Utc::now(),
        });

        match assessment.action {
            SupervisorAction::Continue => {}
            SupervisorAction::Abort => {
                self.transition(WorkflowPhase::Aborted, assessment.reason.clone())?;
                return Ok(());
            }
            action => {
                if matches!(action, SupervisorAction::Critical) {
                    self.events.publish(WorkflowEvent::CriticalEscalation {
                        action,
                        consecutive_issues: self.consecutive_issues,
                        timestamp: Utc::now(),
                    });
                }
                if let Some(prompt) = generate_correction_prompt(action, &assessment.reason) {
                    self.send_followup(step_number, &prompt).await?;
                }
            }
        }

        self.check_stagnation_and_alert(step_number).await?;

        if parsed.blockers.is_empty() {
            if STEP_COMPLETE_PATTERN.is_match(response) {
                let description = step_description.unwrap_or_default();
                let verified = {
                    let mut supervisor = Supervisor::new(
                        &mut self.supervisor_client,
                        self.config.escalation_thresholds.clone(),
                        self.config.supervisor.max_response_length,
                        self.config.supervisor.skip_for_simple_steps,
                    );
                    supervisor.verify_step_completion(&description, response).await?
                };
                if verified {
                    if let Some(plan) = self.plan.as_mut() {
                        crate::planner::advance_step(plan, step_number);
                    }
                    self.create_checkpoint("step-complete").await?;
                } else {
                    let prompt = "The step was claimed complete but independent verification rejected it. \
                                  Provide concrete evidence (files changed, commands run, output) before \
                                  claiming completion again."
                        .to_string();
                    self.send_followup(step_number, &prompt).await?;
                }
            }
        } else if let Some(plan) = self.plan.as_mut() {
            crate::planner::fail_current_step(plan, step_number, parsed.blockers.join("; "));
            self.attempt_sub_plan_for_blocked_step(step_number).await?;
        }

        let progress_percent = self.plan.as_ref().map(|p| p.progress_percent()).unwrap_or(0);
        let plan_complete = self.plan.as_ref().map(|p| crate::planner::is_complete(p)).unwrap_or(false);
        if parsed.completion_phrase_detected || progress_percent == 100 || plan_complete {
            self.transition(WorkflowPhase::Verification, "completion phrase, 100% progress, or a complete plan was observed")?;
        }

        self.maybe_autosave_checkpoint().await?;
        self.save_session(SessionRecordStatus::Active).await?;
        Ok(())
    }

    /// Stalls are judged against wall-clock time since the last assessment
    /// that reported real progress, independent of whatever the latest
    /// supervisor score says about this single turn.
    async fn check_stagnation_and_alert(&mut self, step_number: u32) -> Result<(), EngineError> {
        let elapsed = (Utc::now() - self.last_meaningful_progress_at).to_std().unwrap_or(Duration::ZERO);
        let threshold = Duration::from_millis(self.config.supervisor.stagnation_threshold_ms);
        let stagnant = {
            let supervisor = Supervisor::new(
                &mut self.supervisor_client,
                self.config.escalation_thresholds.clone(),
                self.config.supervisor.max_response_length,
                self.config.supervisor.skip_for_simple_steps,
            );
            supervisor.check_stagnation(elapsed, threshold)
        };
        if !stagnant {
            return Ok(());
        }
        self.consecutive_issues += 1;
        self.events.publish(WorkflowEvent::Supervision {
            action: SupervisorAction::Refocus,
            score: 0,
            reason: "no measurable progress within the stagnation window".into(),
            timestamp: Utc::now(),
        });
        let prompt = "No measurable progress has been made recently. Stop and explain what is blocking \
                      forward movement, then propose a concrete next action."
            .to_string();
        self.send_followup(step_number, &prompt).await
    }

    /// A step the worker reported as blocked gets one shot at a sub-plan: an
    /// alternative ordered list of steps the planner proposes in place of the
    /// original. If none is produced, or a sub-plan was already attempted for
    /// this step, it stays `Failed` and waits for manual/error-recovery
    /// handling.
    async fn attempt_sub_plan_for_blocked_step(&mut self, step_number: u32) -> Result<(), EngineError> {
        let Some(step) = self
            .plan
            .as_ref()
            .and_then(|p| p.steps.iter().find(|s| s.number == step_number).cloned())
        else {
            return Ok(());
        };
        if !crate::planner::can_attempt_sub_plan(&step) {
            return Ok(());
        }
        let reason = step.failure_reason.clone().unwrap_or_else(|| "step blocked".to_string());
        let sub_plan = {
            let mut planner = Planner::new(&mut self.planner_client);
            planner.create_sub_plan(&step, &reason).await?
        };

        let next_number = self
            .plan
            .as_ref()
            .map(|p| p.steps.iter().map(|s| s.number).max().unwrap_or(0))
            .unwrap_or(0);
        let mut substeps = sub_plan.plan.steps;
        for (offset, sub) in substeps.iter_mut().enumerate() {
            sub.number = next_number + 1 + offset as u32;
            sub.is_sub_step = true;
            sub.parent_step_number = Some(step_number);
        }

        if let Some(plan) = self.plan.as_mut() {
            crate::planner::inject_subtasks(plan, step_number, substeps);
            if let Some(parent) = plan.step_mut(step_number) {
                parent.sub_plan_attempted = true;
            }
        }
        Ok(())
    }

    /// A complex step that exhausted its retries is broken into smaller
    /// sub-steps rather than simply left failed, if it hasn't been
    /// decomposed already.
    async fn attempt_decomposition_for_failed_step(&mut self, step_number: u32) -> Result<(), EngineError> {
        let Some(step) = self
            .plan
            .as_ref()
            .and_then(|p| p.steps.iter().find(|s| s.number == step_number).cloned())
        else {
            return Ok(());
        };
        if !crate::planner::should_decompose_step(&step) {
            return Ok(());
        }
        let substeps = {
            let mut planner = Planner::new(&mut self.planner_client);
            planner.decompose_complex_step(&step).await?
        };

        let next_number = self
            .plan
            .as_ref()
            .map(|p| p.steps.iter().map(|s| s.number).max().unwrap_or(0))
            .unwrap_or(0);
        let mut substeps = substeps;
        for (offset, sub) in substeps.iter_mut().enumerate() {
            sub.number = next_number + 1 + offset as u32;
        }

        if let Some(plan) = self.plan.as_mut() {
            crate::planner::inject_subtasks(plan, step_number, substeps);
        }
        Ok(())
    }

    /// Three independent checks must all pass for a goal to be accepted as
    /// done: the three-layer evidence/artifact pipeline, a smoke-test build
    /// and test pass, and the supervisor's own independent goal verdict.
    async fn run_verification(&mut self) -> Result<(), EngineError> {
        if !self.config.verification.enabled {
            self.transition(WorkflowPhase::Completed, "verification disabled by config")?;
            return Ok(());
        }
        let goal_text = self.goal_tracker.goal().primary.clone();

        let mut report = {
            let mut evidence_config = self.config.verification.clone();
            evidence_config.run_tests = false;
            let mut verifier = Verifier::new(self.working_dir.clone(), evidence_config, &mut self.worker);
            verifier.verify(&goal_text, &[]).await?
        };

        let smoke_tests_passed = if self.config.verification.run_tests {
            let smoke_gates = {
                let mut verifier =
                    Verifier::new(self.working_dir.clone(), self.config.verification.clone(), &mut self.worker);
                verifier.run_smoke_tests().await
            };
            let passed = smoke_gates.iter().all(|g| g.outcome != GateOutcome::Failed);
            for gate in smoke_gates {
                report.add_gate(gate);
            }
            passed
        } else {
            true
        };

        let goal_verdict = {
            let steps = self.plan.as_ref().map(|p| p.steps.clone()).unwrap_or_default();
            let goal = self.goal_tracker.goal().clone();
            let mut supervisor = Supervisor::new(
                &mut self.supervisor_client,
                self.config.escalation_thresholds.clone(),
                self.config.supervisor.max_response_length,
                self.config.supervisor.skip_for_simple_steps,
            );
            supervisor.verify_goal_achieved(&goal, &steps, &self.working_dir).await?
        };

        let overall_passed = report.passed && smoke_tests_passed && goal_verdict.achieved;

        self.events.publish(WorkflowEvent::Verification {
            passed: overall_passed,
            failed_gates: report.failed_gates().into_iter().map(|g| g.gate.clone()).collect(),
            timestamp: Utc::now(),
        });

        if overall_passed {
            return self.transition(WorkflowPhase::Completed, "verification gates and the independent goal verdict both passed");
        }

        self.verification_attempts += 1;
        if self.verification_attempts >= self.config.verification.max_attempts {
            self.events.publish(WorkflowEvent::VerificationLimitReached {
                attempts: self.verification_attempts,
                timestamp: Utc::now(),
            });
            return self.transition(WorkflowPhase::VerificationFailed, "verification attempts exhausted");
        }

        let mut rejection = generate_rejection_prompt(&report);
        if !goal_verdict.achieved {
            rejection.push_str(&format!(
                "\nIndependent review judged the goal not achieved: {}",
                goal_verdict.recommendation
            ));
            if !goal_verdict.gaps.is_empty() {
                rejection.push_str(&format!("\nGaps: {}", goal_verdict.gaps.join(", ")));
            }
        }
        let step_number = self.current_step_number_or_zero();
        self.send_followup(step_number, &rejection).await?;
        self.transition(WorkflowPhase::Execution, "retrying after failed verification")
    }

    async fn create_checkpoint(&self, tag: &str) -> Result<(), EngineError> {
        if !self.config.persistence.enabled {
            return Ok(());
        }
        let goal = self.goal_tracker.goal();
        let checkpoint = Checkpoint {
            session_id: self.session_id.clone(),
            goal_hash: goal_hash(&goal.primary),
            plan: self.plan.clone().unwrap_or_default(),
            current_step_number: self.plan.as_ref().and_then(|p| p.current_step()).map(|s| s.number),
            completed_steps: self.plan.as_ref().map(|p| p.completed_step_numbers()).unwrap_or_default(),
            started_at: goal.created_at,
            tag: tag.to_string(),
            created_at: Utc::now(),
        };
        self.persistence.create_checkpoint(&checkpoint).await?;
        Ok(())
    }

    async fn maybe_autosave_checkpoint(&mut self) -> Result<(), EngineError> {
        let interval = Duration::from_millis(self.config.persistence.auto_save_interval_ms);
        let elapsed = (Utc::now() - self.last_autosave_at).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= interval {
            self.last_autosave_at = Utc::now();
            self.create_checkpoint("autosave").await?;
        }
        Ok(())
    }

    async fn save_session(&self, status: SessionRecordStatus) -> Result<(), EngineError> {
        let goal = self.goal_tracker.goal();
        let record = SessionRecord {
            session_id: self.session_id.clone(),
            goal_hash: goal_hash(&goal.primary),
            goal_primary: goal.primary.clone(),
            plan: self.plan.clone(),
            current_step_number: self.plan.as_ref().and_then(|p| p.current_step()).map(|s| s.number),
            status,
            started_at: goal.created_at,
            updated_at: Utc::now(),
        };
        self.persistence.save_session(&record).await?;
        Ok(())
    }

    /// Adaptive delay: shorter after an uneventful success, longer while
    /// issues are accumulating, always clamped to the configured minimum.
    fn adaptive_delay(&self) -> Duration {
        let cfg = &self.config.iteration_delay;
        if !cfg.adaptive {
            return Duration::from_millis(cfg.default_ms);
        }
        let ms = if self.consecutive_issues > 0 { cfg.after_error_ms } else { cfg.after_success_ms };
        Duration::from_millis(ms.max(cfg.minimum_ms))
    }
}

fn extract_recent_actions(text: &str) -> Vec<String> {
    ACTION_VERB_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().trim().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_follow_the_run_diagram() {
        assert!(is_legal_transition(WorkflowPhase::Init, WorkflowPhase::Planning));
        assert!(is_legal_transition(WorkflowPhase::Verification, WorkflowPhase::Execution));
        assert!(!is_legal_transition(WorkflowPhase::Planning, WorkflowPhase::Verification));
        assert!(is_legal_transition(WorkflowPhase::Execution, WorkflowPhase::TimeExpired));
        assert!(!is_legal_transition(WorkflowPhase::Completed, WorkflowPhase::Execution));
    }

    #[test]
    fn extract_recent_actions_finds_verb_led_lines() {
        let text = "Ran the test suite and it passed.\nWrote a new module for parsing.\nUnrelated remark.";
        let actions = extract_recent_actions(text);
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn step_complete_pattern_requires_the_literal_marker() {
        assert!(STEP_COMPLETE_PATTERN.is_match("All done. STEP COMPLETE."));
        assert!(!STEP_COMPLETE_PATTERN.is_match("I completed the step just now."));
    }

    #[test]
    fn is_terminal_covers_all_five_end_states() {
        for phase in [
            WorkflowPhase::Completed,
            WorkflowPhase::VerificationFailed,
            WorkflowPhase::TimeExpired,
            WorkflowPhase::Aborted,
            WorkflowPhase::Stopped,
        ] {
            assert!(phase.is_terminal());
        }
        assert!(!WorkflowPhase::Execution.is_terminal());
    }
}
