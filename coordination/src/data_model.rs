//! Shared data types that flow between the workflow engine and its components.
//!
//! These are intentionally plain data: the types that own mutation logic
//! (the escalation ladder, the circuit breaker, the planner) live in their
//! own modules and operate on these structs by reference or by value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of conversation messages kept in a `WorkerSession` history.
pub const MAX_CONVERSATION_HISTORY: usize = 100;
/// Maximum number of error entries kept in the Error Recovery history.
pub const MAX_ERROR_HISTORY: usize = 50;
/// Maximum number of milestones kept by the Goal Tracker.
pub const MAX_MILESTONES: usize = 50;
/// Maximum number of response/progress history entries kept by the Goal Tracker.
pub const MAX_PROGRESS_HISTORY: usize = 100;
/// Maximum number of phase checkpoints kept by the Phase Manager.
pub const MAX_PHASE_CHECKPOINTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubGoalStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubGoal {
    pub id: u32,
    pub description: String,
    pub status: SubGoalStatus,
    /// 0-100.
    pub progress: u8,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl SubGoal {
    pub fn is_complete(&self) -> bool {
        self.status == SubGoalStatus::Completed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub primary: String,
    pub subgoals: Vec<SubGoal>,
    pub current_phase_idx: usize,
    pub created_at: DateTime<Utc>,
}

impl Goal {
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            subgoals: Vec::new(),
            current_phase_idx: 0,
            created_at: Utc::now(),
        }
    }

    /// Contiguous ids, 1..N, invariant asserted by the planner / goal tracker
    /// whenever subgoals are assigned, never by this constructor alone.
    pub fn with_subgoals(mut self, subgoals: Vec<SubGoal>) -> Self {
        self.subgoals = subgoals;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub number: u32,
    pub description: String,
    pub complexity: Complexity,
    #[serde(default)]
    pub dependencies: Vec<u32>,
    #[serde(default)]
    pub verification_criteria: Vec<String>,
    pub status: StepStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_step_number: Option<u32>,
    #[serde(default)]
    pub is_sub_step: bool,
    /// Set when this step was replaced in-place by a decomposition (not a sub-plan).
    #[serde(default)]
    pub decomposed_into: Option<Vec<u32>>,
    /// At most one sub-plan attempt is allowed per main step.
    #[serde(default)]
    pub sub_plan_attempted: bool,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl Step {
    pub fn new(number: u32, description: impl Into<String>, complexity: Complexity) -> Self {
        Self {
            number,
            description: description.into(),
            complexity,
            dependencies: Vec::new(),
            verification_criteria: Vec::new(),
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            parent_step_number: None,
            is_sub_step: false,
            decomposed_into: None,
            sub_plan_attempted: false,
            failure_reason: None,
        }
    }

    pub fn is_runnable(&self, completed: &[u32]) -> bool {
        matches!(self.status, StepStatus::Pending | StepStatus::InProgress)
            && self.dependencies.iter().all(|d| completed.contains(d))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Numbers of steps that satisfy a dependency on them: plainly completed
    /// steps, and decomposed/sub-planned steps whose replacement sub-steps
    /// have all completed (a dependent step shouldn't deadlock forever on a
    /// parent that stepped aside for a sub-plan instead of running itself).
    pub fn completed_step_numbers(&self) -> Vec<u32> {
        self.steps.iter().filter(|s| self.step_is_done(s)).map(|s| s.number).collect()
    }

    /// Lowest-numbered step that is runnable: pending or in-progress, with
    /// all dependencies completed.
    pub fn current_step(&self) -> Option<&Step> {
        let completed = self.completed_step_numbers();
        self.steps
            .iter()
            .filter(|s| !s.is_sub_step)
            .find(|s| s.is_runnable(&completed))
    }

    /// The lowest-numbered runnable sub-step, i.e. a step injected by
    /// decomposition or a sub-plan whose parent has stepped aside in its
    /// favor. Kept separate from `current_step` so top-level scheduling and
    /// progress accounting are unaffected by how many sub-steps exist.
    pub fn current_sub_step(&self) -> Option<&Step> {
        let completed = self.completed_step_numbers();
        self.steps.iter().filter(|s| s.is_sub_step).find(|s| s.is_runnable(&completed))
    }

    pub fn current_step_mut(&mut self) -> Option<&mut Step> {
        let completed = self.completed_step_numbers();
        self.steps
            .iter_mut()
            .filter(|s| !s.is_sub_step)
            .find(|s| s.is_runnable(&completed))
    }

    pub fn step_mut(&mut self, number: u32) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.number == number)
    }

    /// Whether a top-level step is done. A step replaced by a decomposition
    /// or sub-plan (`decomposed_into: Some(_)`) is done only once every one
    /// of its sub-steps has completed, not merely because it was marked
    /// `Skipped` at injection time.
    fn step_is_done(&self, step: &Step) -> bool {
        match &step.decomposed_into {
            Some(subs) => subs.iter().all(|n| {
                self.steps
                    .iter()
                    .find(|s| s.number == *n)
                    .is_some_and(|s| s.status == StepStatus::Completed)
            }),
            None => matches!(step.status, StepStatus::Completed | StepStatus::Skipped),
        }
    }

    /// All top-level steps are completed or skipped.
    pub fn is_complete(&self) -> bool {
        self.steps.iter().filter(|s| !s.is_sub_step).all(|s| self.step_is_done(s))
    }

    pub fn progress_percent(&self) -> u8 {
        let top_level: Vec<&Step> = self.steps.iter().filter(|s| !s.is_sub_step).collect();
        if top_level.is_empty() {
            return 0;
        }
        let done = top_level.iter().filter(|s| self.step_is_done(s)).count();
        ((done as f64 / top_level.len() as f64) * 100.0).round() as u8
    }
}

/// A sub-plan is just a `Plan` attached to a failed main step's
/// `decomposed_into` conceptually; it is tracked separately while active so
/// the engine knows which main step it is standing in for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubPlan {
    pub parent_step_number: u32,
    pub reason: String,
    pub plan: Plan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_create: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// The parsed result of one child-process invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub text: String,
    pub session_id: Option<String>,
    #[serde(default)]
    pub structured_output: Option<serde_json::Value>,
    #[serde(default)]
    pub tool_calls: Vec<serde_json::Value>,
    pub usage: Usage,
    pub duration_ms: u64,
    #[serde(default)]
    pub permission_denials: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub total_calls: u64,
    pub total_retries: u64,
    pub total_fallbacks: u64,
    pub total_cost_usd: f64,
    pub cache_hit_tokens: u64,
    pub cache_miss_tokens: u64,
}

impl WorkerMetrics {
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hit_tokens + self.cache_miss_tokens;
        if total == 0 {
            0.0
        } else {
            self.cache_hit_tokens as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerSession {
    pub session_id: Option<String>,
    pub conversation_history: Vec<Message>,
    pub is_running: bool,
    pub metrics: WorkerMetrics,
}

impl WorkerSession {
    pub fn push_message(&mut self, role: MessageRole, content: impl Into<String>) {
        self.conversation_history.push(Message {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        });
        let len = self.conversation_history.len();
        if len > MAX_CONVERSATION_HISTORY {
            self.conversation_history
                .drain(0..len - MAX_CONVERSATION_HISTORY);
        }
    }

    pub fn last_assistant_reply(&self) -> Option<&str> {
        self.conversation_history
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
            .map(|m| m.content.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorAction {
    Continue,
    Remind,
    Correct,
    Refocus,
    Critical,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    pub relevant: bool,
    pub productive: bool,
    pub progressing: bool,
    /// 0-100.
    pub score: u8,
    pub action: SupervisorAction,
    pub reason: String,
    /// The action the LLM suggested before the escalation ladder applied its
    /// floor; equal to `action` when the ladder did not override.
    pub original_action: SupervisorAction,
}

/// The Supervisor's independent final judgment on whether a goal was truly
/// achieved, distinct from the worker's own completion claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalVerdict {
    pub achieved: bool,
    /// 0-100.
    pub confidence: u8,
    pub functional: bool,
    pub recommendation: String,
    pub gaps: Vec<String>,
}

/// Persisted snapshot of a session, written under `checkpoints/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub goal_hash: String,
    pub plan: Plan,
    pub current_step_number: Option<u32>,
    pub completed_steps: Vec<u32>,
    pub started_at: DateTime<Utc>,
    pub tag: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    VerificationFailed,
    TimeExpired,
    Stopped,
    Aborted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_current_step_respects_dependencies() {
        let mut s2 = Step::new(2, "second", Complexity::Simple);
        s2.dependencies = vec![1];
        let plan = Plan::new(vec![Step::new(1, "first", Complexity::Simple), s2]);
        assert_eq!(plan.current_step().unwrap().number, 1);
    }

    #[test]
    fn plan_is_complete_allows_skipped() {
        let mut s1 = Step::new(1, "first", Complexity::Simple);
        s1.status = StepStatus::Completed;
        let mut s2 = Step::new(2, "second", Complexity::Simple);
        s2.status = StepStatus::Skipped;
        let plan = Plan::new(vec![s1, s2]);
        assert!(plan.is_complete());
    }

    #[test]
    fn sub_steps_excluded_from_current_step() {
        let mut main = Step::new(1, "main", Complexity::Complex);
        main.status = StepStatus::Failed;
        let mut sub = Step::new(2, "sub", Complexity::Simple);
        sub.is_sub_step = true;
        sub.parent_step_number = Some(1);
        let plan = Plan::new(vec![main, sub]);
        // The failed main step is not runnable and the sub-step is excluded
        // from top-level scheduling, so no current step is returned.
        assert!(plan.current_step().is_none());
    }

    #[test]
    fn conversation_history_is_bounded() {
        let mut session = WorkerSession::default();
        for i in 0..(MAX_CONVERSATION_HISTORY + 10) {
            session.push_message(MessageRole::User, format!("msg {i}"));
        }
        assert_eq!(session.conversation_history.len(), MAX_CONVERSATION_HISTORY);
        assert_eq!(session.conversation_history[0].content, "msg 10");
    }
}
