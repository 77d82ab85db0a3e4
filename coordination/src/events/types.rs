//! Observability event types emitted by the workflow engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data_model::{SupervisorAction, WorkflowStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowEvent {
    PhaseTransition {
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },
    Progress {
        percent: u8,
        milestone: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Supervision {
        action: SupervisorAction,
        score: u8,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    Verification {
        passed: bool,
        failed_gates: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
        category: String,
        timestamp: DateTime<Utc>,
    },
    /// Emitted when a retry strategy mutates the worker's conversation
    /// context (trim, reset, simplify) before retrying.
    ContextAction {
        description: String,
        timestamp: DateTime<Utc>,
    },
    /// Emitted once an escalation action reaches `critical` or above.
    CriticalEscalation {
        action: SupervisorAction,
        consecutive_issues: u32,
        timestamp: DateTime<Utc>,
    },
    /// Emitted when the workflow engine aborts the run.
    Abort {
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// Emitted when verification has exhausted `max_attempts`.
    VerificationLimitReached {
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    /// Terminal event; one per run.
    WorkflowFinished {
        status: WorkflowStatus,
        timestamp: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::PhaseTransition { timestamp, .. }
            | Self::Progress { timestamp, .. }
            | Self::Supervision { timestamp, .. }
            | Self::Verification { timestamp, .. }
            | Self::Error { timestamp, .. }
            | Self::ContextAction { timestamp, .. }
            | Self::CriticalEscalation { timestamp, .. }
            | Self::Abort { timestamp, .. }
            | Self::VerificationLimitReached { timestamp, .. }
            | Self::WorkflowFinished { timestamp, .. } => *timestamp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::PhaseTransition { .. } => "phase_transition",
            Self::Progress { .. } => "progress",
            Self::Supervision { .. } => "supervision",
            Self::Verification { .. } => "verification",
            Self::Error { .. } => "error",
            Self::ContextAction { .. } => "context_action",
            Self::CriticalEscalation { .. } => "critical_escalation",
            Self::Abort { .. } => "abort",
            Self::VerificationLimitReached { .. } => "verification_limit",
            Self::WorkflowFinished { .. } => "workflow_finished",
        }
    }

    /// The four kinds that warrant an out-of-band escalation notification,
    /// as opposed to routine progress/supervision telemetry.
    pub fn is_escalation(&self) -> bool {
        matches!(
            self,
            Self::CriticalEscalation { .. } | Self::Abort { .. } | Self::VerificationLimitReached { .. } | Self::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_classification_matches_spec_kinds() {
        let abort = WorkflowEvent::Abort { reason: "x".into(), timestamp: Utc::now() };
        assert!(abort.is_escalation());
        let progress = WorkflowEvent::Progress { percent: 50, milestone: None, timestamp: Utc::now() };
        assert!(!progress.is_escalation());
    }
}
