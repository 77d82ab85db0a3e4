//! Goal Tracker (§4.D): holds the Goal and milestone list, derives progress
//! signals from free-form worker replies.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::data_model::{Goal, MAX_MILESTONES, MAX_PROGRESS_HISTORY};

static COMPLETION_PHRASES: &[&str] = &[
    "task complete",
    "goal achieved",
    "finished",
    "all goals met",
    "successfully completed",
    "mission accomplished",
];

static BLOCKER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)STEP\s+BLOCKED[:\s]+(.+)").unwrap());

static PERCENT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d{1,3})\s*%\s*(complete|progress|done)").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub description: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

pub struct GoalTracker {
    goal: Goal,
    milestones: Vec<Milestone>,
    response_history: Vec<String>,
    last_explicit_percent: Option<u8>,
}

impl GoalTracker {
    pub fn new(goal: Goal) -> Self {
        Self {
            goal,
            milestones: Vec::new(),
            response_history: Vec::new(),
            last_explicit_percent: None,
        }
    }

    pub fn goal(&self) -> &Goal {
        &self.goal
    }

    pub fn goal_mut(&mut self) -> &mut Goal {
        &mut self.goal
    }

    /// Mean of subgoal progress fields, or the last explicit percentage
    /// found in a worker reply when there are no subgoals.
    pub fn overall_progress(&self) -> u8 {
        if self.goal.subgoals.is_empty() {
            return self.last_explicit_percent.unwrap_or(0);
        }
        let total: u32 = self.goal.subgoals.iter().map(|s| s.progress as u32).sum();
        (total / self.goal.subgoals.len() as u32) as u8
    }

    pub fn is_complete(&self) -> bool {
        if self.goal.subgoals.is_empty() {
            self.overall_progress() >= 100
        } else {
            self.goal.subgoals.iter().all(|s| s.is_complete())
        }
    }

    /// Scans a worker reply for completion phrases, blocker sentences, and
    /// an explicit `N% complete` marker, updating internal tracking state.
    pub fn parse_progress_from_response(&mut self, response: &str) -> ParsedProgress {
        let lower = response.to_lowercase();
        let completion_detected = COMPLETION_PHRASES.iter().any(|p| lower.contains(p));

        let blockers: Vec<String> = BLOCKER_PATTERN
            .captures_iter(response)
            .map(|captures| captures[1].trim().trim_end_matches('.').to_string())
            .collect();

        if let Some(captures) = PERCENT_PATTERN.captures(response) {
            if let Ok(value) = captures[1].parse::<u8>() {
                self.last_explicit_percent = Some(value.min(100));
            }
        }

        self.response_history.push(response.to_string());
        if self.response_history.len() > MAX_PROGRESS_HISTORY {
            let excess = self.response_history.len() - MAX_PROGRESS_HISTORY;
            self.response_history.drain(0..excess);
        }

        if completion_detected {
            self.record_milestone(format!("completion phrase detected: \"{}\"", response.trim()));
        }

        ParsedProgress {
            completion_phrase_detected: completion_detected,
            blockers,
            explicit_percent: self.last_explicit_percent,
        }
    }

    pub fn record_milestone(&mut self, description: impl Into<String>) {
        self.milestones.push(Milestone {
            description: description.into(),
            timestamp: chrono::Utc::now(),
        });
        if self.milestones.len() > MAX_MILESTONES {
            let excess = self.milestones.len() - MAX_MILESTONES;
            self.milestones.drain(0..excess);
        }
    }

    pub fn milestones(&self) -> &[Milestone] {
        &self.milestones
    }
}

#[derive(Debug, Clone)]
pub struct ParsedProgress {
    pub completion_phrase_detected: bool,
    pub blockers: Vec<String>,
    pub explicit_percent: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::{SubGoal, SubGoalStatus};

    #[test]
    fn progress_is_mean_of_subgoals() {
        let goal = Goal::new("ship it").with_subgoals(vec![
            SubGoal { id: 1, description: "a".into(), status: SubGoalStatus::Completed, progress: 100, notes: vec![] },
            SubGoal { id: 2, description: "b".into(), status: SubGoalStatus::InProgress, progress: 50, notes: vec![] },
        ]);
        let tracker = GoalTracker::new(goal);
        assert_eq!(tracker.overall_progress(), 75);
    }

    #[test]
    fn no_subgoals_uses_explicit_percent() {
        let mut tracker = GoalTracker::new(Goal::new("ship it"));
        tracker.parse_progress_from_response("we are at 40% complete on this");
        assert_eq!(tracker.overall_progress(), 40);
        assert!(!tracker.is_complete());
    }

    #[test]
    fn completion_phrase_is_detected() {
        let mut tracker = GoalTracker::new(Goal::new("ship it"));
        let parsed = tracker.parse_progress_from_response("Task complete, everything works.");
        assert!(parsed.completion_phrase_detected);
        assert_eq!(tracker.milestones().len(), 1);
    }

    #[test]
    fn step_blocked_marker_is_harvested() {
        let mut tracker = GoalTracker::new(Goal::new("ship it"));
        let parsed = tracker
            .parse_progress_from_response("Ran the build.\nSTEP BLOCKED: missing dependency foo\nAll good otherwise.");
        assert_eq!(parsed.blockers.len(), 1);
        assert!(parsed.blockers[0].contains("missing dependency foo"));
    }

    #[test]
    fn ordinary_mentions_of_error_words_are_not_blockers() {
        let mut tracker = GoalTracker::new(Goal::new("ship it"));
        let parsed =
            tracker.parse_progress_from_response("Fixed the error that was blocking the build. All good now.");
        assert!(parsed.blockers.is_empty());
    }

    #[test]
    fn is_complete_iff_all_subgoals_completed() {
        let goal = Goal::new("ship it").with_subgoals(vec![SubGoal {
            id: 1,
            description: "a".into(),
            status: SubGoalStatus::InProgress,
            progress: 90,
            notes: vec![],
        }]);
        let tracker = GoalTracker::new(goal);
        assert!(!tracker.is_complete());
    }
}
