//! Bounded in-memory event history for status reporting and final summaries.

use super::types::WorkflowEvent;

const MAX_HISTORY: usize = 500;

pub struct EventHistory {
    events: Vec<WorkflowEvent>,
}

impl EventHistory {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: WorkflowEvent) {
        self.events.push(event);
        if self.events.len() > MAX_HISTORY {
            let excess = self.events.len() - MAX_HISTORY;
            self.events.drain(0..excess);
        }
    }

    /// Last `limit` events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<WorkflowEvent> {
        let start = self.events.len().saturating_sub(limit);
        self.events[start..].to_vec()
    }

    pub fn escalations(&self) -> Vec<&WorkflowEvent> {
        self.events.iter().filter(|e| e.is_escalation()).collect()
    }
}

impl Default for EventHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn history_is_bounded() {
        let mut history = EventHistory::new();
        for _ in 0..(MAX_HISTORY + 10) {
            history.record(WorkflowEvent::Progress { percent: 1, milestone: None, timestamp: Utc::now() });
        }
        assert_eq!(history.recent(MAX_HISTORY + 10).len(), MAX_HISTORY);
    }

    #[test]
    fn escalations_filters_to_escalation_kinds() {
        let mut history = EventHistory::new();
        history.record(WorkflowEvent::Progress { percent: 1, milestone: None, timestamp: Utc::now() });
        history.record(WorkflowEvent::Abort { reason: "x".into(), timestamp: Utc::now() });
        assert_eq!(history.escalations().len(), 1);
    }
}
