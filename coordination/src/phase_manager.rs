//! Phase Manager (§4.E): time budget tracking and time-pressure prompts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::data_model::MAX_PHASE_CHECKPOINTS;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePressure {
    None,
    Halfway,
    LowTime,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseCheckpoint {
    pub phase_name: String,
    pub elapsed_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

pub struct PhaseManager {
    start_time: DateTime<Utc>,
    time_limit: Duration,
    phases: Vec<Phase>,
    checkpoints: Vec<PhaseCheckpoint>,
    progress_check_interval: Duration,
    last_pressure_signaled: TimePressure,
}

impl PhaseManager {
    /// Phases initialized one-to-one with subgoal names, or a single phase
    /// for the primary goal when there are none.
    pub fn new(time_limit: Duration, phase_names: Vec<String>, progress_check_interval: Duration) -> Self {
        let names = if phase_names.is_empty() {
            vec!["primary".to_string()]
        } else {
            phase_names
        };
        Self {
            start_time: Utc::now(),
            time_limit,
            phases: names
                .into_iter()
                .map(|name| Phase { name, started_at: None, completed_at: None })
                .collect(),
            checkpoints: Vec::new(),
            progress_check_interval,
            last_pressure_signaled: TimePressure::None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.start_time).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn remaining(&self) -> Duration {
        self.time_limit.saturating_sub(self.elapsed())
    }

    pub fn percent_used(&self) -> f64 {
        if self.time_limit.is_zero() {
            return 100.0;
        }
        (self.elapsed().as_secs_f64() / self.time_limit.as_secs_f64()) * 100.0
    }

    /// Emits a time-pressure prompt when a threshold is newly crossed;
    /// returns `None` once a pressure level has already been signaled so the
    /// caller does not inject the same prompt on every tick.
    pub fn check_time_pressure(&mut self) -> Option<(TimePressure, String)> {
        let pressure = if self.remaining().is_zero() {
            TimePressure::Expired
        } else if self.percent_used() >= 90.0 {
            TimePressure::LowTime
        } else if (50.0..60.0).contains(&self.percent_used()) {
            TimePressure::Halfway
        } else {
            TimePressure::None
        };

        if pressure == self.last_pressure_signaled || pressure == TimePressure::None {
            return None;
        }
        self.last_pressure_signaled = pressure;
        let prompt = match pressure {
            TimePressure::Expired => {
                "TIME EXPIRED. Summarize what has been accomplished and the current state.".to_string()
            }
            TimePressure::LowTime => {
                "Less than 10% of the time budget remains. Prioritize the most critical remaining tasks."
                    .to_string()
            }
            TimePressure::Halfway => {
                "You are roughly halfway through the time budget. Reassess progress against the goal."
                    .to_string()
            }
            TimePressure::None => unreachable!(),
        };
        Some((pressure, prompt))
    }

    pub fn is_time_for_progress_check(&self, last_checked_at: DateTime<Utc>) -> bool {
        (Utc::now() - last_checked_at)
            .to_std()
            .map(|elapsed| elapsed >= self.progress_check_interval)
            .unwrap_or(true)
    }

    pub fn record_checkpoint(&mut self) {
        self.checkpoints.push(PhaseCheckpoint {
            phase_name: self
                .phases
                .get(0)
                .map(|p| p.name.clone())
                .unwrap_or_default(),
            elapsed_ms: self.elapsed().as_millis() as u64,
            recorded_at: Utc::now(),
        });
        if self.checkpoints.len() > MAX_PHASE_CHECKPOINTS {
            let excess = self.checkpoints.len() - MAX_PHASE_CHECKPOINTS;
            self.checkpoints.drain(0..excess);
        }
    }

    pub fn checkpoints(&self) -> &[PhaseCheckpoint] {
        &self.checkpoints
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_when_time_limit_already_passed() {
        let mut manager = PhaseManager::new(Duration::from_millis(1), vec![], Duration::from_secs(300));
        std::thread::sleep(Duration::from_millis(5));
        let (pressure, prompt) = manager.check_time_pressure().unwrap();
        assert_eq!(pressure, TimePressure::Expired);
        assert!(prompt.contains("TIME EXPIRED"));
    }

    #[test]
    fn pressure_only_signaled_once_per_level() {
        let mut manager = PhaseManager::new(Duration::from_millis(1), vec![], Duration::from_secs(300));
        std::thread::sleep(Duration::from_millis(5));
        assert!(manager.check_time_pressure().is_some());
        assert!(manager.check_time_pressure().is_none());
    }

    #[test]
    fn progress_check_interval_respected() {
        let manager = PhaseManager::new(Duration::from_secs(3600), vec![], Duration::from_millis(5));
        let past = Utc::now() - chrono::Duration::milliseconds(10);
        assert!(manager.is_time_for_progress_check(past));
        assert!(!manager.is_time_for_progress_check(Utc::now()));
    }

    #[test]
    fn checkpoints_are_bounded() {
        let mut manager = PhaseManager::new(Duration::from_secs(3600), vec![], Duration::from_secs(300));
        for _ in 0..(MAX_PHASE_CHECKPOINTS + 5) {
            manager.record_checkpoint();
        }
        assert_eq!(manager.checkpoints().len(), MAX_PHASE_CHECKPOINTS);
    }
}
