//! Autonomous coding-agent orchestrator.
//!
//! Drives an external LLM coding assistant, invoked as a child process per
//! turn, through a bounded plan → review → execute → verify workflow until a
//! goal is achieved, verification is exhausted, the time budget runs out, or
//! an operator stops the run.

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod data_model;
pub mod engine;
pub mod error_recovery;
pub mod events;
pub mod goal_tracker;
pub mod persistence;
pub mod phase_manager;
pub mod planner;
pub mod supervisor;
pub mod verifier;
pub mod worker_client;

pub use config::OrchestratorConfig;
pub use data_model::{Goal, SubGoal, WorkflowStatus};
pub use engine::{RunReport, WorkflowEngine, WorkflowPhase};
