//! Observability events published by the workflow engine.
//!
//! A tokio broadcast channel carries events to any subscriber (CLI progress
//! printer, JSON-logs sink); a bounded in-memory history backs the final run
//! summary without needing a subscriber to have been attached throughout.

pub mod bus;
pub mod history;
pub mod types;

pub use bus::{EventBus, SharedEventBus};
pub use history::EventHistory;
pub use types::WorkflowEvent;
