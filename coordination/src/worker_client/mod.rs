//! Worker Client (§4.A): wraps the external LLM child process.

mod process;
mod reply;

pub use process::{InvocationOptions, ProcessError};
pub use reply::parse_reply;

use std::path::PathBuf;
use std::time::Duration;

use crate::data_model::{MessageRole, Reply, WorkerSession};
use crate::error_recovery::classifier::classify;

#[derive(Debug, Clone)]
pub struct WorkerClientConfig {
    pub binary: String,
    pub model: String,
    pub fallback_model: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub no_session_persistence: bool,
    pub max_retries: u32,
    pub timeout: Duration,
    pub base_delay_ms: u64,
}

impl WorkerClientConfig {
    /// Fast model, read-only tools, no session persistence, maxRetries=2.
    pub fn supervisor(model: impl Into<String>) -> Self {
        Self {
            binary: default_binary(),
            model: model.into(),
            fallback_model: None,
            allowed_tools: vec!["read".into(), "grep".into(), "glob".into()],
            disallowed_tools: vec!["write".into(), "edit".into(), "bash".into()],
            no_session_persistence: true,
            max_retries: 2,
            timeout: Duration::from_secs(5 * 60),
            base_delay_ms: 1000,
        }
    }

    /// Powerful model, session persistence, default retry/timeout.
    pub fn planner(model: impl Into<String>) -> Self {
        Self {
            binary: default_binary(),
            model: model.into(),
            fallback_model: None,
            allowed_tools: vec![],
            disallowed_tools: vec![],
            no_session_persistence: false,
            max_retries: 3,
            timeout: Duration::from_secs(10 * 60),
            base_delay_ms: 1000,
        }
    }

    /// Powerful model, longer timeout, session persistence.
    pub fn worker(model: impl Into<String>, fallback_model: Option<String>) -> Self {
        Self {
            binary: default_binary(),
            model: model.into(),
            fallback_model,
            allowed_tools: vec![],
            disallowed_tools: vec![],
            no_session_persistence: false,
            max_retries: 3,
            timeout: Duration::from_secs(15 * 60),
            base_delay_ms: 1000,
        }
    }
}

fn default_binary() -> String {
    std::env::var("ORCHESTRATOR_WORKER_BINARY").unwrap_or_else(|_| "claude".to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerClientError {
    #[error("no active session: call startSession before continueConversation")]
    NoActiveSession,
    #[error(transparent)]
    Process(#[from] ProcessError),
}

pub struct RetryOutcome {
    pub reply: Reply,
    pub retries: u32,
    pub used_fallback: bool,
}

pub struct WorkerClient {
    config: WorkerClientConfig,
    working_dir: PathBuf,
    session: WorkerSession,
}

impl WorkerClient {
    pub fn new(config: WorkerClientConfig, working_dir: PathBuf) -> Self {
        Self {
            config,
            working_dir,
            session: WorkerSession::default(),
        }
    }

    pub fn session(&self) -> &WorkerSession {
        &self.session
    }

    pub fn metrics(&self) -> &crate::data_model::WorkerMetrics {
        &self.session.metrics
    }

    /// Drops all but the `keep_recent` most recent conversation messages,
    /// applying a `Strategy::TrimContext` recovery action.
    pub fn trim_history(&mut self, keep_recent: usize) {
        let len = self.session.conversation_history.len();
        if len > keep_recent {
            self.session.conversation_history.drain(0..len - keep_recent);
        }
    }

    /// Clears the in-memory conversation history while keeping the session
    /// id, applying a `Strategy::ResetContext` recovery action. The next
    /// `continue_conversation` call still resumes the same worker session;
    /// only this client's local view of its history is discarded.
    pub fn reset_context(&mut self) {
        self.session.conversation_history.clear();
    }

    /// Spawns a new child with `--new-session` semantics, records the
    /// minted session id, and resets in-memory history.
    pub async fn start_session(
        &mut self,
        system_context: &str,
        initial_prompt: &str,
    ) -> Result<Reply, WorkerClientError> {
        self.session = WorkerSession::default();
        let outcome = self
            .send_with_retry(initial_prompt, None, Some(system_context))
            .await?;
        self.absorb(outcome.reply.clone(), initial_prompt);
        Ok(outcome.reply)
    }

    /// Spawns a child with `--resume <sessionId>`; requires an active
    /// session.
    pub async fn continue_conversation(&mut self, prompt: &str) -> Result<Reply, WorkerClientError> {
        let session_id = self
            .session
            .session_id
            .clone()
            .ok_or(WorkerClientError::NoActiveSession)?;
        let outcome = self.send_with_retry(prompt, Some(session_id), None).await?;
        self.absorb(outcome.reply.clone(), prompt);
        Ok(outcome.reply)
    }

    /// Continues the active session if one exists, otherwise starts a fresh
    /// one with `system_context`. Convenient for short-lived clients (the
    /// supervisor, the planner) that don't track session lifecycle themselves.
    pub async fn continue_conversation_or_start(
        &mut self,
        system_context: &str,
        prompt: &str,
    ) -> Result<Reply, WorkerClientError> {
        if self.session.session_id.is_some() {
            self.continue_conversation(prompt).await
        } else {
            self.start_session(system_context, prompt).await
        }
    }

    fn absorb(&mut self, reply: Reply, prompt: &str) {
        self.session.push_message(MessageRole::User, prompt);
        self.session.push_message(MessageRole::Assistant, reply.text.clone());
        if reply.session_id.is_some() {
            self.session.session_id = reply.session_id.clone();
        }
        self.session.metrics.total_calls += 1;
        self.session.metrics.total_cost_usd += reply.usage.cost_usd;
        self.session.metrics.cache_hit_tokens += reply.usage.cache_read;
        self.session.metrics.cache_miss_tokens += reply.usage.tokens_in.saturating_sub(reply.usage.cache_read);
    }

    /// Retry + fallback-model wrapper around a single child invocation.
    /// Errors are categorized via the shared taxonomy; PERMANENT propagates
    /// immediately, everything else retries with exponential backoff and
    /// jitter, switching to the fallback model from the second attempt on.
    async fn send_with_retry(
        &mut self,
        prompt: &str,
        resume_session_id: Option<String>,
        system_prompt: Option<&str>,
    ) -> Result<RetryOutcome, WorkerClientError> {
        let mut attempt = 0u32;
        let mut used_fallback = false;
        let mut last_err = None;
        while attempt <= self.config.max_retries {
            let model = if used_fallback {
                self.config
                    .fallback_model
                    .clone()
                    .unwrap_or_else(|| self.config.model.clone())
            } else {
                self.config.model.clone()
            };
            let opts = InvocationOptions {
                prompt: prompt.to_string(),
                resume_session_id: resume_session_id.clone(),
                system_prompt: system_prompt.map(str::to_string),
                model,
                fallback_model: self.config.fallback_model.clone(),
                allowed_tools: self.config.allowed_tools.clone(),
                disallowed_tools: self.config.disallowed_tools.clone(),
                output_schema: None,
                no_session_persistence: self.config.no_session_persistence,
                max_turns: None,
                timeout: self.config.timeout,
            };
            match process::invoke(&self.config.binary, &self.working_dir, opts).await {
                Ok(reply) => {
                    self.session.metrics.total_retries += attempt as u64;
                    if used_fallback {
                        self.session.metrics.total_fallbacks += 1;
                    }
                    return Ok(RetryOutcome {
                        reply,
                        retries: attempt,
                        used_fallback,
                    });
                }
                Err(err) => {
                    let message = err.to_string();
                    let category = classify(&message);
                    if category == crate::error_recovery::ErrorCategory::Permanent {
                        return Err(WorkerClientError::Process(match err {
                            ProcessError::Timeout(d) => ProcessError::Timeout(d),
                            other => other,
                        }));
                    }
                    last_err = Some(err);
                    if attempt >= 1 && !used_fallback && self.config.fallback_model.is_some() {
                        used_fallback = true;
                        tracing::warn!(attempt, "worker call failed, switching to fallback model");
                    } else {
                        tracing::warn!(attempt, "worker call failed, retrying");
                    }
                    let delay_ms = (self.config.base_delay_ms as f64 * 2f64.powi(attempt as i32)
                        * (0.5 + rand::random::<f64>() * 0.5)) as u64;
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
        Err(WorkerClientError::Process(last_err.unwrap_or(ProcessError::Timeout(self.config.timeout))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_defaults_match_spec() {
        let supervisor = WorkerClientConfig::supervisor("fast");
        assert_eq!(supervisor.max_retries, 2);
        assert!(supervisor.no_session_persistence);
        assert!(supervisor.disallowed_tools.contains(&"write".to_string()));

        let planner = WorkerClientConfig::planner("big");
        assert!(!planner.no_session_persistence);

        let worker = WorkerClientConfig::worker("big", Some("small".to_string()));
        assert_eq!(worker.timeout, Duration::from_secs(15 * 60));
    }

    #[test]
    fn continue_conversation_requires_active_session() {
        let dir = tempfile::tempdir().unwrap();
        let client = WorkerClient::new(WorkerClientConfig::worker("m", None), dir.path().to_path_buf());
        assert!(client.session.session_id.is_none());
    }
}
