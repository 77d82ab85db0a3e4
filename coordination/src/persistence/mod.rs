//! Resumable state persistence (§4.C).
//!
//! Durable single-writer store rooted at a directory (default
//! `.claude-runner/` inside the working directory), with `sessions/`,
//! `checkpoints/`, and `cache/` subdirectories. All files are JSON and all
//! writes go through `write_atomic` (write to `<name>.tmp`, then rename).

mod atomic;
mod cache;

pub use atomic::write_atomic;
pub use cache::ResultCache;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::config::PersistenceConfig;
use crate::data_model::{Checkpoint, Plan};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to (de)serialize session state: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no such session: {0}")]
    NotFound(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub goal_hash: String,
    pub goal_primary: String,
    pub plan: Option<Plan>,
    pub current_step_number: Option<u32>,
    pub status: SessionRecordStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRecordStatus {
    Active,
    Completed,
    Failed,
}

/// Hashes a goal's primary description into the stable id used to find a
/// resumable session for "the same" goal across process restarts.
pub fn goal_hash(primary: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    primary.trim().to_lowercase().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// The store serializes every mutation through this mutex so readers never
/// observe a half-written temp file (§4.C concurrency policy).
pub struct PersistenceStore {
    root: PathBuf,
    config: PersistenceConfig,
    lock: Mutex<()>,
}

impl PersistenceStore {
    pub fn new(working_dir: &Path, config: PersistenceConfig) -> Self {
        let root = working_dir.join(&config.dir);
        Self {
            root,
            config,
            lock: Mutex::new(()),
        }
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub async fn initialize(&self) -> PersistenceResult<()> {
        let _guard = self.lock.lock().await;
        for dir in [self.sessions_dir(), self.checkpoints_dir(), self.cache_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| PersistenceError::Io { path: dir, source })?;
        }
        Ok(())
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.json"))
    }

    pub async fn save_session(&self, record: &SessionRecord) -> PersistenceResult<()> {
        let _guard = self.lock.lock().await;
        write_atomic(&self.session_path(&record.session_id), record).await
    }

    pub async fn load_session(&self, session_id: &str) -> PersistenceResult<SessionRecord> {
        let path = self.session_path(session_id);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| PersistenceError::Io { path: path.clone(), source })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Scans `sessions/` for the most recently updated non-completed session
    /// whose goal hash matches.
    pub async fn find_resumable(&self, goal_primary: &str) -> PersistenceResult<Option<SessionRecord>> {
        let hash = goal_hash(goal_primary);
        let dir = self.sessions_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PersistenceError::Io { path: dir, source }),
        };
        let mut best: Option<SessionRecord> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| PersistenceError::Io { path: dir.clone(), source })?
        {
            let text = match tokio::fs::read_to_string(entry.path()).await {
                Ok(text) => text,
                Err(_) => continue,
            };
            let Ok(record) = serde_json::from_str::<SessionRecord>(&text) else {
                continue;
            };
            if record.goal_hash != hash || record.status != SessionRecordStatus::Active {
                continue;
            }
            if best.as_ref().map(|b| record.updated_at > b.updated_at).unwrap_or(true) {
                best = Some(record);
            }
        }
        Ok(best)
    }

    pub async fn create_checkpoint(&self, checkpoint: &Checkpoint) -> PersistenceResult<()> {
        let _guard = self.lock.lock().await;
        let path = self
            .checkpoints_dir()
            .join(format!("{}-{}.json", checkpoint.session_id, checkpoint.tag));
        write_atomic(&path, checkpoint).await?;
        self.prune_checkpoints(&checkpoint.session_id).await
    }

    async fn prune_checkpoints(&self, session_id: &str) -> PersistenceResult<()> {
        let dir = self.checkpoints_dir();
        let prefix = format!("{session_id}-");
        let mut entries = Vec::new();
        let mut read = tokio::fs::read_dir(&dir)
            .await
            .map_err(|source| PersistenceError::Io { path: dir.clone(), source })?;
        while let Some(entry) = read
            .next_entry()
            .await
            .map_err(|source| PersistenceError::Io { path: dir.clone(), source })?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) {
                if let Ok(metadata) = entry.metadata().await {
                    if let Ok(modified) = metadata.modified() {
                        entries.push((modified, entry.path()));
                    }
                }
            }
        }
        entries.sort_by_key(|(modified, _)| *modified);
        let max = self.config.max_checkpoints;
        if entries.len() > max {
            for (_, path) in &entries[..entries.len() - max] {
                let _ = tokio::fs::remove_file(path).await;
            }
        }
        Ok(())
    }

    /// Removes session files whose `updated_at` is older than
    /// `cleanup_age_days`.
    pub async fn cleanup(&self) -> PersistenceResult<usize> {
        let _guard = self.lock.lock().await;
        let dir = self.sessions_dir();
        let cutoff = Utc::now() - ChronoDuration::days(self.config.cleanup_age_days as i64);
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(PersistenceError::Io { path: dir, source }),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| PersistenceError::Io { path: dir.clone(), source })?
        {
            let Ok(text) = tokio::fs::read_to_string(entry.path()).await else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<SessionRecord>(&text) else {
                continue;
            };
            if record.status != SessionRecordStatus::Active && record.updated_at < cutoff {
                if tokio::fs::remove_file(entry.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    pub fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir().join(format!("{key}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initialize_creates_directory_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path(), PersistenceConfig::default());
        store.initialize().await.unwrap();
        assert!(dir.path().join(".claude-runner/sessions").is_dir());
        assert!(dir.path().join(".claude-runner/checkpoints").is_dir());
        assert!(dir.path().join(".claude-runner/cache").is_dir());
    }

    #[tokio::test]
    async fn session_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path(), PersistenceConfig::default());
        store.initialize().await.unwrap();
        let record = SessionRecord {
            session_id: "abc123".into(),
            goal_hash: goal_hash("print hi"),
            goal_primary: "print hi".into(),
            plan: None,
            current_step_number: None,
            status: SessionRecordStatus::Active,
            started_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.save_session(&record).await.unwrap();
        let loaded = store.load_session("abc123").await.unwrap();
        assert_eq!(loaded.session_id, record.session_id);
        assert_eq!(loaded.goal_hash, record.goal_hash);
    }

    #[tokio::test]
    async fn find_resumable_matches_goal_hash_and_active_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path(), PersistenceConfig::default());
        store.initialize().await.unwrap();
        let mut record = SessionRecord {
            session_id: "s1".into(),
            goal_hash: goal_hash("build the thing"),
            goal_primary: "build the thing".into(),
            plan: None,
            current_step_number: Some(2),
            status: SessionRecordStatus::Active,
            started_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.save_session(&record).await.unwrap();
        let found = store.find_resumable("build the thing").await.unwrap();
        assert!(found.is_some());

        record.status = SessionRecordStatus::Completed;
        store.save_session(&record).await.unwrap();
        let found = store.find_resumable("build the thing").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn checkpoint_pruning_keeps_only_max_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PersistenceConfig::default();
        config.max_checkpoints = 2;
        let store = PersistenceStore::new(dir.path(), config);
        store.initialize().await.unwrap();
        for i in 0..5 {
            let checkpoint = Checkpoint {
                session_id: "s1".into(),
                goal_hash: "h".into(),
                plan: Plan::default(),
                current_step_number: None,
                completed_steps: vec![],
                started_at: Utc::now(),
                tag: format!("tag-{i}"),
                created_at: Utc::now(),
            };
            store.create_checkpoint(&checkpoint).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let mut entries = tokio::fs::read_dir(dir.path().join(".claude-runner/checkpoints"))
            .await
            .unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }
}
