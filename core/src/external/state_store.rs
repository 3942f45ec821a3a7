//! `JsonFileStateStore`: the one concrete [`StateStore`] implementation
//! this crate carries, storing one JSON document per project plus a
//! bounded history ring and a PID+timestamp lock sentinel.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;

use crate::errors::EngineError;
use crate::external::{ProjectState, StateStore};

const HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockSentinel {
    pid: u32,
    timestamp: chrono::DateTime<chrono::Utc>,
    timeout_ms: u64,
}

impl LockSentinel {
    fn is_expired(&self) -> bool {
        let elapsed = chrono::Utc::now().signed_duration_since(self.timestamp);
        elapsed.num_milliseconds() > self.timeout_ms as i64
    }
}

/// One directory per project under `root`: `state.json`, `history.json`,
/// `state.lock`.
pub struct JsonFileStateStore {
    root: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join(project_id)
    }

    fn state_path(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("state.json")
    }

    fn history_path(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("history.json")
    }

    fn lock_path(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("state.lock")
    }

    async fn ensure_project_dir(&self, project_id: &str) -> Result<(), EngineError> {
        fs::create_dir_all(self.project_dir(project_id)).await?;
        Ok(())
    }

    async fn read_state(&self, path: &Path) -> Result<Option<ProjectState>, EngineError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_state(&self, path: &Path, state: &ProjectState) -> Result<(), EngineError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        fs::write(path, bytes).await?;
        Ok(())
    }

    async fn push_history(&self, project_id: &str, state: &ProjectState) -> Result<(), EngineError> {
        let path = self.history_path(project_id);
        let mut history: Vec<ProjectState> = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        history.push(state.clone());
        if history.len() > HISTORY_LIMIT {
            let overflow = history.len() - HISTORY_LIMIT;
            history.drain(0..overflow);
        }
        fs::write(&path, serde_json::to_vec_pretty(&history)?).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn load_or_create(&self, project_id: &str) -> Result<ProjectState, EngineError> {
        self.ensure_project_dir(project_id).await?;
        let path = self.state_path(project_id);
        if let Some(state) = self.read_state(&path).await? {
            return Ok(state);
        }
        let state = ProjectState::new(project_id);
        self.write_state(&path, &state).await?;
        Ok(state)
    }

    async fn save(&self, state: &ProjectState) -> Result<(), EngineError> {
        self.ensure_project_dir(&state.project_id).await?;
        self.push_history(&state.project_id, state).await?;
        self.write_state(&self.state_path(&state.project_id), state).await
    }

    async fn update(&self, project_id: &str, patch: Value) -> Result<ProjectState, EngineError> {
        let mut state = self
            .read_state(&self.state_path(project_id))
            .await?
            .ok_or_else(|| EngineError::InvalidTask(format!("unknown project `{project_id}`")))?;
        merge_patch(&mut state, patch)?;
        state.version += 1;
        state.updated_at = chrono::Utc::now();
        self.save(&state).await?;
        Ok(state)
    }

    async fn mark_complete(&self, project_id: &str, result: Value) -> Result<ProjectState, EngineError> {
        let mut state = self
            .read_state(&self.state_path(project_id))
            .await?
            .ok_or_else(|| EngineError::InvalidTask(format!("unknown project `{project_id}`")))?;
        state.status = crate::external::ProjectStatus::Completed;
        state.artifacts.push(result);
        state.version += 1;
        state.updated_at = chrono::Utc::now();
        self.save(&state).await?;
        Ok(state)
    }

    async fn rollback(&self, project_id: &str) -> Result<ProjectState, EngineError> {
        let path = self.history_path(project_id);
        let mut history: Vec<ProjectState> = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let previous = history
            .pop()
            .ok_or_else(|| EngineError::InvalidTask(format!("no history for `{project_id}`")))?;
        fs::write(&path, serde_json::to_vec_pretty(&history)?).await?;
        self.write_state(&self.state_path(project_id), &previous).await?;
        Ok(previous)
    }

    async fn get_history(&self, project_id: &str) -> Result<Vec<ProjectState>, EngineError> {
        match fs::read(self.history_path(project_id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn lock(&self, project_id: &str, timeout: Duration) -> Result<(), EngineError> {
        self.ensure_project_dir(project_id).await?;
        let path = self.lock_path(project_id);
        if let Ok(bytes) = fs::read(&path).await {
            if let Ok(existing) = serde_json::from_slice::<LockSentinel>(&bytes) {
                if !existing.is_expired() {
                    return Err(EngineError::StateLocked);
                }
            }
        }
        let sentinel = LockSentinel {
            pid: std::process::id(),
            timestamp: chrono::Utc::now(),
            timeout_ms: timeout.as_millis() as u64,
        };
        fs::write(&path, serde_json::to_vec(&sentinel)?).await?;
        Ok(())
    }

    async fn unlock(&self, project_id: &str) -> Result<(), EngineError> {
        let path = self.lock_path(project_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn merge_patch(state: &mut ProjectState, patch: Value) -> Result<(), EngineError> {
    let mut value = serde_json::to_value(&*state)?;
    json_merge(&mut value, patch);
    *state = serde_json::from_value(value)?;
    Ok(())
}

fn json_merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                json_merge(base_map.entry(key).or_insert(Value::Null), value);
            }
        }
        (base_slot, patch_value) => {
            *base_slot = patch_value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_or_create_writes_a_fresh_document() {
        let dir = std::env::temp_dir().join(format!("task-engine-test-{}", uuid::Uuid::new_v4()));
        let store = JsonFileStateStore::new(&dir);
        let state = store.load_or_create("proj-1").await.unwrap();
        assert_eq!(state.project_id, "proj-1");
        assert_eq!(state.version, 1);
        let reloaded = store.load_or_create("proj-1").await.unwrap();
        assert_eq!(reloaded.version, state.version);
        let _ = fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn second_lock_while_held_fails() {
        let dir = std::env::temp_dir().join(format!("task-engine-test-{}", uuid::Uuid::new_v4()));
        let store = JsonFileStateStore::new(&dir);
        store.load_or_create("proj-1").await.unwrap();
        store.lock("proj-1", Duration::from_secs(60)).await.unwrap();
        let second = store.lock("proj-1", Duration::from_secs(60)).await;
        assert!(matches!(second, Err(EngineError::StateLocked)));
        store.unlock("proj-1").await.unwrap();
        store.lock("proj-1", Duration::from_secs(60)).await.unwrap();
        let _ = fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn expired_lock_is_overwritten() {
        let dir = std::env::temp_dir().join(format!("task-engine-test-{}", uuid::Uuid::new_v4()));
        let store = JsonFileStateStore::new(&dir);
        store.load_or_create("proj-1").await.unwrap();
        store.lock("proj-1", Duration::from_millis(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.lock("proj-1", Duration::from_secs(60)).await.unwrap();
        let _ = fs::remove_dir_all(dir).await;
    }
}
