use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::persist::{read_json_opt, write_json_atomic};
use crate::types::{Story, StoryId, StoryStatus};

#[derive(Debug, Error)]
pub enum SprintStatusError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SprintStatusError>;

/// Persisted story id -> status mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SprintStatus {
    pub stories: BTreeMap<StoryId, StoryStatus>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SprintStatus {
    pub fn get(&self, id: &str) -> Option<StoryStatus> {
        self.stories.get(id).copied()
    }

    pub fn set(&mut self, id: impl Into<StoryId>, status: StoryStatus) {
        self.stories.insert(id.into(), status);
    }
}

/// The sprint-status file, shared by every story pipeline.
///
/// All writes go through [`SprintStatusStore::update`], which holds the lock
/// across read, mutate and persist, so concurrent completions cannot lose
/// each other's changes.
pub struct SprintStatusStore {
    path: PathBuf,
    doc: Mutex<SprintStatus>,
}

impl SprintStatusStore {
    pub const FILE_NAME: &'static str = "sprint-status.json";

    /// Open (or lazily create) the store at `{state_root}/sprint-status.json`.
    pub async fn open(state_root: impl AsRef<Path>) -> Result<Self> {
        let path = state_root.as_ref().join(Self::FILE_NAME);
        let doc = read_json_opt::<SprintStatus, SprintStatusError>(&path)
            .await?
            .unwrap_or_default();
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> SprintStatus {
        self.doc.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<StoryStatus> {
        self.doc.lock().await.get(id)
    }

    pub async fn set(&self, id: &str, status: StoryStatus) -> Result<()> {
        debug!(story_id = id, %status, "sprint status");
        self.update(|doc| doc.set(id, status)).await
    }

    /// Atomic read-modify-write. The closure sees the current document; its
    /// changes are persisted before the lock is released and discarded if
    /// persisting fails.
    pub async fn update<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut SprintStatus) -> R,
    {
        let mut guard = self.doc.lock().await;
        let mut next = guard.clone();
        let out = f(&mut next);
        next.updated_at = Some(Utc::now());
        write_json_atomic::<_, SprintStatusError>(&self.path, &next).await?;
        *guard = next;
        Ok(out)
    }

    /// Register stories not yet tracked, using their declared status.
    /// Existing entries win over the backlog file.
    pub async fn seed(&self, stories: &[Story]) -> Result<()> {
        self.update(|doc| {
            for story in stories {
                doc.stories.entry(story.id.clone()).or_insert(story.status);
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn update_persists_and_reopens() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SprintStatusStore::open(tmp.path()).await.unwrap();
        store.set("1-1", StoryStatus::Done).await.unwrap();

        let reopened = SprintStatusStore::open(tmp.path()).await.unwrap();
        assert_eq!(reopened.get("1-1").await, Some(StoryStatus::Done));
        assert!(reopened.snapshot().await.updated_at.is_some());

        let raw = std::fs::read_to_string(tmp.path().join("sprint-status.json")).unwrap();
        assert!(raw.contains("\"1-1\": \"done\""));
    }

    #[tokio::test]
    async fn seed_keeps_existing_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SprintStatusStore::open(tmp.path()).await.unwrap();
        store.set("a", StoryStatus::Merged).await.unwrap();
        store
            .seed(&[Story::new("a", 1, 1, "A"), Story::new("b", 1, 2, "B")])
            .await
            .unwrap();
        assert_eq!(store.get("a").await, Some(StoryStatus::Merged));
        assert_eq!(store.get("b").await, Some(StoryStatus::Backlog));
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(SprintStatusStore::open(tmp.path()).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .update(|doc| doc.set(format!("s-{i}"), StoryStatus::Ready))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.snapshot().await.stories.len(), 16);
    }
}
