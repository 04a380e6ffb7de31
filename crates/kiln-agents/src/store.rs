//! Durable build snapshots.
//!
//! The engine keeps authoritative state in memory and writes a flattened
//! [`BuildSnapshot`] after progress changes and at every terminal outcome.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kiln_core::types::{Build, BuildMode, BuildStatus, PowerMode};

use crate::output::collect_build_files;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("snapshot serialization failed: {0}")]
    Serialize(String),
    #[error("snapshot backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSnapshot {
    pub build_id: Uuid,
    pub user_id: u64,
    pub status: BuildStatus,
    pub mode: BuildMode,
    pub power_mode: PowerMode,
    pub tech_stack: Option<String>,
    pub files_json: String,
    pub file_count: usize,
    pub progress: u8,
    pub duration_secs: i64,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BuildSnapshot {
    /// Flatten `build`, merging every completed task's files.
    pub fn from_build(build: &Build) -> Result<Self, StoreError> {
        let files = collect_build_files(build);
        let files_json =
            serde_json::to_string(&files).map_err(|e| StoreError::Serialize(e.to_string()))?;
        let tech_stack = build
            .tech_stack
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialize(e.to_string()))?;
        let end = build.completed_at.unwrap_or_else(Utc::now);

        Ok(Self {
            build_id: build.id,
            user_id: build.user_id,
            status: build.status,
            mode: build.mode,
            power_mode: build.power_mode,
            tech_stack,
            files_json,
            file_count: files.len(),
            progress: build.progress,
            duration_secs: (end - build.created_at).num_seconds().max(0),
            error: build.error.clone(),
            completed_at: build.completed_at,
        })
    }
}

/// Persistence backend for snapshots. `upsert` is keyed by build id and must
/// be idempotent.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn upsert(&self, snapshot: BuildSnapshot) -> Result<(), StoreError>;
    async fn get(&self, build_id: Uuid) -> Result<Option<BuildSnapshot>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: DashMap<Uuid, BuildSnapshot>,
    writes: AtomicU64,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Total upserts received, including overwrites.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn upsert(&self, snapshot: BuildSnapshot) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.snapshots.insert(snapshot.build_id, snapshot);
        Ok(())
    }

    async fn get(&self, build_id: Uuid) -> Result<Option<BuildSnapshot>, StoreError> {
        Ok(self.snapshots.get(&build_id).map(|s| s.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::types::{BuildRequest, GeneratedFile, Task, TaskOutput, TaskType};

    #[tokio::test]
    async fn upsert_is_idempotent_per_build() {
        let store = InMemorySnapshotStore::new();
        let mut build = Build::new(7, &BuildRequest::new("todo app"));
        let mut task = Task::new(build.id, TaskType::GenerateUi, "ui", 60, 2);
        task.output = Some(TaskOutput {
            files: vec![GeneratedFile::new("src/App.tsx", "export default 1;")],
            messages: Vec::new(),
        });
        build.tasks.push(task);

        let snap = BuildSnapshot::from_build(&build).unwrap();
        assert_eq!(snap.file_count, 1);
        store.upsert(snap.clone()).await.unwrap();
        store.upsert(snap).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.write_count(), 2);
        let loaded = store.get(build.id).await.unwrap().unwrap();
        assert_eq!(loaded.user_id, 7);
        assert!(loaded.files_json.contains("src/App.tsx"));
    }
}
