//! Checkpoint journal abstraction (§4.1, §6).
//!
//! Persistent checkpoint storage is an external collaborator per the spec's
//! scope cut; this module defines the trait the Session Store writes
//! through and ships the in-memory implementation used by default and by
//! tests. A real deployment would back this with an append-only
//! newline-delimited JSON file, as §6 specifies for the on-disk format.

use async_trait::async_trait;
use commerce_types::SessionSnapshot;
use dashmap::DashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone, thiserror::Error)]
pub enum JournalError {
    #[error("journal write failed: {0}")]
    WriteFailed(String),
    #[error("no checkpoint found for session '{0}'")]
    NotFound(String),
}

/// One checkpoint record per terminal stage per run, keyed by session id.
/// Implementations need only guarantee that `put` is durable before it
/// returns — the Session Store awaits that before acknowledging a stage.
#[async_trait]
pub trait CheckpointJournal: Send + Sync {
    async fn put(&self, snapshot: SessionSnapshot) -> Result<(), JournalError>;
    async fn get(&self, session_id: &str) -> Result<Option<SessionSnapshot>, JournalError>;
}

/// Default journal: holds the latest snapshot per session in memory. Good
/// enough for tests and for a single-process deployment that accepts losing
/// checkpoints on crash; swap in a file- or database-backed implementation
/// of `CheckpointJournal` for anything durable across restarts.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointJournal {
    snapshots: DashMap<String, SessionSnapshot>,
}

impl InMemoryCheckpointJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn CheckpointJournal> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl CheckpointJournal for InMemoryCheckpointJournal {
    async fn put(&self, snapshot: SessionSnapshot) -> Result<(), JournalError> {
        self.snapshots.insert(snapshot.id.clone(), snapshot);
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionSnapshot>, JournalError> {
        Ok(self.snapshots.get(session_id).map(|e| e.value().clone()))
    }
}

/// Append-only newline-delimited JSON journal, one line per `put()`, for
/// deployments that want checkpoints to survive a process restart. The core
/// contract treats persistence as an external collaborator (§1); this is the
/// one concrete backing store the Transport Adapter wires by default, since
/// `GET /api/session/{id}` and exit code 3 ("journal unwritable") both need
/// something observable at startup.
pub struct FileCheckpointJournal {
    file: AsyncMutex<std::fs::File>,
    path: PathBuf,
}

impl FileCheckpointJournal {
    /// Opens (creating if absent) the journal file in append mode. Fails
    /// fast if the path cannot be opened, so `main` can map it to exit
    /// code 3 before the server starts accepting requests.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| JournalError::WriteFailed(format!("{}: {e}", path.display())))?;
        Ok(Self {
            file: AsyncMutex::new(file),
            path,
        })
    }
}

#[async_trait]
impl CheckpointJournal for FileCheckpointJournal {
    async fn put(&self, snapshot: SessionSnapshot) -> Result<(), JournalError> {
        let line = serde_json::to_string(&snapshot)
            .map_err(|e| JournalError::WriteFailed(e.to_string()))?;
        let mut file = self.file.lock().await;
        writeln!(file, "{line}").map_err(|e| JournalError::WriteFailed(e.to_string()))?;
        file.flush().map_err(|e| JournalError::WriteFailed(e.to_string()))
    }

    /// Scans the file for the last record matching `session_id`. Adequate
    /// for the restart-recovery path this journal exists for; not meant for
    /// high-frequency reads (the core contract doesn't require any).
    async fn get(&self, session_id: &str) -> Result<Option<SessionSnapshot>, JournalError> {
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| JournalError::WriteFailed(e.to_string()))?;
        let mut found = None;
        for line in contents.lines() {
            if let Ok(snapshot) = serde_json::from_str::<SessionSnapshot>(line) {
                if snapshot.id == session_id {
                    found = Some(snapshot);
                }
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use commerce_types::{SessionPath, StageOutputs};

    fn sample(id: &str) -> SessionSnapshot {
        SessionSnapshot {
            id: id.to_string(),
            created_at: Utc::now(),
            last_updated: Utc::now(),
            current_stage: None,
            path: SessionPath::Unknown,
            request_text: "milk".to_string(),
            outputs: StageOutputs::default(),
            last_run: None,
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let journal = InMemoryCheckpointJournal::new();
        journal.put(sample("s1")).await.unwrap();
        let restored = journal.get("s1").await.unwrap();
        assert_eq!(restored.unwrap().id, "s1");
    }

    #[tokio::test]
    async fn unknown_session_returns_none() {
        let journal = InMemoryCheckpointJournal::new();
        assert!(journal.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_journal_round_trips_latest_record() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("commerce-journal-test-{}.ndjson", uuid::Uuid::new_v4()));
        let journal = FileCheckpointJournal::open(&path).unwrap();

        journal.put(sample("s1")).await.unwrap();
        let mut second = sample("s1");
        second.request_text = "rice".to_string();
        journal.put(second).await.unwrap();

        let restored = journal.get("s1").await.unwrap().unwrap();
        assert_eq!(restored.request_text, "rice");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn open_reports_unwritable_paths() {
        let result = FileCheckpointJournal::open("/nonexistent-dir-for-test/journal.ndjson");
        assert!(result.is_err());
    }
}
