use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::task::TransferTask;

const JOURNAL_VERSION: u32 = 1;

/// On-disk record of the session's transfers (active and recent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferJournal {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub tasks: Vec<TransferTask>,
}

impl TransferJournal {
    pub fn new(tasks: Vec<TransferTask>) -> Self {
        Self {
            version: JOURNAL_VERSION,
            saved_at: Utc::now(),
            tasks,
        }
    }

    /// Loads a journal; a missing file is an empty journal.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new(Vec::new()));
        }
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Writes the journal through a temporary file so a crash mid-write never
    /// leaves a truncated record behind.
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Tasks as they should be shown after a restart: anything that was still
    /// running is reported as failed.
    pub fn into_history(self) -> Vec<TransferTask> {
        self.tasks.into_iter().map(TransferTask::interrupted).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::DirectoryEntry;
    use crate::error::ErrorKind;
    use crate::task::TransferStatus;
    use std::path::PathBuf;

    #[test]
    fn missing_journal_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TransferJournal::load_from_file(dir.path().join("nope.json")).unwrap();
        assert!(journal.tasks.is_empty());
    }

    #[tokio::test]
    async fn saved_journal_reloads_with_interrupted_tasks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/transfers.json");

        let done_file = DirectoryEntry::child("Music", "song.mp3", false).unwrap();
        let mut done = TransferTask::new(&done_file);
        done.begin();
        done.complete(42, PathBuf::from("downloads/Music/song.mp3"), Some("ab".into()));

        let running_file = DirectoryEntry::child("", "big.iso", false).unwrap();
        let mut running = TransferTask::new(&running_file);
        running.begin();

        TransferJournal::new(vec![done.clone(), running])
            .save_to_file(&path)
            .await
            .unwrap();

        let history = TransferJournal::load_from_file(&path).unwrap().into_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], done);
        assert_eq!(history[1].status, TransferStatus::Failed);
        assert_eq!(history[1].last_error, Some(ErrorKind::Unknown));
    }

    #[test]
    fn corrupt_journal_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(TransferJournal::load_from_file(&path).is_err());
    }
}
