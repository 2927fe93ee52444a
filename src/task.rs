use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::entry::DirectoryEntry;
use crate::error::ErrorKind;

/// Lifecycle of a transfer.
///
/// `Queued -> InProgress -> {Completed | Failed | Cancelled}`, plus
/// `Queued -> Cancelled` for transfers cancelled before they started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Queued, InProgress)
                | (Queued, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransferStatus::Queued => "queued",
            TransferStatus::InProgress => "downloading",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Reference to one specific transfer of a file.
///
/// Two handles compare equal only if they name the same task; a later
/// download of the same file gets a fresh id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferHandle {
    id: Uuid,
    file_key: String,
}

impl TransferHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn file_key(&self) -> &str {
        &self.file_key
    }
}

/// Result of applying a progress tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    Applied,
    /// The reported byte count went backwards and was held at the last value.
    Clamped,
    Ignored,
}

/// State of one file transfer, keyed by the file's server path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTask {
    pub id: Uuid,
    pub file_key: String,
    pub name: String,
    pub status: TransferStatus,
    pub bytes_written: u64,
    pub bytes_expected: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorKind>,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl TransferTask {
    pub(crate) fn new(file: &DirectoryEntry) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_key: file.path.clone(),
            name: file.name.clone(),
            status: TransferStatus::Queued,
            bytes_written: 0,
            bytes_expected: None,
            started_at: Utc::now(),
            finished_at: None,
            last_error: None,
            local_path: None,
            sha256: None,
        }
    }

    pub fn handle(&self) -> TransferHandle {
        TransferHandle {
            id: self.id,
            file_key: self.file_key.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Completed fraction in `0.0..=1.0`, if the total size is known.
    pub fn progress(&self) -> Option<f64> {
        match self.bytes_expected {
            Some(0) => Some(if self.status == TransferStatus::Completed { 1.0 } else { 0.0 }),
            Some(total) => Some((self.bytes_written as f64 / total as f64).min(1.0)),
            None => None,
        }
    }

    fn transition(&mut self, next: TransferStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            let now = Utc::now();
            self.finished_at = Some(now.max(self.started_at));
        }
        true
    }

    pub(crate) fn begin(&mut self) -> bool {
        self.transition(TransferStatus::InProgress)
    }

    pub(crate) fn record_progress(&mut self, written: u64, expected: Option<u64>) -> Tick {
        if self.status != TransferStatus::InProgress {
            return Tick::Ignored;
        }
        if expected.is_some() {
            self.bytes_expected = expected;
        }
        if written < self.bytes_written {
            return Tick::Clamped;
        }
        self.bytes_written = written;
        Tick::Applied
    }

    /// Marks the transfer done with its final on-disk size.
    pub(crate) fn complete(&mut self, size: u64, local_path: PathBuf, sha256: Option<String>) -> bool {
        if !self.transition(TransferStatus::Completed) {
            return false;
        }
        self.bytes_written = size;
        self.bytes_expected = Some(size);
        self.local_path = Some(local_path);
        self.sha256 = sha256;
        true
    }

    pub(crate) fn fail(&mut self, kind: ErrorKind) -> bool {
        if !self.transition(TransferStatus::Failed) {
            return false;
        }
        self.last_error = Some(kind);
        true
    }

    pub(crate) fn cancel(&mut self) -> bool {
        self.transition(TransferStatus::Cancelled)
    }

    /// A record left unfinished by an earlier session.
    pub(crate) fn interrupted(mut self) -> Self {
        if !self.is_terminal() {
            self.status = TransferStatus::Failed;
            self.last_error = Some(ErrorKind::Unknown);
            self.finished_at = Some(self.started_at);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TransferTask {
        let file = DirectoryEntry::child("Movies", "clip.mp4", false).unwrap();
        TransferTask::new(&file)
    }

    #[test]
    fn new_task_is_keyed_by_path() {
        let t = task();
        assert_eq!(t.file_key, "Movies/clip.mp4");
        assert_eq!(t.name, "clip.mp4");
        assert_eq!(t.status, TransferStatus::Queued);
        assert_eq!(t.handle().file_key(), "Movies/clip.mp4");
    }

    #[test]
    fn terminal_states_are_final() {
        let mut t = task();
        assert!(t.begin());
        assert!(t.complete(10, PathBuf::from("x"), None));
        assert!(!t.fail(ErrorKind::Unknown));
        assert!(!t.cancel());
        assert!(!t.begin());
        assert_eq!(t.status, TransferStatus::Completed);
        assert!(t.finished_at.unwrap() >= t.started_at);
    }

    #[test]
    fn queued_can_be_cancelled_but_not_completed() {
        let mut t = task();
        assert!(!t.complete(1, PathBuf::from("x"), None));
        assert!(t.cancel());
        assert_eq!(t.status, TransferStatus::Cancelled);
    }

    #[test]
    fn regressing_tick_is_clamped() {
        let mut t = task();
        t.begin();
        assert_eq!(t.record_progress(150, Some(200)), Tick::Applied);
        assert_eq!(t.record_progress(100, Some(200)), Tick::Clamped);
        assert_eq!(t.bytes_written, 150);
        assert_eq!(t.progress(), Some(0.75));
    }

    #[test]
    fn ticks_outside_progress_are_ignored() {
        let mut t = task();
        assert_eq!(t.record_progress(5, None), Tick::Ignored);
        t.begin();
        t.cancel();
        assert_eq!(t.record_progress(5, None), Tick::Ignored);
        assert_eq!(t.bytes_written, 0);
    }

    #[test]
    fn completion_aligns_expected_size() {
        let mut t = task();
        t.begin();
        t.record_progress(40, None);
        assert_eq!(t.progress(), None);
        t.complete(64, PathBuf::from("x"), None);
        assert_eq!(t.bytes_written, 64);
        assert_eq!(t.bytes_expected, Some(64));
        assert_eq!(t.progress(), Some(1.0));
    }

    #[test]
    fn interrupted_records_become_failures() {
        let mut t = task();
        t.begin();
        let t = t.interrupted();
        assert_eq!(t.status, TransferStatus::Failed);
        assert_eq!(t.last_error, Some(ErrorKind::Unknown));
    }
}
