//! Platform seams around the download core: storage permission, gallery
//! import and user notifications.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::orchestrator::{DownloadEvent, DownloadOrchestrator, DownloadSnapshot};
use crate::task::TransferStatus;

// --- PERMISSION ---

/// Asked once per session before the first download.
pub trait PermissionGate: Send + Sync {
    fn request(&self) -> BoxFuture<'_, bool>;
}

pub struct AlwaysGranted;

impl PermissionGate for AlwaysGranted {
    fn request(&self) -> BoxFuture<'_, bool> {
        Box::pin(async { true })
    }
}

/// Grants storage access when the download directory exists (or can be
/// created) and is not read-only.
pub struct WritableDirectory {
    dir: PathBuf,
}

impl WritableDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl PermissionGate for WritableDirectory {
    fn request(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
                error!(dir = %self.dir.display(), error = %e, "cannot create download directory");
                return false;
            }
            match tokio::fs::metadata(&self.dir).await {
                Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
                Err(_) => false,
            }
        })
    }
}

// --- GALLERY ---

/// Imports a finished download into the user-visible media collection.
pub trait GalleryImporter: Send + Sync {
    fn import<'a>(&'a self, local_path: &'a Path) -> BoxFuture<'a, Result<()>>;
}

pub struct NoGallery;

impl GalleryImporter for NoGallery {
    fn import<'a>(&'a self, _local_path: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Copies finished files into `<root>/<album>/`, creating the album on first
/// use and numbering copies whose name is already taken.
pub struct AlbumImporter {
    root: PathBuf,
    album: String,
}

impl AlbumImporter {
    pub const DEFAULT_ALBUM: &'static str = "Download";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            album: Self::DEFAULT_ALBUM.to_string(),
        }
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = album.into();
        self
    }

    pub fn album_dir(&self) -> PathBuf {
        self.root.join(&self.album)
    }

    async fn copy_in(&self, local_path: &Path) -> Result<()> {
        let name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::NotAFile(local_path.display().to_string()))?;

        let album = self.album_dir();
        tokio::fs::create_dir_all(&album).await?;

        let mut target = album.join(name);
        let mut copy = 1;
        while tokio::fs::try_exists(&target).await? {
            target = album.join(numbered(name, copy));
            copy += 1;
        }

        tokio::fs::copy(local_path, &target).await?;
        info!(file = %target.display(), "imported into album");
        Ok(())
    }
}

impl GalleryImporter for AlbumImporter {
    fn import<'a>(&'a self, local_path: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.copy_in(local_path))
    }
}

fn numbered(name: &str, copy: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({copy}).{ext}"),
        _ => format!("{name} ({copy})"),
    }
}

// --- NOTIFICATIONS ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Started { file_key: String },
    Completed { file_key: String },
    Failed { file_key: String, error: ErrorKind },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Turns successive snapshots into start/complete/fail notices.
///
/// The first snapshot only seeds the tracker, so history restored from an
/// earlier session never produces notices.
#[derive(Default)]
pub struct TransitionTracker {
    seen: HashMap<Uuid, TransferStatus>,
    seeded: bool,
}

impl TransitionTracker {
    pub fn observe(&mut self, snapshot: &DownloadSnapshot) -> Vec<Notice> {
        let mut notices = Vec::new();
        for task in &snapshot.tasks {
            let previous = self.seen.insert(task.id, task.status);
            if !self.seeded || previous == Some(task.status) {
                continue;
            }
            let file_key = task.file_key.clone();
            match task.status {
                TransferStatus::InProgress => notices.push(Notice::Started { file_key }),
                TransferStatus::Completed => notices.push(Notice::Completed { file_key }),
                TransferStatus::Failed => notices.push(Notice::Failed {
                    file_key,
                    error: task.last_error.unwrap_or(ErrorKind::Unknown),
                }),
                TransferStatus::Queued | TransferStatus::Cancelled => {}
            }
        }
        self.seen.retain(|id, _| snapshot.tasks.iter().any(|t| t.id == *id));
        self.seeded = true;
        notices
    }
}

/// Subscribes `notifier` to the orchestrator for as long as it lives.
pub fn spawn_notification_relay(
    orchestrator: &DownloadOrchestrator,
    notifier: Arc<dyn Notifier>,
) -> JoinHandle<()> {
    let mut subscription = orchestrator.subscribe();
    tokio::spawn(async move {
        let mut tracker = TransitionTracker::default();
        while let Some(event) = subscription.recv().await {
            if let DownloadEvent::Snapshot(snapshot) = event {
                for notice in tracker.observe(&snapshot) {
                    notifier.notify(notice);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::DirectoryEntry;
    use crate::task::TransferTask;

    fn snapshot(tasks: &[TransferTask]) -> DownloadSnapshot {
        DownloadSnapshot {
            tasks: tasks.to_vec(),
        }
    }

    #[test]
    fn tracker_reports_each_transition_once() {
        let file = DirectoryEntry::child("", "a.bin", false).unwrap();
        let mut task = TransferTask::new(&file);
        let mut tracker = TransitionTracker::default();

        assert!(tracker.observe(&snapshot(&[])).is_empty());
        assert!(tracker.observe(&snapshot(&[task.clone()])).is_empty());

        task.begin();
        assert_eq!(
            tracker.observe(&snapshot(&[task.clone()])),
            vec![Notice::Started { file_key: "a.bin".into() }]
        );
        task.record_progress(5, Some(10));
        assert!(tracker.observe(&snapshot(&[task.clone()])).is_empty());

        task.fail(ErrorKind::StorageFull);
        assert_eq!(
            tracker.observe(&snapshot(&[task.clone()])),
            vec![Notice::Failed {
                file_key: "a.bin".into(),
                error: ErrorKind::StorageFull
            }]
        );
    }

    #[test]
    fn tracker_ignores_restored_history() {
        let file = DirectoryEntry::child("", "old.bin", false).unwrap();
        let mut task = TransferTask::new(&file);
        task.begin();
        task.complete(3, PathBuf::from("old.bin"), None);

        let mut tracker = TransitionTracker::default();
        assert!(tracker.observe(&snapshot(&[task.clone()])).is_empty());
        assert!(tracker.observe(&snapshot(&[task])).is_empty());
    }

    #[test]
    fn numbered_copies_keep_extension() {
        assert_eq!(numbered("clip.mp4", 1), "clip (1).mp4");
        assert_eq!(numbered("README", 2), "README (2)");
        assert_eq!(numbered(".profile", 1), ".profile (1)");
    }

    #[tokio::test]
    async fn album_import_numbers_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("photo.jpg");
        tokio::fs::write(&source, b"jpeg").await.unwrap();

        let importer = AlbumImporter::new(dir.path().join("gallery"));
        importer.import(&source).await.unwrap();
        importer.import(&source).await.unwrap();

        let album = importer.album_dir();
        assert!(album.join("photo.jpg").exists());
        assert!(album.join("photo (1).jpg").exists());
    }

    #[tokio::test]
    async fn writable_directory_is_created_and_granted() {
        let dir = tempfile::tempdir().unwrap();
        let gate = WritableDirectory::new(dir.path().join("downloads"));
        assert!(gate.request().await);
        assert!(dir.path().join("downloads").is_dir());
    }

    #[tokio::test]
    async fn writable_directory_refuses_when_it_cannot_be_created() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("downloads");
        std::fs::write(&blocker, b"not a folder").unwrap();

        assert!(!WritableDirectory::new(&blocker).request().await);
        assert!(!WritableDirectory::new(blocker.join("nested")).request().await);
    }
}
