//! Lazy, stack-shaped browsing of the server's directory tree.
//!
//! A directory is only fetched when the user enters it. Its listing stays
//! cached for as long as its frame is on the stack, so bouncing between a
//! folder and its parent costs no round-trips. Returning home always fetches a
//! fresh home listing.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::entry::{join_path, DirectoryEntry};
use crate::error::{Error, Result};
use crate::listing::Lister;

/// One level of the stack: a directory path and its listing.
///
/// Frames are immutable once built; a refresh replaces the whole frame.
#[derive(Debug, Clone)]
pub struct NavigationFrame {
    path: String,
    entries: Vec<DirectoryEntry>,
    fetched_at: DateTime<Utc>,
}

impl NavigationFrame {
    fn new(path: String, entries: Vec<DirectoryEntry>) -> Self {
        Self {
            path,
            entries,
            fetched_at: Utc::now(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }
}

/// Stack of visited directories, root first.
///
/// All operations take `&mut self`, so a navigation command can only start
/// once the previous one has completed.
pub struct NavigationStack<L> {
    lister: L,
    frames: Vec<NavigationFrame>,
}

impl<L: Lister> NavigationStack<L> {
    /// Fetches the home listing and builds a root-only stack.
    pub async fn open(lister: L) -> Result<Self> {
        let entries = lister.list("").await?;
        Ok(Self {
            lister,
            frames: vec![NavigationFrame::new(String::new(), entries)],
        })
    }

    pub fn lister(&self) -> &L {
        &self.lister
    }

    /// Number of frames above the root.
    pub fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    pub fn current_frame(&self) -> &NavigationFrame {
        // The root frame is never popped.
        &self.frames[self.frames.len() - 1]
    }

    /// What the user sees right now.
    pub fn current(&self) -> &[DirectoryEntry] {
        self.current_frame().entries()
    }

    pub fn path(&self) -> &str {
        self.current_frame().path()
    }

    pub fn frames(&self) -> &[NavigationFrame] {
        &self.frames
    }

    /// Looks up an entry of the current directory by display name.
    pub fn find(&self, name: &str) -> Option<&DirectoryEntry> {
        self.current().iter().find(|e| e.name == name)
    }

    /// Enters `entry`, pushing a frame only once its listing has arrived.
    ///
    /// `entry` must be a directory listed in the current frame.
    pub async fn descend(&mut self, entry: &DirectoryEntry) -> Result<()> {
        if !entry.is_directory {
            return Err(Error::NotADirectory(entry.path.clone()));
        }
        if entry.path != join_path(self.path(), &entry.name) {
            return Err(Error::NotInCurrentDirectory(entry.path.clone()));
        }

        let entries = self.lister.list(&entry.path).await?;
        debug!(path = %entry.path, count = entries.len(), "descended");
        self.frames
            .push(NavigationFrame::new(entry.path.clone(), entries));
        Ok(())
    }

    /// Pops the current frame. Returns `false` when already at the root.
    pub fn ascend(&mut self) -> bool {
        if self.frames.len() > 1 {
            self.frames.pop();
            true
        } else {
            false
        }
    }

    /// Re-lists the current directory and swaps in a new frame.
    ///
    /// On failure the stale frame stays in place.
    pub async fn refresh(&mut self) -> Result<()> {
        let path = self.path().to_string();
        match self.lister.list(&path).await {
            Ok(entries) => {
                let last = self.frames.len() - 1;
                self.frames[last] = NavigationFrame::new(path, entries);
                Ok(())
            }
            Err(e) => {
                warn!(path = %path, error = %e, "refresh failed, keeping cached listing");
                Err(e)
            }
        }
    }

    /// Goes back to a freshly listed home directory.
    ///
    /// Cached frames are discarded only if the home listing succeeds.
    pub async fn return_home(&mut self) -> Result<()> {
        let entries = self.lister.list("").await?;
        self.frames.clear();
        self.frames.push(NavigationFrame::new(String::new(), entries));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use futures::future::BoxFuture;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    enum Reply {
        Listing(Vec<(&'static str, bool)>),
        Fail(ErrorKind),
    }

    /// Scripted lister that counts calls per path.
    #[derive(Default)]
    struct FakeServer {
        replies: Mutex<HashMap<String, Reply>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeServer {
        fn reply(&self, path: &str, reply: Reply) {
            self.replies.lock().unwrap().insert(path.to_string(), reply);
        }

        fn calls_for(&self, path: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|p| *p == path).count()
        }
    }

    impl Lister for FakeServer {
        fn list<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<DirectoryEntry>>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(path.to_string());
                let reply = self.replies.lock().unwrap().get(path).cloned();
                match reply {
                    Some(Reply::Listing(items)) => Ok(items
                        .into_iter()
                        .filter(|(name, _)| !name.starts_with('.'))
                        .map(|(name, dir)| DirectoryEntry::child(path, name, dir).unwrap())
                        .collect()),
                    Some(Reply::Fail(ErrorKind::NotFound)) | None => Err(Error::NotFound(path.into())),
                    Some(Reply::Fail(_)) => Err(Error::RemoteUnavailable("offline".into())),
                }
            })
        }
    }

    fn server() -> Arc<FakeServer> {
        let server = Arc::new(FakeServer::default());
        server.reply("", Reply::Listing(vec![("Movies", true), (".hidden", false), ("a.txt", false)]));
        server.reply("Movies", Reply::Listing(vec![("2024", true), ("clip.mp4", false)]));
        server.reply("Movies/2024", Reply::Listing(vec![("new.mp4", false)]));
        server
    }

    #[tokio::test]
    async fn root_hides_dot_entries() {
        let server = Arc::new(FakeServer::default());
        server.reply("", Reply::Listing(vec![("Movies", true), (".hidden", false)]));

        let stack = NavigationStack::open(server).await.unwrap();
        let names: Vec<_> = stack.current().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Movies"]);
        assert_eq!(stack.depth(), 0);
    }

    #[tokio::test]
    async fn descend_and_ascend_track_depth() {
        let mut stack = NavigationStack::open(server()).await.unwrap();

        let movies = stack.find("Movies").cloned().unwrap();
        stack.descend(&movies).await.unwrap();
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.path(), "Movies");

        let year = stack.find("2024").cloned().unwrap();
        stack.descend(&year).await.unwrap();
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.current()[0].path, "Movies/2024/new.mp4");

        assert!(stack.ascend());
        assert!(stack.ascend());
        assert!(!stack.ascend());
        assert_eq!(stack.depth(), 0);
        assert!(stack.current_frame().is_root());
    }

    #[tokio::test]
    async fn failed_descend_leaves_stack_untouched() {
        let server = server();
        server.reply("Movies", Reply::Fail(ErrorKind::RemoteUnavailable));
        let mut stack = NavigationStack::open(server).await.unwrap();

        let movies = stack.find("Movies").cloned().unwrap();
        let err = stack.descend(&movies).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteUnavailable);
        assert_eq!(stack.depth(), 0);
        assert!(stack.find("Movies").is_some());
    }

    #[tokio::test]
    async fn descend_rejects_files() {
        let server = server();
        let mut stack = NavigationStack::open(server.clone()).await.unwrap();

        let file = stack.find("a.txt").cloned().unwrap();
        assert!(matches!(stack.descend(&file).await, Err(Error::NotADirectory(_))));
        assert_eq!(server.calls_for("a.txt"), 0);
    }

    #[tokio::test]
    async fn descend_rejects_entries_from_another_frame() {
        let server = server();
        let mut stack = NavigationStack::open(server.clone()).await.unwrap();

        let movies = stack.find("Movies").cloned().unwrap();
        stack.descend(&movies).await.unwrap();
        let year = stack.find("2024").cloned().unwrap();

        stack.ascend();
        let err = stack.descend(&year).await.unwrap_err();
        assert!(matches!(err, Error::NotInCurrentDirectory(ref p) if p == "Movies/2024"));
        assert_eq!(stack.depth(), 0);
        assert_eq!(server.calls_for("Movies/2024"), 0);

        // Stale root entry while inside Movies.
        stack.descend(&movies).await.unwrap();
        assert!(stack.descend(&movies).await.is_err());
        assert_eq!(stack.path(), "Movies");
    }

    #[tokio::test]
    async fn ascend_reuses_cached_parent() {
        let server = server();
        let mut stack = NavigationStack::open(server.clone()).await.unwrap();

        let movies = stack.find("Movies").cloned().unwrap();
        stack.descend(&movies).await.unwrap();
        let year = stack.find("2024").cloned().unwrap();
        stack.descend(&year).await.unwrap();
        stack.ascend();

        assert_eq!(stack.path(), "Movies");
        assert_eq!(server.calls_for("Movies"), 1);
        assert_eq!(server.calls_for(""), 1);
    }

    #[tokio::test]
    async fn refresh_replaces_frame_or_keeps_stale() {
        let server = server();
        let mut stack = NavigationStack::open(server.clone()).await.unwrap();
        let movies = stack.find("Movies").cloned().unwrap();
        stack.descend(&movies).await.unwrap();

        server.reply("Movies", Reply::Listing(vec![("clip.mp4", false), ("extra.mp4", false)]));
        stack.refresh().await.unwrap();
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.current().len(), 2);

        server.reply("Movies", Reply::Fail(ErrorKind::RemoteUnavailable));
        assert!(stack.refresh().await.is_err());
        assert_eq!(stack.current().len(), 2);
        assert_eq!(stack.path(), "Movies");
    }

    #[tokio::test]
    async fn return_home_fetches_fresh_root() {
        let server = server();
        let mut stack = NavigationStack::open(server.clone()).await.unwrap();
        let movies = stack.find("Movies").cloned().unwrap();
        stack.descend(&movies).await.unwrap();

        server.reply("", Reply::Listing(vec![("Music", true)]));
        stack.return_home().await.unwrap();

        assert_eq!(stack.depth(), 0);
        assert_eq!(server.calls_for(""), 2);
        assert!(stack.find("Music").is_some());
        assert!(stack.find("Movies").is_none());
    }
}
