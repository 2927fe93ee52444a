use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One item in a server directory listing.
///
/// `path` is server-relative and always the join of the owning frame's path
/// and `name`; the home directory itself has the empty path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub is_directory: bool,
    pub path: String,
}

impl DirectoryEntry {
    /// Builds the entry for `name` inside the directory at `parent`.
    ///
    /// Names must be non-empty, must not contain a path separator and must not
    /// be a relative component (`.`/`..`).
    pub fn child(parent: &str, name: &str, is_directory: bool) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidResponse("entry with empty name".to_string()));
        }
        if name.contains('/') || name.contains('\\') {
            return Err(Error::InvalidResponse(format!(
                "entry name contains a path separator: {name}"
            )));
        }
        if name == "." || name == ".." {
            return Err(Error::InvalidResponse(format!(
                "entry name is a relative component: {name}"
            )));
        }

        Ok(Self {
            name: name.to_string(),
            is_directory,
            path: join_path(parent, name),
        })
    }

    pub fn is_hidden(&self) -> bool {
        is_hidden(&self.name)
    }
}

/// Joins a server-relative directory path and an entry name with `/`.
pub fn join_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Dot-prefixed names are never shown to the user.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Last segment of a server-relative path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_paths_join_with_slash() {
        let top = DirectoryEntry::child("", "Movies", true).unwrap();
        assert_eq!(top.path, "Movies");

        let nested = DirectoryEntry::child("Movies/2024", "clip.mp4", false).unwrap();
        assert_eq!(nested.path, "Movies/2024/clip.mp4");
        assert!(!nested.is_directory);
    }

    #[test]
    fn child_rejects_bad_names() {
        assert!(DirectoryEntry::child("", "", false).is_err());
        assert!(DirectoryEntry::child("", "a/b", false).is_err());
        assert!(DirectoryEntry::child("", "..", true).is_err());
    }

    #[test]
    fn hidden_and_file_name() {
        assert!(is_hidden(".DS_Store"));
        assert!(!is_hidden("notes.txt"));
        assert_eq!(file_name("Movies/2024/clip.mp4"), "clip.mp4");
        assert_eq!(file_name("clip.mp4"), "clip.mp4");
    }
}
