use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure taxonomy shared by listing and transfers.
///
/// A `TransferTask` only ever records one of these, never the full [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    RemoteUnavailable,
    InvalidResponse,
    NotFound,
    PermissionDenied,
    StorageFull,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::RemoteUnavailable => "remote unavailable",
            ErrorKind::InvalidResponse => "invalid response",
            ErrorKind::NotFound => "not found",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::StorageFull => "storage full",
            ErrorKind::Unknown => "unknown error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Server unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Invalid server response: {0}")]
    InvalidResponse(String),

    #[error("Not found on server: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Storage full: {0}")]
    StorageFull(String),

    #[error("Transfer failed: {0}")]
    Unknown(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Not in the current directory: {0}")]
    NotInCurrentDirectory(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Invalid server address: {0}")]
    InvalidAddress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal error: {0}")]
    Journal(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RemoteUnavailable(_) => ErrorKind::RemoteUnavailable,
            Error::InvalidResponse(_) => ErrorKind::InvalidResponse,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::StorageFull(_) => ErrorKind::StorageFull,
            Error::Io(e) => io_error_kind(e),
            Error::Unknown(_)
            | Error::NotADirectory(_)
            | Error::NotAFile(_)
            | Error::NotInCurrentDirectory(_)
            | Error::Cancelled
            | Error::InvalidAddress(_)
            | Error::Journal(_) => ErrorKind::Unknown,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Error::InvalidResponse(e.to_string())
        } else {
            Error::RemoteUnavailable(e.to_string())
        }
    }
}

/// Maps local storage failures onto the taxonomy.
pub(crate) fn io_error_kind(e: &std::io::Error) -> ErrorKind {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::ReadOnlyFilesystem => {
            ErrorKind::PermissionDenied
        }
        std::io::ErrorKind::StorageFull => ErrorKind::StorageFull,
        _ => ErrorKind::Unknown,
    }
}

pub type Result<T> = std::result::Result<T, Error>;
