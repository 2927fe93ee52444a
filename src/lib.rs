//! Client for a LAN file server: browse its directory tree lazily and pull
//! files down with live progress.
//!
//! Two pieces do the work:
//!
//! - [`NavigationStack`] keeps the path the user is browsing as a stack of
//!   cached listings fetched through a [`Lister`] (normally [`ListingClient`]).
//! - [`DownloadOrchestrator`] runs transfers through a [`Transport`] (normally
//!   [`HttpTransport`]), one task per file, and pushes snapshots to every
//!   [`Subscription`].
//!
//! ```no_run
//! use lanfetch::{DownloadOrchestrator, HttpTransport, ListingClient, NavigationStack, ServerAddress};
//! use std::sync::Arc;
//!
//! # async fn example() -> lanfetch::Result<()> {
//! let server = ServerAddress::parse("192.168.1.20:8080")?;
//! let mut nav = NavigationStack::open(ListingClient::new(server.clone(), None)).await?;
//! let downloads = DownloadOrchestrator::new(Arc::new(HttpTransport::new(server, "./downloads", None)));
//!
//! if let Some(movies) = nav.find("Movies").cloned() {
//!     nav.descend(&movies).await?;
//! }
//! if let Some(file) = nav.current().iter().find(|e| !e.is_directory).cloned() {
//!     let handle = downloads.start_download(&file).await?;
//!     downloads.wait(&handle).await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod config;
pub mod entry;
pub mod error;
pub mod journal;
pub mod listing;
pub mod navigation;
pub mod orchestrator;
pub mod task;
pub mod transport;

pub use collaborators::{
    spawn_notification_relay, AlbumImporter, AlwaysGranted, GalleryImporter, NoGallery, Notice,
    Notifier, PermissionGate, WritableDirectory,
};
pub use config::ClientConfig;
pub use entry::DirectoryEntry;
pub use error::{Error, ErrorKind, Result};
pub use journal::TransferJournal;
pub use listing::{Lister, ListingClient, ServerAddress};
pub use navigation::{NavigationFrame, NavigationStack};
pub use orchestrator::{DownloadEvent, DownloadOrchestrator, DownloadSnapshot, OrchestratorConfig, Subscription};
pub use task::{TransferHandle, TransferStatus, TransferTask};
pub use transport::{HttpTransport, ProgressSink, TransferOutcome, TransferRequest, Transport};
