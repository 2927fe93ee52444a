//! The byte-moving boundary of a download.
//!
//! The orchestrator only knows the [`Transport`] contract: stream one file to
//! local storage, report `(bytes_written, bytes_expected)` ticks through a
//! [`ProgressSink`] at any cadence, and stop with [`Error::Cancelled`] once the
//! cancellation token fires. [`HttpTransport`] is the implementation that talks
//! to the server's `/download` endpoint.

use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::listing::ServerAddress;

/// What to fetch: the server-relative path and the display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub file_key: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub local_path: PathBuf,
    pub bytes_written: u64,
    pub sha256: Option<String>,
}

/// Callback handed to a transport for reporting progress ticks.
#[derive(Clone)]
pub struct ProgressSink {
    report: Arc<dyn Fn(u64, Option<u64>) + Send + Sync>,
}

impl ProgressSink {
    pub fn new<F>(report: F) -> Self
    where
        F: Fn(u64, Option<u64>) + Send + Sync + 'static,
    {
        Self {
            report: Arc::new(report),
        }
    }

    pub fn report(&self, bytes_written: u64, bytes_expected: Option<u64>) {
        (self.report)(bytes_written, bytes_expected);
    }
}

pub trait Transport: Send + Sync {
    fn fetch<'a>(
        &'a self,
        request: TransferRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<TransferOutcome>>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn fetch<'a>(
        &'a self,
        request: TransferRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<TransferOutcome>> {
        (**self).fetch(request, progress, cancel)
    }
}

// --- HTTP TRANSPORT ---

/// Streams `GET /download?path=...` into `download_dir`, mirroring the
/// server-relative path so same-named files in different folders never clash.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    server: ServerAddress,
    download_dir: PathBuf,
}

impl HttpTransport {
    pub fn new(server: ServerAddress, download_dir: impl Into<PathBuf>, connect_timeout: Option<Duration>) -> Self {
        let mut builder = Client::builder().pool_idle_timeout(Some(Duration::from_secs(90)));
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }

        Self {
            client: builder.build().unwrap_or_default(),
            server,
            download_dir: download_dir.into(),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Local destination for a server path; rejects paths that would escape
    /// the download directory.
    pub fn local_path_for(&self, file_key: &str) -> Result<PathBuf> {
        let mut path = self.download_dir.clone();
        for segment in file_key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
                return Err(Error::Unknown(format!("unsafe file path: {file_key}")));
            }
            path.push(segment);
        }
        Ok(path)
    }

    async fn download(
        &self,
        request: TransferRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome> {
        let local_path = self.local_path_for(&request.file_key)?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let url = self.server.endpoint("download");
        let send = self
            .client
            .get(&url)
            .query(&[("path", request.file_key.as_str())])
            .send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = send => response?,
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(request.file_key));
        }
        if !status.is_success() {
            return Err(Error::RemoteUnavailable(format!("download returned HTTP {status}")));
        }

        let expected = response.content_length();
        progress.report(0, expected);
        debug!(file = %request.file_key, ?expected, "download started");

        let partial = partial_path(&local_path);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut stream = response.bytes_stream();

        let copied = async {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    next = stream.next() => next,
                };
                let Some(chunk) = next else { break };
                let data = chunk?;
                file.write_all(&data).await?;
                hasher.update(&data);
                written += data.len() as u64;
                progress.report(written, expected);
            }
            file.flush().await?;
            Ok::<(), Error>(())
        }
        .await;
        drop(file);

        let copied = copied.and_then(|()| match expected {
            Some(expected) if expected != written => Err(Error::RemoteUnavailable(format!(
                "stream ended after {written} of {expected} bytes"
            ))),
            _ => Ok(()),
        });
        if let Err(e) = copied {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        tokio::fs::rename(&partial, &local_path).await?;
        Ok(TransferOutcome {
            local_path,
            bytes_written: written,
            sha256: Some(hex::encode(hasher.finalize())),
        })
    }
}

impl Transport for HttpTransport {
    fn fetch<'a>(
        &'a self,
        request: TransferRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<TransferOutcome>> {
        Box::pin(self.download(request, progress, cancel))
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}
