use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::entry::{is_hidden, DirectoryEntry};
use crate::error::{Error, Result};

// --- SERVER ADDRESS ---

/// Base URL of the file server, derived once from the discovery handshake.
///
/// The handshake yields a bare `host:port`; this is turned into
/// `http://host:port` and never re-resolved afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress(String);

impl ServerAddress {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::InvalidAddress("empty address".to_string()));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(Error::InvalidAddress(raw.to_string()));
        }

        let base = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };
        let base = base.trim_end_matches('/').to_string();

        let url = reqwest::Url::parse(&base).map_err(|e| Error::InvalidAddress(format!("{raw}: {e}")))?;
        if url.host_str().is_none() {
            return Err(Error::InvalidAddress(raw.to_string()));
        }

        Ok(Self(base))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn endpoint(&self, method: &str) -> String {
        format!("{}/{}", self.0, method)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- LISTING SEAM ---

/// Source of directory listings for the navigation stack.
///
/// `path == ""` is the server's home directory. Implementations must drop
/// hidden entries and must report malformed payloads as
/// [`Error::InvalidResponse`] rather than an empty listing.
pub trait Lister: Send + Sync {
    fn list<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<DirectoryEntry>>>;
}

impl<T: Lister + ?Sized> Lister for Arc<T> {
    fn list<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<DirectoryEntry>>> {
        (**self).list(path)
    }
}

// --- HTTP CLIENT ---

#[derive(Deserialize, Debug)]
struct RawEntry {
    name: String,
    is_dir: bool,
}

#[derive(Clone)]
pub struct ListingClient {
    client: Client,
    server: ServerAddress,
    timeout: Option<Duration>,
}

impl ListingClient {
    pub fn new(server: ServerAddress, timeout: Option<Duration>) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .build()
            .unwrap_or_default();

        Self {
            client,
            server,
            timeout,
        }
    }

    pub fn server(&self) -> &ServerAddress {
        &self.server
    }

    /// Pings `GET /connect` and returns whatever greeting the server sends.
    pub async fn connect(&self) -> Result<serde_json::Value> {
        let url = self.server.endpoint("connect");
        let response = self.request(&url, None).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::RemoteUnavailable(format!("connect returned HTTP {status}")));
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| Error::InvalidResponse(format!("connect: {e}")))
    }

    pub async fn list(&self, path: &str) -> Result<Vec<DirectoryEntry>> {
        let url = if path.is_empty() {
            self.server.endpoint("home")
        } else {
            self.server.endpoint("list")
        };
        let query = (!path.is_empty()).then_some(path);

        debug!(path, %url, "listing directory");

        let response = self.request(&url, query).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            let shown = if path.is_empty() { "<home>" } else { path };
            return Err(Error::NotFound(shown.to_string()));
        }
        if !status.is_success() {
            return Err(Error::RemoteUnavailable(format!("listing returned HTTP {status}")));
        }

        let body = response.text().await?;
        let entries = parse_listing(path, &body)?;
        debug!(path, count = entries.len(), "listing parsed");
        Ok(entries)
    }

    fn request(&self, url: &str, path: Option<&str>) -> reqwest::RequestBuilder {
        let mut request = self.client.get(url);
        if let Some(path) = path {
            request = request.query(&[("path", path)]);
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        request
    }
}

impl Lister for ListingClient {
    fn list<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<DirectoryEntry>>> {
        Box::pin(ListingClient::list(self, path))
    }
}

/// Parses a listing body for the directory at `parent`.
///
/// Hidden names are filtered out; anything other than an array of
/// `{name, is_dir}` objects, or a listing with repeated names, is rejected.
pub fn parse_listing(parent: &str, body: &str) -> Result<Vec<DirectoryEntry>> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| Error::InvalidResponse(format!("JSON parse error: {e}")))?;

    let serde_json::Value::Array(items) = value else {
        return Err(Error::InvalidResponse("expected a JSON array of entries".to_string()));
    };

    let mut seen = HashSet::with_capacity(items.len());
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let raw: RawEntry = serde_json::from_value(item)
            .map_err(|e| Error::InvalidResponse(format!("malformed entry: {e}")))?;
        if is_hidden(&raw.name) {
            continue;
        }

        let entry = DirectoryEntry::child(parent, &raw.name, raw.is_dir)?;
        if !seen.insert(entry.path.clone()) {
            return Err(Error::InvalidResponse(format!("duplicate entry: {}", entry.name)));
        }
        entries.push(entry);
    }

    Ok(entries)
}
