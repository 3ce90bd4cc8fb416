//! Code fetcher
//!
//! Retrieves module source text. There is no retry policy here; a failed
//! fetch is fatal to the load attempt that issued it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::http::{HttpRequest, SharedHttpClient};
use crate::core::error::{ConsumetError, Result};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch source text; non-2xx and timeouts are `NetworkError`
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<String>;

    /// Check that `url` is reachable without downloading it
    async fn probe(&self, url: &str, timeout: Duration) -> Result<()>;
}

pub type SharedSourceFetcher = Arc<dyn SourceFetcher>;

/// Fetches over HTTP, with `file://` URLs and scheme-less paths read from disk
pub struct HttpSourceFetcher {
    client: SharedHttpClient,
}

impl HttpSourceFetcher {
    pub fn new(client: SharedHttpClient) -> Self {
        Self { client }
    }
}

/// Disk location of `url`: `file://` URLs and scheme-less paths
///
/// `Ok(None)` means http(s); any other scheme is refused.
fn local_path(url: &str) -> Result<Option<PathBuf>> {
    if let Some(rest) = url.strip_prefix("file://") {
        return Ok(Some(PathBuf::from(rest)));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(None);
    }
    match url.split_once("://") {
        Some((scheme, _)) => Err(ConsumetError::NetworkError(format!(
            "unsupported source scheme '{}' in {}",
            scheme, url
        ))),
        None => Ok(Some(PathBuf::from(url))),
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<String> {
        if let Some(path) = local_path(url)? {
            return tokio::fs::read_to_string(&path).await.map_err(|e| {
                ConsumetError::NetworkError(format!("failed to read {}: {}", path.display(), e))
            });
        }

        let mut request = HttpRequest::get(url).timeout(options.timeout);
        request.headers = options.headers.clone();

        let response = tokio::time::timeout(options.timeout, self.client.execute(request))
            .await
            .map_err(|_| {
                ConsumetError::NetworkError(format!(
                    "fetching {} timed out after {}ms",
                    url,
                    options.timeout.as_millis()
                ))
            })??;

        if !response.is_success() {
            return Err(ConsumetError::NetworkError(format!(
                "fetching {} returned HTTP {} {}",
                url, response.status, response.status_text
            )));
        }

        tracing::debug!(url = %url, bytes = response.body.len(), "fetched module source");
        Ok(response.body)
    }

    async fn probe(&self, url: &str, timeout: Duration) -> Result<()> {
        if let Some(path) = local_path(url)? {
            return match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => Ok(()),
                Ok(_) => Err(ConsumetError::NetworkError(format!("{} is not a file", path.display()))),
                Err(e) => Err(ConsumetError::NetworkError(format!(
                    "failed to stat {}: {}",
                    path.display(),
                    e
                ))),
            };
        }

        let request = HttpRequest::head(url).timeout(timeout);
        let response = tokio::time::timeout(timeout, self.client.execute(request))
            .await
            .map_err(|_| ConsumetError::NetworkError(format!("HEAD {} timed out", url)))??;

        if !response.is_success() {
            return Err(ConsumetError::NetworkError(format!(
                "HEAD {} returned HTTP {}",
                url, response.status
            )));
        }
        Ok(())
    }
}

/// In-memory sources keyed by URL, with fetch counters
///
/// Used for bundled extensions and offline fixtures.
#[derive(Default)]
pub struct MemorySourceFetcher {
    sources: RwLock<HashMap<String, String>>,
    fetches: AtomicUsize,
    probes: AtomicUsize,
}

impl MemorySourceFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, source: impl Into<String>) {
        if let Ok(mut sources) = self.sources.write() {
            sources.insert(url.into(), source.into());
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn lookup(&self, url: &str) -> Result<String> {
        self.sources
            .read()
            .ok()
            .and_then(|sources| sources.get(url).cloned())
            .ok_or_else(|| ConsumetError::NetworkError(format!("fetching {} returned HTTP 404", url)))
    }
}

#[async_trait]
impl SourceFetcher for MemorySourceFetcher {
    async fn fetch(&self, url: &str, _options: &FetchOptions) -> Result<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.lookup(url)
    }

    async fn probe(&self, url: &str, _timeout: Duration) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.lookup(url).map(|_| ())
    }
}
