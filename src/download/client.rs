//! HTTP client wrapper shared by the dispatcher, the proxy health check and
//! the file pipeline.
//!
//! reqwest binds a proxy to a client at build time, so [`HttpClient`] keeps one
//! pooled `reqwest::Client` per proxy URL (plus one direct client) and hands out
//! cheap clones of them.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::{Client, Proxy};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use crate::user_agent;

/// Cache key for the client that talks to origins directly.
const DIRECT_KEY: &str = "";

/// HTTP client factory with per-proxy connection pooling.
///
/// Cloning is cheap; clones share the same client cache.
#[derive(Debug, Clone)]
pub struct HttpClient {
    connect_timeout: Duration,
    read_timeout: Duration,
    clients: Arc<DashMap<String, Client>>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client factory with default timeouts (30s connect, 5min read).
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
    }

    /// Creates a client factory with explicit timeout values.
    #[must_use]
    pub fn with_timeouts(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
            clients: Arc::new(DashMap::new()),
        }
    }

    /// Returns a client routed through `proxy`, or a direct client for `None`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Proxy`] when the proxy URL is rejected by reqwest.
    pub fn client_for(&self, proxy: Option<&str>) -> Result<Client, DownloadError> {
        let key = proxy.unwrap_or(DIRECT_KEY);
        if let Some(client) = self.clients.get(key) {
            return Ok(client.clone());
        }

        let client = self.build(proxy, self.read_timeout)?;
        self.clients.insert(key.to_string(), client.clone());
        debug!(proxy = key, "built HTTP client");
        Ok(client)
    }

    /// Builds an uncached client with a custom total timeout.
    ///
    /// Used for short-lived probes such as proxy health checks.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Proxy`] when the proxy URL is rejected by reqwest.
    pub fn probe_client(&self, proxy: &str, timeout: Duration) -> Result<Client, DownloadError> {
        self.build(Some(proxy), timeout)
    }

    fn build(&self, proxy: Option<&str>, timeout: Duration) -> Result<Client, DownloadError> {
        let mut builder = Client::builder()
            .connect_timeout(self.connect_timeout.min(timeout))
            .timeout(timeout)
            .gzip(true)
            .user_agent(user_agent::default_user_agent());

        builder = match proxy {
            Some(proxy_url) => {
                let resolved =
                    Proxy::all(proxy_url).map_err(|e| DownloadError::proxy(proxy_url, e))?;
                builder.proxy(resolved)
            }
            None => builder.no_proxy(),
        };

        builder
            .build()
            .map_err(|e| DownloadError::proxy(proxy.unwrap_or("direct"), e))
    }
}

/// Streams a response body to `file_path`, creating parent directories.
///
/// A partially written file is removed when streaming fails, so a path on disk
/// always means a complete download.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] for filesystem failures and
/// [`DownloadError::Network`] when the body stream breaks.
#[instrument(skip(response), fields(path = %file_path.display()))]
pub async fn stream_to_path(
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
) -> Result<u64, DownloadError> {
    if let Some(parent) = file_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent, e))?;
    }

    let file = File::create(file_path)
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;

    let result = stream_to_file(file, response, url, file_path).await;
    if result.is_err() {
        debug!("cleaning up partial file after error");
        let _ = tokio::fs::remove_file(file_path).await;
    }
    result
}

async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| DownloadError::network(url, e))?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;

        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;

    Ok(bytes_written)
}
