//! Loading proxy lists from files and HTTP APIs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, instrument};

use crate::download::{DownloadError, HEALTH_CHECK_TIMEOUT_SECS, HttpClient};

/// Errors while loading a proxy list.
#[derive(Debug, Error)]
pub enum ProxySourceError {
    /// The proxy list file could not be read.
    #[error("cannot read proxy list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The proxy API request failed.
    #[error("proxy API request failed: {0}")]
    Fetch(#[from] DownloadError),

    /// The proxy API answered with JSON of an unexpected shape.
    #[error("unrecognized proxy API response from {url}: {reason}")]
    Format { url: String, reason: String },
}

/// Accepted API payloads: `["http://..", ..]` or `{"proxies": [..]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApiPayload {
    List(Vec<String>),
    Wrapped { proxies: Vec<String> },
}

impl From<ApiPayload> for Vec<String> {
    fn from(payload: ApiPayload) -> Self {
        match payload {
            ApiPayload::List(proxies) | ApiPayload::Wrapped { proxies } => proxies,
        }
    }
}

/// Parses a newline-delimited proxy list, skipping blank lines and `#` comments.
#[must_use]
pub fn parse_proxy_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Reads a newline-delimited proxy list file.
///
/// # Errors
///
/// Returns [`ProxySourceError::Io`] if the file cannot be read.
#[instrument(fields(path = %path.display()))]
pub fn load_from_file(path: &Path) -> Result<Vec<String>, ProxySourceError> {
    let text = std::fs::read_to_string(path).map_err(|source| ProxySourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let proxies = parse_proxy_list(&text);
    info!(count = proxies.len(), "loaded proxies from file");
    Ok(proxies)
}

/// Fetches a proxy list from a JSON API.
///
/// # Errors
///
/// Returns [`ProxySourceError::Fetch`] on transport errors or a non-success
/// status, and [`ProxySourceError::Format`] when the body is neither a list of
/// strings nor an object with a `proxies` list.
#[instrument(skip(http))]
pub async fn load_from_api(http: &HttpClient, url: &str) -> Result<Vec<String>, ProxySourceError> {
    let client = http.client_for(None)?;
    let response = client
        .get(url)
        .timeout(Duration::from_secs(HEALTH_CHECK_TIMEOUT_SECS))
        .send()
        .await
        .map_err(|e| DownloadError::network(url, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::http_status(url, status.as_u16()).into());
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| DownloadError::network(url, e))?;
    let proxies = parse_api_payload(url, &body)?;
    info!(count = proxies.len(), "loaded proxies from API");
    Ok(proxies)
}

fn parse_api_payload(url: &str, body: &[u8]) -> Result<Vec<String>, ProxySourceError> {
    serde_json::from_slice::<ApiPayload>(body)
        .map(Vec::from)
        .map_err(|e| ProxySourceError::Format {
            url: url.to_string(),
            reason: e.to_string(),
        })
}
