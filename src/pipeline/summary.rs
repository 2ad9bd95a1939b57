//! Per-record download summary.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::checksum::sha256_file;
use super::classify::{FileDownloadRequest, FileRole};

/// Result of one file download.
#[derive(Debug, Clone, PartialEq)]
pub struct FileOutcome {
    pub request: FileDownloadRequest,
    /// Relative storage path, when it got far enough to know one.
    pub path: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

impl FileOutcome {
    #[must_use]
    pub fn succeeded(request: FileDownloadRequest, path: String) -> Self {
        Self {
            request,
            path: Some(path),
            success: true,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(request: FileDownloadRequest, path: Option<String>, error: impl Into<String>) -> Self {
        Self {
            request,
            path,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// A successfully stored file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedFile {
    pub url: String,
    /// Path relative to the download root.
    pub path: String,
    pub role: FileRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// Hex SHA-256; `None` if the file was gone when summarized, empty if
    /// hashing failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Download counts and stored files for one record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadSummary {
    pub successful: usize,
    pub failed: usize,
    pub files: Vec<DownloadedFile>,
}

/// Builds a record's summary from all of its outcomes.
///
/// Blocking: hashes every stored file under `store_root`.
#[must_use]
pub fn summarize(track_id: &str, outcomes: &[FileOutcome], store_root: &Path) -> DownloadSummary {
    let mut summary = DownloadSummary::default();

    for outcome in outcomes {
        let stored = outcome.path.as_deref().filter(|_| outcome.success);
        let Some(path) = stored else {
            summary.failed += 1;
            continue;
        };

        summary.successful += 1;
        summary.files.push(DownloadedFile {
            url: outcome.request.url.clone(),
            path: path.to_string(),
            role: outcome.request.role,
            metadata: outcome.request.metadata.clone(),
            sha256: digest(&store_root.join(path)),
        });
    }

    info!(
        track_id,
        successful = summary.successful,
        failed = summary.failed,
        "downloads complete"
    );
    let failed: Vec<&str> = outcomes
        .iter()
        .filter(|o| !o.success)
        .map(|o| o.request.url.as_str())
        .collect();
    if !failed.is_empty() {
        warn!(track_id, ?failed, "some downloads failed");
    }

    summary
}

fn digest(full_path: &Path) -> Option<String> {
    if !full_path.exists() {
        return None;
    }
    match sha256_file(full_path) {
        Ok(hex) => Some(hex),
        Err(e) => {
            warn!(path = %full_path.display(), error = %e, "failed to hash downloaded file");
            Some(String::new())
        }
    }
}
