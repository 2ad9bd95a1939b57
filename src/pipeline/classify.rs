//! Turning a record's file references into download requests.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use super::record::{FileRef, ScrapedRecord};

/// What a file is to its record. Decides the storage path shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRole {
    Main,
    Supplementary,
    PeerReview,
    CommentAttachment,
    Image,
    Other,
}

impl FileRole {
    /// The snake_case role name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Supplementary => "supplementary",
            Self::PeerReview => "peer_review",
            Self::CommentAttachment => "comment_attachment",
            Self::Image => "image",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for FileRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file to fetch for a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDownloadRequest {
    pub url: String,
    pub track_id: String,
    pub role: FileRole,
    /// 0 for the main file, 1-based within its list otherwise.
    pub index: usize,
    /// 1-based comment position for comment attachments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Errors raised at pipeline entry.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The record has no usable track id, so its files have nowhere to go.
    #[error("record has no track_id; skipping its file downloads")]
    MissingTrackId,

    /// Download concurrency outside the supported range.
    #[error("invalid concurrency value {value}: must be between 1 and 100")]
    InvalidConcurrency { value: usize },

    /// The blocking summary task did not complete.
    #[error("summary task failed: {reason}")]
    SummaryTask { reason: String },
}

/// Lists every file download a record asks for.
///
/// Order: main file, supplementary files, peer review files, comment
/// attachments, images. References without a URL are skipped but still use up
/// their index, so positions stay stable across runs. Images are stored by URL
/// hash, so a repeated image URL is listed once.
///
/// # Errors
///
/// Returns [`PipelineError::MissingTrackId`] if the record has no track id.
pub fn enumerate_requests(record: &ScrapedRecord) -> Result<Vec<FileDownloadRequest>, PipelineError> {
    let track_id = record.track_id().ok_or(PipelineError::MissingTrackId)?;
    let mut requests = Vec::new();

    let mut push = |url: &str,
                    role: FileRole,
                    index: usize,
                    comment_index: Option<usize>,
                    metadata: Option<&Map<String, Value>>| {
        requests.push(FileDownloadRequest {
            url: url.to_string(),
            track_id: track_id.to_string(),
            role,
            index,
            comment_index,
            metadata: metadata.cloned(),
        });
    };

    if let Some(url) = record.pdf_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        push(url, FileRole::Main, 0, None, None);
    }

    for (role, files) in [
        (FileRole::Supplementary, &record.supplementary_files),
        (FileRole::PeerReview, &record.peer_review_files),
    ] {
        for (index, file) in numbered(files) {
            if let Some(url) = file.url() {
                push(url, role, index, None, file.metadata());
            }
        }
    }

    for (comment_index, comment) in (1..).zip(&record.comments) {
        for (index, file) in numbered(&comment.attachments) {
            if let Some(url) = file.url() {
                push(
                    url,
                    FileRole::CommentAttachment,
                    index,
                    Some(comment_index),
                    file.metadata(),
                );
            }
        }
    }

    let mut seen_images = HashSet::new();
    for (index, url) in (1..).zip(&record.image_urls) {
        let url = url.trim();
        if url.is_empty() {
            continue;
        }
        if seen_images.insert(url) {
            push(url, FileRole::Image, index, None, None);
        } else {
            debug!(track_id, url, "skipping repeated image url");
        }
    }

    Ok(requests)
}

fn numbered(files: &[FileRef]) -> impl Iterator<Item = (usize, &FileRef)> {
    (1..).zip(files)
}
