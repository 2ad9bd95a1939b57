//! The crawler's record type as seen by the file pipeline.
//!
//! Only the fields that carry file references are typed. Everything else the
//! crawler emitted is kept verbatim in `extra` and written back out unchanged.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::summary::DownloadSummary;

/// One scraped item (dataset, study, article) and its file references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapedRecord {
    /// Identifier joining the record to all of its files.
    #[serde(
        default,
        deserialize_with = "deserialize_track_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub track_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Main document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_url: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supplementary_files: Vec<FileRef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peer_review_files: Vec<FileRef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<Comment>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,

    /// Filled in by the pipeline once every download has finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_files: Option<DownloadSummary>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ScrapedRecord {
    /// Track id with surrounding whitespace removed, if present and non-blank.
    #[must_use]
    pub fn track_id(&self) -> Option<&str> {
        self.track_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// A review comment and its attachments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<FileRef>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A file reference: a bare URL, or an object with `url` and any metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileRef {
    Url(String),
    Detailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(flatten)]
        metadata: Map<String, Value>,
    },
}

impl FileRef {
    /// The referenced URL, if present and non-blank.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        let url = match self {
            Self::Url(url) => Some(url.as_str()),
            Self::Detailed { url, .. } => url.as_deref(),
        };
        url.map(str::trim).filter(|u| !u.is_empty())
    }

    /// Metadata carried alongside the URL (`None` for bare URLs).
    #[must_use]
    pub fn metadata(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Url(_) => None,
            Self::Detailed { metadata, .. } => Some(metadata),
        }
    }
}

impl From<&str> for FileRef {
    fn from(url: &str) -> Self {
        Self::Url(url.to_string())
    }
}

/// Accepts string or numeric track ids; anything else counts as absent.
fn deserialize_track_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(id) => Some(id),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
