//! Concurrent file downloads for one record at a time.
//!
//! # Concurrency Model
//!
//! - Each file of a record is downloaded in its own Tokio task
//! - A semaphore permit is acquired before each download starts
//! - Every task is joined before the summary is built, so the summary always
//!   reflects all of the record's files
//! - Hashing runs on the blocking pool

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::header::CONTENT_TYPE;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::classify::{FileDownloadRequest, FileRole, PipelineError, enumerate_requests};
use super::record::ScrapedRecord;
use super::summary::{DownloadSummary, FileOutcome, summarize};
use crate::dispatch::{Dispatcher, OutboundRequest};
use crate::download::{DownloadError, stream_to_path};
use crate::user_agent::AcceptKind;

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 100;

/// Default number of simultaneous file downloads.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Default download root.
pub const DEFAULT_STORE_DIR: &str = "./data/files";

/// Downloads a record's files through the dispatcher and records the result.
#[derive(Debug)]
pub struct FilePipeline {
    dispatcher: Arc<Dispatcher>,
    store_root: PathBuf,
    semaphore: Arc<Semaphore>,
}

impl FilePipeline {
    /// Creates a pipeline writing under `store_root`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConcurrency`] if `concurrency` is outside 1..=100.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        store_root: impl Into<PathBuf>,
        concurrency: usize,
    ) -> Result<Self, PipelineError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(PipelineError::InvalidConcurrency { value: concurrency });
        }
        Ok(Self {
            dispatcher,
            store_root: store_root.into(),
            semaphore: Arc::new(Semaphore::new(concurrency)),
        })
    }

    /// Download root.
    #[must_use]
    pub fn store_root(&self) -> &Path {
        &self.store_root
    }

    /// Downloads every file the record references and stores the summary in
    /// `record.downloaded_files`.
    ///
    /// Failed files are counted in the summary; they never fail the record.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MissingTrackId`] (record left untouched) when
    /// the record has no track id, and [`PipelineError::SummaryTask`] if the
    /// hashing task dies.
    #[instrument(skip(self, record), fields(track_id = record.track_id().unwrap_or("")))]
    pub async fn process_record(
        &self,
        record: &mut ScrapedRecord,
    ) -> Result<DownloadSummary, PipelineError> {
        let requests = enumerate_requests(record)?;
        let track_id = record.track_id().unwrap_or_default().to_string();
        info!(files = requests.len(), "downloading record files");

        let outcomes = self.download_all(record.platform.clone(), requests).await;

        let root = self.store_root.clone();
        let summary = tokio::task::spawn_blocking(move || summarize(&track_id, &outcomes, &root))
            .await
            .map_err(|e| PipelineError::SummaryTask {
                reason: e.to_string(),
            })?;

        record.downloaded_files = Some(summary.clone());
        Ok(summary)
    }

    /// Runs all downloads and returns outcomes in request order.
    async fn download_all(
        &self,
        platform: Option<String>,
        requests: Vec<FileDownloadRequest>,
    ) -> Vec<FileOutcome> {
        let mut tasks = JoinSet::new();
        for (position, request) in requests.iter().cloned().enumerate() {
            let semaphore = Arc::clone(&self.semaphore);
            let dispatcher = Arc::clone(&self.dispatcher);
            let root = self.store_root.clone();
            let platform = platform.clone();
            tasks.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => fetch_file(&dispatcher, &root, platform, request).await,
                    Err(_) => FileOutcome::failed(request, None, "download semaphore closed"),
                };
                (position, outcome)
            });
        }

        let mut slots: Vec<Option<FileOutcome>> = vec![None; requests.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, outcome)) => slots[position] = Some(outcome),
                Err(e) => warn!(error = %e, "download task panicked"),
            }
        }

        slots
            .into_iter()
            .zip(requests)
            .map(|(slot, request)| {
                slot.unwrap_or_else(|| FileOutcome::failed(request, None, "download task aborted"))
            })
            .collect()
    }
}

/// Fetches one file and streams it to its storage path.
async fn fetch_file(
    dispatcher: &Dispatcher,
    store_root: &Path,
    platform: Option<String>,
    request: FileDownloadRequest,
) -> FileOutcome {
    let mut outbound = OutboundRequest::new(&request.url);
    outbound.platform = platform;
    if request.role == FileRole::Image {
        outbound = outbound.with_accept(AcceptKind::Image);
    }

    let response = match dispatcher.send(&outbound).await {
        Ok(response) => response,
        Err(e) => return FileOutcome::failed(request, None, e.to_string()),
    };

    let status = response.status();
    if !status.is_success() {
        let error = DownloadError::http_status(&request.url, status.as_u16());
        warn!(url = %request.url, role = %request.role, %error, "file download failed");
        return FileOutcome::failed(request, None, error.to_string());
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let ext = request.extension(content_type.as_deref());
    let relative = request.relative_path(&ext);
    let full_path = store_root.join(&relative);

    match stream_to_path(response, &request.url, &full_path).await {
        Ok(bytes) => {
            debug!(url = %request.url, path = %relative, bytes, "file stored");
            FileOutcome::succeeded(request, relative)
        }
        Err(e) => {
            warn!(url = %request.url, error = %e, "failed to store file");
            FileOutcome::failed(request, Some(relative), e.to_string())
        }
    }
}
