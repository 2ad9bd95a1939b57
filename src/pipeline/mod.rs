//! File pipeline: classify a record's file references, download them into a
//! fixed directory layout, and attach a checksummed summary to the record.

mod checksum;
mod classify;
mod engine;
mod path;
mod record;
mod summary;

pub use checksum::{sha256_file, sha256_hex};
pub use classify::{FileDownloadRequest, FileRole, PipelineError, enumerate_requests};
pub use engine::{DEFAULT_CONCURRENCY, DEFAULT_STORE_DIR, FilePipeline};
pub use path::{
    FALLBACK_EXTENSION, IMAGE_FALLBACK_EXTENSION, compute_path, encode_track_id, resolve_extension,
};
pub use record::{Comment, FileRef, ScrapedRecord};
pub use summary::{DownloadSummary, DownloadedFile, FileOutcome, summarize};

pub(crate) use path::sanitize_path_segment;
