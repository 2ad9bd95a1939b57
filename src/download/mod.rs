//! HTTP transport shared by the request dispatcher and the file pipeline.
//!
//! # Features
//!
//! - One pooled client per proxy endpoint
//! - Streaming downloads (memory-efficient for large files)
//! - Structured error types with full context

mod client;
mod constants;
mod error;

pub use client::{HttpClient, stream_to_path};
pub use constants::{CONNECT_TIMEOUT_SECS, HEALTH_CHECK_TIMEOUT_SECS, READ_TIMEOUT_SECS};
pub use error::DownloadError;

// Note: as elsewhere in the crate, no module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
