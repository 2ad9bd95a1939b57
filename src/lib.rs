//! Harvester Core Library
//!
//! Request orchestration and file harvesting for biomedical data crawlers:
//! per-domain pacing, proxy rotation, persistent platform sessions and a file
//! pipeline that stores every file a scraped record references.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`dispatch`] - Rate limiting, proxy pool and the request middleware
//! - [`session`] - Cookie sessions with optional encryption at rest
//! - [`pipeline`] - Record file classification, download and summaries
//! - [`download`] - HTTP transport and streaming writes
//! - [`config`] - TOML configuration loading

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod dispatch;
pub mod download;
pub mod pipeline;
pub mod session;
pub mod user_agent;

// Re-export commonly used types
pub use config::{ConfigError, HarvesterConfig, LoadedConfig, load_config};
pub use dispatch::{
    Dispatcher, OutboundRequest, ProxyPool, ProxyPoolConfig, RateLimiter, RateLimiterConfig,
    SelectionStrategy,
};
pub use download::{DownloadError, HttpClient};
pub use pipeline::{DownloadSummary, FilePipeline, PipelineError, ScrapedRecord};
pub use session::{SessionConfig, SessionRecord, SessionStore};
pub use user_agent::{RotationStrategy, UserAgentRotator};
