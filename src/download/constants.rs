//! Constants for the download module (timeouts, buffers).

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large supplementary archives).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Default timeout for a single proxy health probe.
pub const HEALTH_CHECK_TIMEOUT_SECS: u64 = 10;
