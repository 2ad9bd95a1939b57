//! Outbound request orchestration: pacing, proxy rotation and the dispatch
//! cycle that ties them to sessions.
//!
//! # Overview
//!
//! - [`RateLimiter`]: per-domain adaptive delays
//! - [`ProxyPool`]: proxy selection, health scoring and bans
//! - [`Dispatcher`]: runs one request through all of the above
//!
//! All three are plain owned objects meant to be shared through `Arc`.

mod middleware;
mod proxy_pool;
pub mod proxy_source;
mod rate_limiter;

pub use middleware::{DEFAULT_PROXY_RETRIES, DispatchTicket, Dispatcher, OutboundRequest};
pub use proxy_pool::{
    DEFAULT_HEALTH_CHECK_URL, HealthReport, PoolStats, ProxyEndpoint, ProxyPool, ProxyPoolConfig,
    ProxyProtocol, ProxyRecord, SelectionStrategy,
};
pub use proxy_source::ProxySourceError;
pub use rate_limiter::{DomainStats, RateLimiter, RateLimiterConfig, domain_of};
