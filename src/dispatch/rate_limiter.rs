//! Per-domain adaptive rate limiting for crawler requests.
//!
//! This module provides the [`RateLimiter`] struct which paces requests to the
//! same domain and widens or narrows the pacing delay from observed outcomes.
//!
//! # Overview
//!
//! Each domain gets its own [`DomainStats`]: request counters, a rolling
//! response time and the delay currently enforced between requests. Requests
//! to different domains never wait on each other.
//!
//! # Adaptive policy
//!
//! After every recorded outcome the domain's error rate is evaluated:
//!
//! - error rate above 20%: delay × 1.5, capped at `max_delay`
//! - error rate below 5% and average response under 1s: delay × 0.9, floored at `min_delay`
//! - otherwise the delay is left alone
//!
//! The delay always stays within `[min_delay, max_delay]`.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use harvester_core::dispatch::{RateLimiter, RateLimiterConfig};
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(RateLimiterConfig::default());
//!
//! // First request to a domain proceeds immediately
//! limiter.wait_if_needed("biolincc.nhlbi.nih.gov").await;
//! limiter.record_success("biolincc.nhlbi.nih.gov", Duration::from_millis(350));
//! # }
//! ```

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Error rate above which the delay grows.
const BACKOFF_ERROR_RATE: f64 = 0.20;

/// Error rate below which the delay may shrink.
const RECOVERY_ERROR_RATE: f64 = 0.05;

/// Average response time below which the delay may shrink.
const FAST_RESPONSE: Duration = Duration::from_secs(1);

const BACKOFF_MULTIPLIER: f64 = 1.5;
const RECOVERY_MULTIPLIER: f64 = 0.9;

/// Jitter window applied to the delay when randomization is on (±30%).
const JITTER_LOW: f64 = 0.7;
const JITTER_HIGH: f64 = 1.3;

/// Rate limiter settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// Floor for the per-domain delay, and the delay of an unseen domain.
    pub min_delay: Duration,
    /// Ceiling for the per-domain delay.
    pub max_delay: Duration,
    /// Jitter each wait by ±30%.
    pub randomize: bool,
    /// Re-adjust the delay after each recorded outcome.
    pub adaptive: bool,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            randomize: true,
            adaptive: true,
        }
    }
}

/// Counters and pacing state for one domain.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainStats {
    /// Requests with a recorded outcome.
    pub total_requests: u64,
    /// Requests recorded as successful.
    pub success_requests: u64,
    /// Requests recorded as failed.
    pub failed_requests: u64,
    /// Two-point rolling average of successful response times.
    pub avg_response_time: Option<Duration>,
    /// Delay currently enforced between requests.
    pub current_delay: Duration,
}

impl DomainStats {
    fn new(initial_delay: Duration) -> Self {
        Self {
            total_requests: 0,
            success_requests: 0,
            failed_requests: 0,
            avg_response_time: None,
            current_delay: initial_delay,
        }
    }

    /// Fraction of recorded requests that failed (0 with no samples).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn error_rate(&self) -> f64 {
        let total = self.failed_requests + self.success_requests;
        if total == 0 {
            return 0.0;
        }
        self.failed_requests as f64 / total as f64
    }
}

#[derive(Debug)]
struct DomainState {
    /// Held across the pacing sleep, so waits on one domain are serialized.
    /// `None` until the first request.
    last_request: Mutex<Option<Instant>>,
    /// Never held across an await.
    stats: std::sync::Mutex<DomainStats>,
}

impl DomainState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            last_request: Mutex::new(None),
            stats: std::sync::Mutex::new(DomainStats::new(initial_delay)),
        }
    }

    fn with_stats<T>(&self, f: impl FnOnce(&mut DomainStats) -> T) -> T {
        let mut guard = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

/// Per-domain adaptive rate limiter.
///
/// Designed to be wrapped in `Arc` and shared across Tokio tasks. `DashMap`
/// gives lock-free lookup of a domain's state; the state itself is locked per
/// domain, so outcome recording on one domain never blocks another.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    domains: DashMap<String, Arc<DomainState>>,
}

impl RateLimiter {
    /// Creates a rate limiter. A `max_delay` below `min_delay` is raised to it.
    #[must_use]
    #[instrument(skip_all, fields(min_ms = config.min_delay.as_millis(), max_ms = config.max_delay.as_millis()))]
    pub fn new(mut config: RateLimiterConfig) -> Self {
        config.max_delay = config.max_delay.max(config.min_delay);
        debug!(
            randomize = config.randomize,
            adaptive = config.adaptive,
            "creating rate limiter"
        );
        Self {
            config,
            domains: DashMap::new(),
        }
    }

    /// Returns the limiter settings.
    #[must_use]
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Returns the domain's state, creating it on first touch.
    ///
    /// The `Arc` is cloned so the `DashMap` shard lock is released before any await.
    fn state(&self, domain: &str) -> Arc<DomainState> {
        if let Some(state) = self.domains.get(domain) {
            return Arc::clone(&state);
        }
        self.domains
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(DomainState::new(self.config.min_delay)))
            .clone()
    }

    /// Waits until the domain's delay has elapsed since its last request.
    ///
    /// The first request to a domain proceeds immediately. Concurrent callers on
    /// the same domain queue up behind each other. Returns the time waited.
    #[instrument(skip(self))]
    pub async fn wait_if_needed(&self, domain: &str) -> Duration {
        let state = self.state(domain);
        let mut last_request = state.last_request.lock().await;

        let delay = self.jitter(state.with_stats(|stats| stats.current_delay));
        let wait = match *last_request {
            Some(last) => delay.saturating_sub(last.elapsed()),
            None => {
                debug!(domain, "first request to domain - no delay");
                Duration::ZERO
            }
        };

        if !wait.is_zero() {
            debug!(domain, wait_ms = wait.as_millis(), "applying rate limit delay");
            tokio::time::sleep(wait).await;
        }

        *last_request = Some(Instant::now());
        wait
    }

    /// Records a successful request and its response time.
    #[instrument(skip(self))]
    pub fn record_success(&self, domain: &str, response_time: Duration) {
        let state = self.state(domain);
        state.with_stats(|stats| {
            stats.total_requests += 1;
            stats.success_requests += 1;
            stats.avg_response_time = Some(match stats.avg_response_time {
                Some(avg) => (avg + response_time) / 2,
                None => response_time,
            });
            self.adjust(domain, stats);
        });
    }

    /// Records a failed request.
    #[instrument(skip(self))]
    pub fn record_failure(&self, domain: &str) {
        let state = self.state(domain);
        state.with_stats(|stats| {
            stats.total_requests += 1;
            stats.failed_requests += 1;
            self.adjust(domain, stats);
        });
    }

    /// Returns the delay currently enforced for a domain (`min_delay` if unseen).
    #[must_use]
    pub fn current_delay(&self, domain: &str) -> Duration {
        self.domains
            .get(domain)
            .map_or(self.config.min_delay, |state| {
                state.with_stats(|stats| stats.current_delay)
            })
    }

    /// Returns a snapshot of a domain's counters, or `None` if it was never seen.
    #[must_use]
    pub fn stats(&self, domain: &str) -> Option<DomainStats> {
        self.domains
            .get(domain)
            .map(|state| state.with_stats(|stats| stats.clone()))
    }

    /// Re-evaluates the delay. Called with the domain's stats lock held.
    fn adjust(&self, domain: &str, stats: &mut DomainStats) {
        if !self.config.adaptive {
            return;
        }

        let error_rate = stats.error_rate();
        let current = stats.current_delay;

        if error_rate > BACKOFF_ERROR_RATE {
            let next = current.mul_f64(BACKOFF_MULTIPLIER).min(self.config.max_delay);
            if next != current {
                warn!(
                    domain,
                    error_rate = format!("{:.1}%", error_rate * 100.0),
                    old_ms = current.as_millis(),
                    new_ms = next.as_millis(),
                    "high error rate, increasing delay"
                );
            }
            stats.current_delay = next;
        } else if error_rate < RECOVERY_ERROR_RATE
            && stats.avg_response_time.is_some_and(|avg| avg < FAST_RESPONSE)
        {
            let next = current.mul_f64(RECOVERY_MULTIPLIER).max(self.config.min_delay);
            if next < current {
                info!(
                    domain,
                    old_ms = current.as_millis(),
                    new_ms = next.as_millis(),
                    "domain healthy, decreasing delay"
                );
                stats.current_delay = next;
            }
        }
    }

    fn jitter(&self, delay: Duration) -> Duration {
        if !self.config.randomize || delay.is_zero() {
            return delay;
        }
        delay.mul_f64(rand::thread_rng().gen_range(JITTER_LOW..=JITTER_HIGH))
    }
}

/// Extracts the pacing key (lower-cased host) from a URL.
///
/// Returns "unknown" for malformed URLs, so such requests are still paced.
///
/// # Examples
///
/// ```
/// use harvester_core::dispatch::domain_of;
///
/// assert_eq!(domain_of("https://BioPortal.bioontology.org/ontologies"), "bioportal.bioontology.org");
/// assert_eq!(domain_of("http://localhost:8080/x"), "localhost");
/// assert_eq!(domain_of("not a url"), "unknown");
/// ```
#[must_use]
pub fn domain_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}
