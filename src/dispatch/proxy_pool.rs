//! Rotating proxy pool with per-proxy health scoring and temporary bans.
//!
//! Proxies are never removed. A proxy that fails `max_fail_count` times is
//! banned; it becomes selectable again once `ban_duration` has passed since it
//! was last handed out, and a single success lifts the ban.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::download::{DownloadError, HEALTH_CHECK_TIMEOUT_SECS, HttpClient};

/// Default endpoint probed by [`ProxyPool::health_check`].
pub const DEFAULT_HEALTH_CHECK_URL: &str = "http://httpbin.org/ip";

/// Weight of the success rate in the composite score.
const SCORE_SUCCESS_WEIGHT: f64 = 0.7;
/// Weight of the response-time bonus in the composite score.
const SCORE_SPEED_WEIGHT: f64 = 0.3;
/// Response time (seconds) at which the speed bonus reaches zero.
const SCORE_SLOW_SECS: f64 = 3.0;

/// Transport protocol of a proxy endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    /// Plain HTTP proxy.
    #[default]
    Http,
    /// HTTPS proxy.
    Https,
    /// SOCKS5 proxy.
    Socks5,
}

impl ProxyProtocol {
    /// Infers the protocol from a proxy URL scheme, defaulting to HTTP.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        let scheme = url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();
        match scheme.as_str() {
            "https" => Self::Https,
            "socks5" | "socks5h" => Self::Socks5,
            _ => Self::Http,
        }
    }

    /// Returns the lowercase protocol name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How [`ProxyPool::get_proxy`] picks among eligible proxies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Walks the pool in insertion order, skipping ineligible proxies.
    #[default]
    RoundRobin,
    /// Uniform pick among eligible proxies.
    Random,
    /// Highest composite score; the first proxy wins ties.
    BestPerformance,
}

/// Proxy pool settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyPoolConfig {
    pub strategy: SelectionStrategy,
    /// Failures after which a proxy is banned.
    pub max_fail_count: u32,
    /// Cooldown before a banned proxy is eligible again.
    pub ban_duration: Duration,
    pub health_check_url: String,
    pub health_check_timeout: Duration,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::RoundRobin,
            max_fail_count: 5,
            ban_duration: Duration::from_secs(300),
            health_check_url: DEFAULT_HEALTH_CHECK_URL.to_string(),
            health_check_timeout: Duration::from_secs(HEALTH_CHECK_TIMEOUT_SECS),
        }
    }
}

/// Health and usage state of one proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRecord {
    pub url: String,
    pub protocol: ProxyProtocol,
    pub success_count: u64,
    pub fail_count: u64,
    pub last_used: Option<Instant>,
    pub last_success: Option<Instant>,
    /// Two-point rolling average of successful response times.
    pub response_time: Option<Duration>,
    pub is_banned: bool,
}

impl ProxyRecord {
    fn new(url: String, protocol: ProxyProtocol) -> Self {
        Self {
            url,
            protocol,
            success_count: 0,
            fail_count: 0,
            last_used: None,
            last_success: None,
            response_time: None,
            is_banned: false,
        }
    }

    /// Fraction of successful uses (0 with no samples).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.fail_count;
        if total == 0 {
            return 0.0;
        }
        self.success_count as f64 / total as f64
    }

    /// Composite score: 70% success rate plus up to 30% for responses under 3s.
    #[must_use]
    pub fn score(&self) -> f64 {
        let secs = self.response_time.map_or(0.0, |rt| rt.as_secs_f64());
        let speed = (SCORE_SPEED_WEIGHT * (1.0 - secs / SCORE_SLOW_SECS)).max(0.0);
        SCORE_SUCCESS_WEIGHT * self.success_rate() + speed
    }

    /// Whether the proxy may be handed out at `now`.
    ///
    /// A banned proxy that was never handed out stays ineligible.
    #[must_use]
    pub fn is_eligible(&self, now: Instant, ban_duration: Duration) -> bool {
        !self.is_banned
            || self
                .last_used
                .is_some_and(|used| now.saturating_duration_since(used) > ban_duration)
    }

    fn endpoint(&self) -> ProxyEndpoint {
        ProxyEndpoint {
            url: self.url.clone(),
            protocol: self.protocol,
        }
    }
}

/// A proxy handed out for one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    pub url: String,
    pub protocol: ProxyProtocol,
}

/// Result of a [`ProxyPool::health_check`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Banned proxies after the sweep.
    pub banned: usize,
}

/// Aggregate view of the pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    /// Proxies that are not banned.
    pub available: usize,
    pub banned: usize,
    /// Mean success rate over all proxies.
    pub avg_success_rate: f64,
    /// Mean response time over proxies with at least one timed success.
    #[serde(with = "optional_secs")]
    pub avg_response_time: Option<Duration>,
}

#[derive(Debug)]
struct ProxySlot {
    record: Mutex<ProxyRecord>,
}

impl ProxySlot {
    fn with_record<T>(&self, f: impl FnOnce(&mut ProxyRecord) -> T) -> T {
        let mut guard = self.record.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

/// Thread-safe proxy pool.
///
/// Share via `Arc`. Each proxy's record has its own lock, so outcome
/// reporting on one proxy never waits on another.
#[derive(Debug)]
pub struct ProxyPool {
    config: ProxyPoolConfig,
    /// Insertion order, used by round robin and reporting.
    order: RwLock<Vec<Arc<ProxySlot>>>,
    by_url: DashMap<String, Arc<ProxySlot>>,
    /// Position in `order` where the next round-robin scan starts.
    cursor: Mutex<usize>,
}

impl ProxyPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(config: ProxyPoolConfig) -> Self {
        Self {
            config,
            order: RwLock::new(Vec::new()),
            by_url: DashMap::new(),
            cursor: Mutex::new(0),
        }
    }

    /// Creates a pool pre-filled with `urls`.
    #[must_use]
    pub fn with_proxies<I, S>(config: ProxyPoolConfig, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pool = Self::new(config);
        pool.extend_from(urls);
        pool
    }

    /// Returns the pool settings.
    #[must_use]
    pub fn config(&self) -> &ProxyPoolConfig {
        &self.config
    }

    /// Number of proxies in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    /// Whether the pool has no proxies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a proxy. The protocol is inferred from the scheme when `None`.
    ///
    /// Returns `false` if the URL is blank or already in the pool.
    pub fn add_proxy(&self, url: impl Into<String>, protocol: Option<ProxyProtocol>) -> bool {
        let url = url.into().trim().to_string();
        if url.is_empty() {
            return false;
        }

        let mut order = self.order.write().unwrap_or_else(PoisonError::into_inner);
        if self.by_url.contains_key(&url) {
            debug!(proxy = %url, "proxy already in pool");
            return false;
        }

        let protocol = protocol.unwrap_or_else(|| ProxyProtocol::from_url(&url));
        let slot = Arc::new(ProxySlot {
            record: Mutex::new(ProxyRecord::new(url.clone(), protocol)),
        });
        order.push(Arc::clone(&slot));
        self.by_url.insert(url.clone(), slot);
        debug!(proxy = %url, %protocol, "added proxy");
        true
    }

    /// Adds every URL, skipping duplicates. Returns how many were new.
    pub fn extend_from<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        urls.into_iter()
            .map(|url| usize::from(self.add_proxy(url, None)))
            .sum()
    }

    fn slots(&self) -> Vec<Arc<ProxySlot>> {
        self.order
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Picks an eligible proxy according to the strategy and stamps its `last_used`.
    ///
    /// Returns `None` when the pool is empty or every proxy is banned.
    #[instrument(skip(self), fields(strategy = ?self.config.strategy))]
    pub fn get_proxy(&self) -> Option<ProxyEndpoint> {
        let slots = self.slots();
        if slots.is_empty() {
            warn!("proxy pool is empty");
            return None;
        }

        let now = Instant::now();
        let ban = self.config.ban_duration;
        let picked = match self.config.strategy {
            SelectionStrategy::RoundRobin => self.pick_round_robin(&slots, now),
            SelectionStrategy::Random => {
                let eligible: Vec<&Arc<ProxySlot>> = slots
                    .iter()
                    .filter(|slot| slot.with_record(|r| r.is_eligible(now, ban)))
                    .collect();
                eligible
                    .choose(&mut rand::thread_rng())
                    .map(|slot| slot.with_record(|r| stamp(r, now)))
            }
            SelectionStrategy::BestPerformance => {
                let mut best: Option<(&Arc<ProxySlot>, f64)> = None;
                for slot in &slots {
                    let Some(score) =
                        slot.with_record(|r| r.is_eligible(now, ban).then(|| r.score()))
                    else {
                        continue;
                    };
                    if best.is_none_or(|(_, top)| score > top) {
                        best = Some((slot, score));
                    }
                }
                best.map(|(slot, _)| slot.with_record(|r| stamp(r, now)))
            }
        };

        match &picked {
            Some(endpoint) => debug!(proxy = %endpoint.url, "selected proxy"),
            None => warn!(total = slots.len(), "no eligible proxy available"),
        }
        picked
    }

    fn pick_round_robin(&self, slots: &[Arc<ProxySlot>], now: Instant) -> Option<ProxyEndpoint> {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let len = slots.len();
        for offset in 0..len {
            let index = (*cursor + offset) % len;
            let picked = slots[index].with_record(|r| {
                r.is_eligible(now, self.config.ban_duration)
                    .then(|| stamp(r, now))
            });
            if picked.is_some() {
                *cursor = (index + 1) % len;
                return picked;
            }
        }
        None
    }

    /// Records a successful use of `url`, lifting any ban.
    ///
    /// Unknown URLs are ignored.
    pub fn mark_success(&self, url: &str, response_time: Duration) {
        let Some(slot) = self.slot(url) else {
            debug!(proxy = %url, "success reported for unknown proxy");
            return;
        };
        slot.with_record(|r| {
            r.success_count += 1;
            r.last_success = Some(Instant::now());
            r.response_time = Some(match r.response_time {
                Some(avg) => (avg + response_time) / 2,
                None => response_time,
            });
            if r.is_banned {
                info!(proxy = %url, "proxy recovered, lifting ban");
            }
            r.is_banned = false;
            debug!(
                proxy = %url,
                success_rate = format!("{:.1}%", r.success_rate() * 100.0),
                "proxy success"
            );
        });
    }

    /// Records a failed use of `url`, banning it at `max_fail_count` failures.
    ///
    /// Unknown URLs are ignored.
    pub fn mark_failure(&self, url: &str, reason: &str) {
        let Some(slot) = self.slot(url) else {
            debug!(proxy = %url, "failure reported for unknown proxy");
            return;
        };
        let max_fail_count = u64::from(self.config.max_fail_count);
        slot.with_record(|r| {
            r.fail_count += 1;
            if r.fail_count >= max_fail_count {
                if !r.is_banned {
                    warn!(proxy = %url, fail_count = r.fail_count, reason, "banning proxy");
                }
                r.is_banned = true;
            } else {
                debug!(proxy = %url, fail_count = r.fail_count, reason, "proxy failure");
            }
        });
    }

    fn slot(&self, url: &str) -> Option<Arc<ProxySlot>> {
        self.by_url.get(url).map(|slot| Arc::clone(&slot))
    }

    /// Returns a snapshot of one proxy's record.
    #[must_use]
    pub fn record(&self, url: &str) -> Option<ProxyRecord> {
        self.slot(url).map(|slot| slot.with_record(|r| r.clone()))
    }

    /// Returns snapshots of every record in insertion order.
    #[must_use]
    pub fn records(&self) -> Vec<ProxyRecord> {
        self.slots()
            .iter()
            .map(|slot| slot.with_record(|r| r.clone()))
            .collect()
    }

    /// Probes every proxy against the health-check URL.
    ///
    /// HTTP 200 counts as healthy and is recorded as a success with the probe's
    /// latency; any other status or a transport error is recorded as a failure.
    /// Every probe stamps the proxy's `last_used`. Since a ban's cooldown runs
    /// from `last_used`, a failed probe restarts the cooldown of a banned proxy,
    /// while a passing probe lifts the ban.
    #[instrument(skip_all, fields(url = %self.config.health_check_url))]
    pub async fn health_check(&self, http: &HttpClient) -> HealthReport {
        let slots = self.slots();
        info!(total = slots.len(), "starting proxy health check");

        let probes = slots.iter().map(|slot| {
            let url = slot.with_record(|r| {
                r.last_used = Some(Instant::now());
                r.url.clone()
            });
            async move {
                let started = Instant::now();
                let outcome = self.probe(http, &url).await;
                (url, outcome.map(|()| started.elapsed()))
            }
        });

        let mut report = HealthReport {
            total: slots.len(),
            ..HealthReport::default()
        };
        for (url, outcome) in join_all(probes).await {
            match outcome {
                Ok(elapsed) => {
                    self.mark_success(&url, elapsed);
                    report.healthy += 1;
                }
                Err(reason) => {
                    self.mark_failure(&url, &reason);
                    report.unhealthy += 1;
                }
            }
        }
        report.banned = self
            .records()
            .iter()
            .filter(|r| r.is_banned)
            .count();

        info!(
            healthy = report.healthy,
            unhealthy = report.unhealthy,
            banned = report.banned,
            "proxy health check complete"
        );
        report
    }

    async fn probe(&self, http: &HttpClient, proxy: &str) -> Result<(), String> {
        let client = http
            .probe_client(proxy, self.config.health_check_timeout)
            .map_err(|e| e.to_string())?;
        let response = client
            .get(&self.config.health_check_url)
            .send()
            .await
            .map_err(|e| DownloadError::network(&self.config.health_check_url, e).to_string())?;
        let status = response.status().as_u16();
        if status == 200 {
            Ok(())
        } else {
            Err(format!("status {status}"))
        }
    }

    /// Returns aggregate counters over the pool.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn stats(&self) -> PoolStats {
        let records = self.records();
        let total = records.len();
        let banned = records.iter().filter(|r| r.is_banned).count();

        let avg_success_rate = if total == 0 {
            0.0
        } else {
            records.iter().map(ProxyRecord::success_rate).sum::<f64>() / total as f64
        };

        let timed: Vec<Duration> = records.iter().filter_map(|r| r.response_time).collect();
        let avg_response_time = if timed.is_empty() {
            None
        } else {
            Some(timed.iter().sum::<Duration>() / timed.len() as u32)
        };

        PoolStats {
            total,
            available: total - banned,
            banned,
            avg_success_rate,
            avg_response_time,
        }
    }
}

fn stamp(record: &mut ProxyRecord, now: Instant) -> ProxyEndpoint {
    record.last_used = Some(now);
    record.endpoint()
}

mod optional_secs {
    use std::time::Duration;

    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_f64(d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }
}
