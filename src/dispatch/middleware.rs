//! Request dispatch: the per-request cycle around every outbound fetch.
//!
//! Before a request the [`Dispatcher`] picks a proxy, paces the domain, picks
//! a User-Agent and attaches the platform's session cookies. After it, the
//! outcome is fed back to the rate limiter and the proxy pool, and any cookies
//! the server set are merged into the platform session. A proxied request that
//! gets no response is retried through the next proxy the pool hands out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{COOKIE, HeaderMap, USER_AGENT};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::proxy_pool::{ProxyEndpoint, ProxyPool};
use super::rate_limiter::{RateLimiter, domain_of};
use crate::download::{DownloadError, HttpClient};
use crate::session::{CapturedCookies, SessionStore, capture_cookies, cookie_header};
use crate::user_agent::{AcceptKind, UserAgentRotator, browser_headers, default_user_agent};

/// Default number of retries through another proxy after a transport failure.
pub const DEFAULT_PROXY_RETRIES: u32 = 2;

/// Statuses that indicate the proxy, not the origin, is the problem.
const PROXY_BLOCKING_STATUSES: &[u16] = &[403, 407, 429];

/// An outbound request as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub url: String,
    /// Platform whose session cookies apply.
    pub platform: Option<String>,
    pub account: Option<String>,
    /// Set to `false` to go direct even when the pool has proxies.
    pub use_proxy: bool,
    /// Content the request asks for, used for browser headers.
    pub accept: AcceptKind,
}

impl OutboundRequest {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            platform: None,
            account: None,
            use_proxy: true,
            accept: AcceptKind::Document,
        }
    }

    #[must_use]
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    #[must_use]
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    #[must_use]
    pub fn without_proxy(mut self) -> Self {
        self.use_proxy = false;
        self
    }

    #[must_use]
    pub fn with_accept(mut self, accept: AcceptKind) -> Self {
        self.accept = accept;
        self
    }
}

/// Everything decided for one request before it is sent.
#[derive(Debug, Clone)]
pub struct DispatchTicket {
    pub url: String,
    pub domain: String,
    pub proxy: Option<ProxyEndpoint>,
    pub user_agent: String,
    /// Browser headers matching a rotated User-Agent; empty for the tool UA.
    pub headers: HeaderMap,
    /// Session cookies to send.
    pub cookies: BTreeMap<String, String>,
    pub platform: Option<String>,
    pub account: Option<String>,
    /// Time spent waiting on the rate limiter.
    pub waited: Duration,
    started: Instant,
}

impl DispatchTicket {
    /// Time since the request was released by the rate limiter.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Proxy URL, if the request goes through one.
    #[must_use]
    pub fn proxy_url(&self) -> Option<&str> {
        self.proxy.as_ref().map(|p| p.url.as_str())
    }
}

/// Shared request orchestration. Share via `Arc`.
#[derive(Debug)]
pub struct Dispatcher {
    http: HttpClient,
    rate_limiter: Arc<RateLimiter>,
    proxies: Arc<ProxyPool>,
    sessions: Arc<SessionStore>,
    user_agents: Option<UserAgentRotator>,
    proxy_retries: u32,
}

impl Dispatcher {
    /// Creates a dispatcher that sends the tool User-Agent on every request.
    #[must_use]
    pub fn new(
        http: HttpClient,
        rate_limiter: Arc<RateLimiter>,
        proxies: Arc<ProxyPool>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            http,
            rate_limiter,
            proxies,
            sessions,
            user_agents: None,
            proxy_retries: DEFAULT_PROXY_RETRIES,
        }
    }

    /// Rotates browser User-Agents instead of the tool User-Agent.
    #[must_use]
    pub fn with_user_agents(mut self, rotator: UserAgentRotator) -> Self {
        self.user_agents = Some(rotator);
        self
    }

    /// Sets how often a proxied request without a response is retried
    /// through another proxy.
    #[must_use]
    pub fn with_proxy_retries(mut self, retries: u32) -> Self {
        self.proxy_retries = retries;
        self
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    #[must_use]
    pub fn proxies(&self) -> &Arc<ProxyPool> {
        &self.proxies
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Prepares a request: proxy, pacing, User-Agent, browser headers and
    /// session cookies.
    ///
    /// Suspends while the domain's delay runs out.
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub async fn before_request(&self, request: &OutboundRequest) -> DispatchTicket {
        let proxy = if request.use_proxy && !self.proxies.is_empty() {
            self.proxies.get_proxy()
        } else {
            None
        };

        let domain = domain_of(&request.url);
        let waited = self.rate_limiter.wait_if_needed(&domain).await;

        let (user_agent, headers) = match &self.user_agents {
            Some(rotator) => {
                let user_agent = rotator.next_user_agent().to_string();
                let headers = browser_headers(&user_agent, request.accept);
                (user_agent, headers)
            }
            None => (default_user_agent(), HeaderMap::new()),
        };

        let cookies = request
            .platform
            .as_deref()
            .and_then(|platform| self.sessions.get_session(platform, request.account.as_deref()))
            .map(|session| session.cookies)
            .unwrap_or_default();

        debug!(
            %domain,
            proxy = proxy.as_ref().map(|p| p.url.as_str()),
            waited_ms = waited.as_millis(),
            cookie_count = cookies.len(),
            "request prepared"
        );

        DispatchTicket {
            url: request.url.clone(),
            domain,
            proxy,
            user_agent,
            headers,
            cookies,
            platform: request.platform.clone(),
            account: request.account.clone(),
            waited,
            started: Instant::now(),
        }
    }

    /// Records a received response.
    ///
    /// Only HTTP 200 counts as a success for pacing. The proxy is blamed only
    /// for blocking statuses (403, 407, 429) and server errors. Captured
    /// cookie changes are merged into the platform session.
    pub fn after_response(&self, ticket: &DispatchTicket, status: u16, cookies: &CapturedCookies) {
        let elapsed = ticket.elapsed();

        if status == 200 {
            self.rate_limiter.record_success(&ticket.domain, elapsed);
        } else {
            self.rate_limiter.record_failure(&ticket.domain);
        }

        if let Some(proxy) = ticket.proxy_url() {
            if PROXY_BLOCKING_STATUSES.contains(&status) || status >= 500 {
                self.proxies.mark_failure(proxy, &format!("status {status}"));
            } else {
                self.proxies.mark_success(proxy, elapsed);
            }
        }

        if let Some(platform) = ticket.platform.as_deref()
            && !cookies.is_empty()
        {
            debug!(
                platform,
                set = ?cookies.set.keys().collect::<Vec<_>>(),
                removed = ?cookies.removed,
                "capturing session cookies"
            );
            self.sessions
                .merge_cookies(platform, ticket.account.as_deref(), cookies);
        }

        debug!(domain = %ticket.domain, status, elapsed_ms = elapsed.as_millis(), "response recorded");
    }

    /// Records a request that failed without a response.
    pub fn after_error(&self, ticket: &DispatchTicket, error: &DownloadError) {
        self.rate_limiter.record_failure(&ticket.domain);
        if let Some(proxy) = ticket.proxy_url() {
            self.proxies.mark_failure(proxy, &error.to_string());
        }
        warn!(domain = %ticket.domain, url = %ticket.url, error = %error, "request failed");
    }

    /// Sends a GET through the full dispatch cycle.
    ///
    /// Any HTTP status is returned as a response; the caller decides what a
    /// non-success status means. When a request through a proxy gets no
    /// response, the proxy is charged and the request goes out again with the
    /// next proxy (or direct, if none is left), up to the configured retries.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] when the URL is invalid, the proxy is rejected,
    /// or no response arrives.
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub async fn send(&self, request: &OutboundRequest) -> Result<reqwest::Response, DownloadError> {
        let parsed = url::Url::parse(&request.url)
            .map_err(|_| DownloadError::invalid_url(&request.url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::invalid_url(&request.url));
        }

        let mut retries = 0;
        loop {
            let ticket = self.before_request(request).await;
            match self.attempt(&ticket, parsed.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    self.after_error(&ticket, &error);
                    let Some(proxy) = ticket.proxy_url() else {
                        return Err(error);
                    };
                    if retries >= self.proxy_retries {
                        return Err(error);
                    }
                    retries += 1;
                    info!(url = %request.url, failed_proxy = proxy, retry = retries, "retrying through another proxy");
                }
            }
        }
    }

    async fn attempt(
        &self,
        ticket: &DispatchTicket,
        url: url::Url,
    ) -> Result<reqwest::Response, DownloadError> {
        let client = self.http.client_for(ticket.proxy_url())?;

        let mut builder = client
            .get(url)
            .header(USER_AGENT, &ticket.user_agent)
            .headers(ticket.headers.clone());
        if let Some(cookie) = cookie_header(&ticket.cookies) {
            builder = builder.header(COOKIE, cookie);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| DownloadError::network(&ticket.url, e))?;
        let cookies = capture_cookies(response.headers());
        self.after_response(ticket, response.status().as_u16(), &cookies);
        Ok(response)
    }
}
