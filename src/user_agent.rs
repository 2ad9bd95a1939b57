//! User-Agent strings for outbound crawler traffic.
//!
//! The default UA identifies the tool. Sites that fingerprint crawlers get a
//! rotating set of real browser strings instead, via [`UserAgentRotator`], and
//! [`browser_headers`] adds the headers a browser with that UA would send.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::seq::SliceRandom;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, DNT, HeaderMap, HeaderName, HeaderValue, UPGRADE_INSECURE_REQUESTS,
};
use serde::{Deserialize, Serialize};

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/fierce/harvester";

/// Real browser User-Agents used for rotation.
pub const BROWSER_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// Default User-Agent for crawler requests (identifies the tool).
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("harvester/{version} (biomedical-research-crawler; +{PROJECT_UA_URL})")
}

/// How the rotator picks the next User-Agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    /// Uniformly random pick per request.
    #[default]
    Random,
    /// Cycles through the list in order.
    RoundRobin,
}

/// Rotates over a fixed list of User-Agent strings.
#[derive(Debug)]
pub struct UserAgentRotator {
    user_agents: Vec<String>,
    strategy: RotationStrategy,
    cursor: AtomicUsize,
}

impl Default for UserAgentRotator {
    fn default() -> Self {
        Self::new(RotationStrategy::Random)
    }
}

impl UserAgentRotator {
    /// Creates a rotator over [`BROWSER_USER_AGENTS`].
    #[must_use]
    pub fn new(strategy: RotationStrategy) -> Self {
        Self::with_agents(
            BROWSER_USER_AGENTS.iter().map(|ua| (*ua).to_string()).collect(),
            strategy,
        )
    }

    /// Creates a rotator over a custom list. An empty list falls back to the tool UA.
    #[must_use]
    pub fn with_agents(user_agents: Vec<String>, strategy: RotationStrategy) -> Self {
        let user_agents = if user_agents.is_empty() {
            vec![default_user_agent()]
        } else {
            user_agents
        };
        Self {
            user_agents,
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Returns the next User-Agent according to the strategy.
    #[must_use]
    pub fn next_user_agent(&self) -> &str {
        match self.strategy {
            RotationStrategy::Random => self
                .user_agents
                .choose(&mut rand::thread_rng())
                .map_or("", String::as_str),
            RotationStrategy::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.user_agents.len();
                &self.user_agents[index]
            }
        }
    }
}

/// Accept-Language values picked per request.
const ACCEPT_LANGUAGES: &[&str] = &["en-US,en;q=0.9", "en-GB,en;q=0.9", "zh-CN,zh;q=0.9,en;q=0.8"];

/// What a request asks for. Decides `Accept` and the `Sec-Fetch-*` headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AcceptKind {
    /// A page or file opened by navigation.
    #[default]
    Document,
    Json,
    Image,
}

impl AcceptKind {
    fn accept(self) -> &'static str {
        match self {
            Self::Document => {
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8"
            }
            Self::Json => "application/json, text/plain, */*",
            Self::Image => "image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8",
        }
    }

    /// `(Sec-Fetch-Mode, Sec-Fetch-Dest)`.
    fn fetch_mode_and_dest(self) -> (&'static str, &'static str) {
        match self {
            Self::Document => ("navigate", "document"),
            Self::Json => ("cors", "empty"),
            Self::Image => ("no-cors", "image"),
        }
    }
}

/// Headers a real browser sends alongside `user_agent`.
///
/// Chromium-based agents also get client hints (`sec-ch-ua*`) carrying the
/// same major version and platform as the UA string.
#[must_use]
pub fn browser_headers(user_agent: &str, accept: AcceptKind) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(accept.accept()));
    let language = ACCEPT_LANGUAGES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("en-US,en;q=0.9");
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(language));
    headers.insert(DNT, HeaderValue::from_static("1"));

    let (mode, dest) = accept.fetch_mode_and_dest();
    headers.insert(HeaderName::from_static("sec-fetch-site"), HeaderValue::from_static("none"));
    headers.insert(HeaderName::from_static("sec-fetch-mode"), HeaderValue::from_static(mode));
    headers.insert(HeaderName::from_static("sec-fetch-dest"), HeaderValue::from_static(dest));
    if accept == AcceptKind::Document {
        headers.insert(HeaderName::from_static("sec-fetch-user"), HeaderValue::from_static("?1"));
        headers.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
    }

    if let Some(version) = chromium_major_version(user_agent) {
        let brand = if user_agent.contains("Edg/") {
            "Microsoft Edge"
        } else {
            "Google Chrome"
        };
        let hint = format!(
            "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"{version}\", \"{brand}\";v=\"{version}\""
        );
        if let Ok(value) = HeaderValue::from_str(&hint) {
            headers.insert(HeaderName::from_static("sec-ch-ua"), value);
        }
        headers.insert(HeaderName::from_static("sec-ch-ua-mobile"), HeaderValue::from_static("?0"));
        headers.insert(
            HeaderName::from_static("sec-ch-ua-platform"),
            HeaderValue::from_static(platform_hint(user_agent)),
        );
    }

    headers
}

/// Major version from a `Chrome/NNN.x` token.
fn chromium_major_version(user_agent: &str) -> Option<&str> {
    let rest = &user_agent[user_agent.find("Chrome/")? + "Chrome/".len()..];
    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

fn platform_hint(user_agent: &str) -> &'static str {
    if user_agent.contains("Windows") {
        "\"Windows\""
    } else if user_agent.contains("Macintosh") {
        "\"macOS\""
    } else if user_agent.contains("Linux") {
        "\"Linux\""
    } else {
        "\"Unknown\""
    }
}
