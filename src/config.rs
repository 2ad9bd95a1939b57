//! TOML configuration for the crawler runtime.
//!
//! Looked up at `--config`, else `$XDG_CONFIG_HOME/harvester/config.toml`,
//! else `$HOME/.config/harvester/config.toml`. A missing default file means
//! all defaults; a missing explicit file is an error.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::{
    DEFAULT_HEALTH_CHECK_URL, DEFAULT_PROXY_RETRIES, ProxyPoolConfig, RateLimiterConfig,
    SelectionStrategy,
};
use crate::download::{CONNECT_TIMEOUT_SECS, HEALTH_CHECK_TIMEOUT_SECS, HttpClient, READ_TIMEOUT_SECS};
use crate::pipeline::{DEFAULT_CONCURRENCY, DEFAULT_STORE_DIR};
use crate::session::{DEFAULT_SESSION_DIR, SessionConfig};

const APP_DIR: &str = "harvester";
const CONFIG_FILE: &str = "config.toml";

/// Longest configurable session lifetime (30 days).
const MAX_SESSION_TIMEOUT_SECS: u64 = 30 * 24 * 3600;

/// Most transport-failure retries allowed through fresh proxies.
const MAX_PROXY_RETRIES: u32 = 10;

/// Default env var holding the session encryption key material.
pub const DEFAULT_MASTER_KEY_ENV: &str = "HARVESTER_SESSION_KEY";

/// Errors while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value is outside its accepted range.
    #[error("invalid config value for `{field}`: {value}. Expected {expected}")]
    Invalid {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, value: impl ToString, expected: &'static str) -> Self {
        Self::Invalid {
            field,
            value: value.to_string(),
            expected,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarvesterConfig {
    pub rate_limit: RateLimitSection,
    pub proxy: ProxySection,
    pub session: SessionSection,
    pub files: FilesSection,
    pub http: HttpSection,
}

/// `[rate_limit]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSection {
    pub min_delay_secs: f64,
    pub max_delay_secs: f64,
    pub randomize: bool,
    pub adaptive: bool,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            min_delay_secs: 1.0,
            max_delay_secs: 5.0,
            randomize: true,
            adaptive: true,
        }
    }
}

/// `[proxy]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxySection {
    /// Inline proxy URLs.
    pub proxies: Vec<String>,
    /// Newline-delimited proxy list file.
    pub file: Option<PathBuf>,
    /// JSON API returning a proxy list.
    pub api: Option<String>,
    pub strategy: SelectionStrategy,
    pub max_fail_count: u32,
    pub ban_duration_secs: u64,
    pub health_check_url: String,
    pub health_check_timeout_secs: u64,
    /// Retries through a fresh proxy after a proxied request gets no response.
    pub retries: u32,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            proxies: Vec::new(),
            file: None,
            api: None,
            strategy: SelectionStrategy::RoundRobin,
            max_fail_count: 5,
            ban_duration_secs: 300,
            health_check_url: DEFAULT_HEALTH_CHECK_URL.to_string(),
            health_check_timeout_secs: HEALTH_CHECK_TIMEOUT_SECS,
            retries: DEFAULT_PROXY_RETRIES,
        }
    }
}

/// `[session]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSection {
    pub dir: PathBuf,
    pub timeout_secs: u64,
    /// Name of the env var holding the encryption key; unset var means plain JSON.
    pub master_key_env: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_SESSION_DIR),
            timeout_secs: 3600,
            master_key_env: DEFAULT_MASTER_KEY_ENV.to_string(),
        }
    }
}

/// `[files]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilesSection {
    pub store_dir: PathBuf,
    pub concurrency: usize,
}

impl Default for FilesSection {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// `[http]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpSection {
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Send rotating browser User-Agents instead of the tool User-Agent.
    pub rotate_user_agents: bool,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            rotate_user_agents: true,
        }
    }
}

impl HarvesterConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Invalid`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rl = &self.rate_limit;
        for (field, value) in [
            ("rate_limit.min_delay_secs", rl.min_delay_secs),
            ("rate_limit.max_delay_secs", rl.max_delay_secs),
        ] {
            if !value.is_finite() || !(0.0..=3600.0).contains(&value) {
                return Err(ConfigError::invalid(field, value, "range: 0..=3600"));
            }
        }
        if rl.min_delay_secs > rl.max_delay_secs {
            return Err(ConfigError::invalid(
                "rate_limit.min_delay_secs",
                rl.min_delay_secs,
                "a value no greater than rate_limit.max_delay_secs",
            ));
        }

        if self.proxy.max_fail_count == 0 {
            return Err(ConfigError::invalid("proxy.max_fail_count", 0, "range: 1.."));
        }
        validate_timeout_secs("proxy.health_check_timeout_secs", self.proxy.health_check_timeout_secs)?;
        if self.proxy.retries > MAX_PROXY_RETRIES {
            return Err(ConfigError::invalid("proxy.retries", self.proxy.retries, "range: 0..=10"));
        }
        if !(1..=MAX_SESSION_TIMEOUT_SECS).contains(&self.session.timeout_secs) {
            return Err(ConfigError::invalid(
                "session.timeout_secs",
                self.session.timeout_secs,
                "range: 1..=2592000 (30 days)",
            ));
        }
        validate_timeout_secs("http.connect_timeout_secs", self.http.connect_timeout_secs)?;
        validate_timeout_secs("http.read_timeout_secs", self.http.read_timeout_secs)?;

        if !(1..=100).contains(&self.files.concurrency) {
            return Err(ConfigError::invalid(
                "files.concurrency",
                self.files.concurrency,
                "range: 1..=100",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            min_delay: Duration::from_secs_f64(self.rate_limit.min_delay_secs),
            max_delay: Duration::from_secs_f64(self.rate_limit.max_delay_secs),
            randomize: self.rate_limit.randomize,
            adaptive: self.rate_limit.adaptive,
        }
    }

    #[must_use]
    pub fn proxy_pool_config(&self) -> ProxyPoolConfig {
        ProxyPoolConfig {
            strategy: self.proxy.strategy,
            max_fail_count: self.proxy.max_fail_count,
            ban_duration: Duration::from_secs(self.proxy.ban_duration_secs),
            health_check_url: self.proxy.health_check_url.clone(),
            health_check_timeout: Duration::from_secs(self.proxy.health_check_timeout_secs),
        }
    }

    /// Session settings, reading the master key from the configured env var.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        let master_key = env_var_non_empty_os(&self.session.master_key_env)
            .map(|key| key.to_string_lossy().trim().to_string());
        SessionConfig {
            dir: self.session.dir.clone(),
            timeout: Duration::from_secs(self.session.timeout_secs),
            master_key,
        }
    }

    #[must_use]
    pub fn http_client(&self) -> HttpClient {
        HttpClient::with_timeouts(
            Duration::from_secs(self.http.connect_timeout_secs),
            Duration::from_secs(self.http.read_timeout_secs),
        )
    }
}

fn validate_timeout_secs(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if !(1..=3600).contains(&value) {
        return Err(ConfigError::invalid(field, value, "range: 1..=3600"));
    }
    Ok(())
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Path that was consulted, if one could be resolved.
    pub path: Option<PathBuf>,
    pub config: HarvesterConfig,
    pub loaded_from_file: bool,
}

/// Loads configuration from `explicit`, or the default location.
///
/// # Errors
///
/// Returns [`ConfigError`] if the explicit file is missing, or any file found
/// cannot be read, parsed, or validated.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    if let Some(path) = explicit {
        let config = load_file_config(path)?;
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config,
            loaded_from_file: true,
        });
    }

    let path = resolve_default_config_path();
    match path.as_deref() {
        Some(path_ref) if path_ref.exists() => {
            let config = load_file_config(path_ref)?;
            Ok(LoadedConfig {
                path,
                config,
                loaded_from_file: true,
            })
        }
        _ => Ok(LoadedConfig {
            path,
            config: HarvesterConfig::default(),
            loaded_from_file: false,
        }),
    }
}

fn load_file_config(path: &Path) -> Result<HarvesterConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    HarvesterConfig::from_toml_str(&raw, path)
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/harvester/config.toml`
/// 2. `$HOME/.config/harvester/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    resolve_config_path_from(
        env_var_non_empty_os("XDG_CONFIG_HOME"),
        env_var_non_empty_os("HOME"),
    )
}

fn resolve_config_path_from(xdg_config_home: Option<OsString>, home: Option<OsString>) -> Option<PathBuf> {
    if let Some(xdg) = xdg_config_home {
        return Some(PathBuf::from(xdg).join(APP_DIR).join(CONFIG_FILE));
    }
    let home = home?;
    Some(PathBuf::from(home).join(".config").join(APP_DIR).join(CONFIG_FILE))
}

fn env_var_non_empty_os(name: &str) -> Option<OsString> {
    if name.is_empty() || name.contains(['=', '\0']) {
        return None;
    }
    let value = env::var_os(name)?;
    if value.to_string_lossy().trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<HarvesterConfig, ConfigError> {
        HarvesterConfig::from_toml_str(raw, Path::new("test.toml"))
    }

    #[test]
    fn test_empty_document_is_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config, HarvesterConfig::default());
        assert!((config.rate_limit.min_delay_secs - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.proxy.max_fail_count, 5);
        assert_eq!(config.proxy.ban_duration_secs, 300);
        assert_eq!(config.proxy.health_check_url, "http://httpbin.org/ip");
        assert_eq!(config.session.timeout_secs, 3600);
        assert_eq!(config.session.dir, PathBuf::from("./data/sessions"));
        assert_eq!(config.files.concurrency, 8);
        assert!(config.http.rotate_user_agents);
    }

    #[test]
    fn test_partial_sections() {
        let config = parse(
            r#"
            [rate_limit]
            min_delay_secs = 0.5
            randomize = false

            [proxy]
            proxies = ["http://a:1", "socks5://b:2"]
            strategy = "best_performance"

            [files]
            store_dir = "/srv/harvest"
            "#,
        )
        .unwrap();

        assert!((config.rate_limit.min_delay_secs - 0.5).abs() < f64::EPSILON);
        assert!(!config.rate_limit.randomize);
        assert!(config.rate_limit.adaptive);
        assert_eq!(config.proxy.proxies.len(), 2);
        assert_eq!(config.proxy.strategy, SelectionStrategy::BestPerformance);
        assert_eq!(config.files.store_dir, PathBuf::from("/srv/harvest"));

        let limiter = config.rate_limiter_config();
        assert_eq!(limiter.min_delay, Duration::from_millis(500));
        assert_eq!(limiter.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = parse("[proxy]\nrotation = \"random\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "{err}");
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        assert!(matches!(
            parse("[proxy]\nstrategy = \"fastest\"\n"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_inverted_delays_rejected() {
        let err = parse("[rate_limit]\nmin_delay_secs = 6.0\n").unwrap_err();
        assert!(err.to_string().contains("rate_limit.min_delay_secs"), "{err}");
    }

    #[test]
    fn test_zero_fail_count_rejected() {
        let err = parse("[proxy]\nmax_fail_count = 0\n").unwrap_err();
        assert!(err.to_string().contains("proxy.max_fail_count"), "{err}");
    }

    #[test]
    fn test_concurrency_range() {
        assert!(parse("[files]\nconcurrency = 0\n").is_err());
        assert!(parse("[files]\nconcurrency = 101\n").is_err());
        assert!(parse("[files]\nconcurrency = 100\n").is_ok());
    }

    #[test]
    fn test_timeout_range() {
        let err = parse("[http]\nread_timeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("http.read_timeout_secs"), "{err}");
    }

    #[test]
    fn test_session_timeout_allows_long_sessions() {
        let config = parse("[session]\ntimeout_secs = 86400\n").unwrap();
        assert_eq!(config.session_config().timeout, Duration::from_secs(86_400));
        assert!(parse("[session]\ntimeout_secs = 2592000\n").is_ok());

        let err = parse("[session]\ntimeout_secs = 2592001\n").unwrap_err();
        assert!(err.to_string().contains("session.timeout_secs"), "{err}");
        assert!(parse("[session]\ntimeout_secs = 0\n").is_err());
    }

    #[test]
    fn test_proxy_retries_range() {
        assert_eq!(parse("").unwrap().proxy.retries, 2);
        assert_eq!(parse("[proxy]\nretries = 0\n").unwrap().proxy.retries, 0);
        let err = parse("[proxy]\nretries = 11\n").unwrap_err();
        assert!(err.to_string().contains("proxy.retries"), "{err}");
    }

    #[test]
    fn test_negative_delay_rejected() {
        assert!(parse("[rate_limit]\nmin_delay_secs = -1.0\n").is_err());
    }

    #[test]
    fn test_resolve_prefers_xdg() {
        let path = resolve_config_path_from(Some("/xdg".into()), Some("/home/u".into())).unwrap();
        assert_eq!(path, PathBuf::from("/xdg/harvester/config.toml"));
    }

    #[test]
    fn test_resolve_falls_back_to_home() {
        let path = resolve_config_path_from(None, Some("/home/u".into())).unwrap();
        assert_eq!(path, PathBuf::from("/home/u/.config/harvester/config.toml"));
        assert!(resolve_config_path_from(None, None).is_none());
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(Some(&dir.path().join("nope.toml")));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_explicit_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[session]\ntimeout_secs = 60\n").unwrap();

        let loaded = load_config(Some(&path)).unwrap();
        assert!(loaded.loaded_from_file);
        assert_eq!(loaded.config.session_config().timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_session_config_with_unset_key_env_is_plain() {
        let mut config = HarvesterConfig::default();
        config.session.master_key_env = "HARVESTER_TEST_KEY_THAT_IS_NEVER_SET".to_string();
        assert!(config.session_config().master_key.is_none());
    }
}
