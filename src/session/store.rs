//! Per-platform session cache backed by durable storage.
//!
//! Lookups hit the in-memory cache first, then the session file. A session is
//! valid while less than `timeout` has passed since its `last_used` stamp;
//! reads never refresh that stamp, only saves do.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::cookies::CapturedCookies;
use super::storage::SessionStorage;

/// Default directory for session files.
pub const DEFAULT_SESSION_DIR: &str = "./data/sessions";

/// Default session lifetime (one hour).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(3600);

/// An authenticated browsing session for one platform account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub platform: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Session store settings.
#[derive(Clone)]
pub struct SessionConfig {
    pub dir: PathBuf,
    pub timeout: Duration,
    /// Key material for at-rest encryption; `None` stores plain JSON.
    pub master_key: Option<String>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("dir", &self.dir)
            .field("timeout", &self.timeout)
            .field("master_key", &self.master_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_SESSION_DIR),
            timeout: DEFAULT_SESSION_TIMEOUT,
            master_key: None,
        }
    }
}

/// Builds the cache and file key for a session: `platform` or `platform_account`.
#[must_use]
pub fn session_key(platform: &str, account_id: Option<&str>) -> String {
    match account_id {
        Some(account) if !account.is_empty() => format!("{platform}_{account}"),
        _ => platform.to_string(),
    }
}

/// Thread-safe session store. Share via `Arc`.
#[derive(Debug)]
pub struct SessionStore {
    timeout: TimeDelta,
    storage: SessionStorage,
    cache: DashMap<String, SessionRecord>,
}

impl SessionStore {
    /// Creates a store. The session directory is created on first save.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let timeout = TimeDelta::from_std(config.timeout).unwrap_or(TimeDelta::MAX);
        let storage = SessionStorage::new(config.dir, config.master_key);
        debug!(
            dir = %storage.dir().display(),
            encrypted = storage.is_encrypted(),
            "creating session store"
        );
        Self {
            timeout,
            storage,
            cache: DashMap::new(),
        }
    }

    /// The durable storage behind this store.
    #[must_use]
    pub fn storage(&self) -> &SessionStorage {
        &self.storage
    }

    /// Returns a valid session for the platform account, if any.
    ///
    /// An expired cache entry is evicted. A session loaded from disk is
    /// re-validated and promoted into the cache. Storage errors are logged and
    /// treated as "no session".
    #[instrument(skip(self))]
    pub fn get_session(&self, platform: &str, account_id: Option<&str>) -> Option<SessionRecord> {
        self.lookup(&session_key(platform, account_id), Utc::now())
    }

    fn lookup(&self, key: &str, now: DateTime<Utc>) -> Option<SessionRecord> {
        if let Some(cached) = self.cache.get(key).map(|entry| entry.clone()) {
            if self.is_valid(&cached, now) {
                debug!(session = key, "using cached session");
                return Some(cached);
            }
            info!(session = key, "session expired");
            self.cache.remove(key);
        }

        if let Some(record) = self.load_valid(key, now) {
            self.cache.insert(key.to_string(), record.clone());
            return Some(record);
        }

        debug!(session = key, "no valid session");
        None
    }

    /// Reads a still-valid session from disk without touching the cache.
    fn load_valid(&self, key: &str, now: DateTime<Utc>) -> Option<SessionRecord> {
        let stored = match self.storage.load(key) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(session = key, error = %e, "failed to load session file");
                None
            }
        };
        let record = stored.filter(|record| self.is_valid(record, now))?;
        info!(session = key, "loaded session from file");
        Some(record)
    }

    /// Saves cookies as the session for the platform account.
    ///
    /// Stamps `created_at` and `last_used` with the current time and replaces
    /// any previous session. A failed file write is logged; the in-memory
    /// session is still updated.
    #[instrument(skip(self, cookies, metadata), fields(cookie_count = cookies.len()))]
    pub fn save_session(
        &self,
        platform: &str,
        cookies: BTreeMap<String, String>,
        account_id: Option<&str>,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> SessionRecord {
        let key = session_key(platform, account_id);
        let now = Utc::now();
        let record = SessionRecord {
            platform: platform.to_string(),
            account_id: account_id.map(str::to_string),
            cookies,
            created_at: now,
            last_used: now,
            metadata: metadata.unwrap_or_default(),
        };

        self.cache.insert(key.clone(), record.clone());
        if let Err(e) = self.storage.save(&key, &record) {
            warn!(session = %key, error = %e, "failed to write session file");
        }

        info!(session = %key, "session saved");
        record
    }

    /// Applies captured cookie changes to the platform session.
    ///
    /// The read, update and file write happen under the session's cache entry
    /// lock, so concurrent merges for one key never lose cookies. A valid
    /// session keeps its `created_at` and metadata and gets a fresh
    /// `last_used`. Without a valid session a new one is started, unless the
    /// changes only remove cookies. Returns the session as saved.
    #[instrument(skip(self, captured), fields(set = captured.set.len(), removed = captured.removed.len()))]
    pub fn merge_cookies(
        &self,
        platform: &str,
        account_id: Option<&str>,
        captured: &CapturedCookies,
    ) -> Option<SessionRecord> {
        let key = session_key(platform, account_id);
        let now = Utc::now();

        let mut record = match self.cache.entry(key.clone()) {
            Entry::Occupied(entry) if self.is_valid(entry.get(), now) => entry.into_ref(),
            entry => {
                let base = self.load_valid(&key, now).or_else(|| {
                    (!captured.set.is_empty()).then(|| SessionRecord {
                        platform: platform.to_string(),
                        account_id: account_id.map(str::to_string),
                        cookies: BTreeMap::new(),
                        created_at: now,
                        last_used: now,
                        metadata: serde_json::Map::new(),
                    })
                })?;
                entry.insert(base)
            }
        };

        for name in &captured.removed {
            record.cookies.remove(name);
        }
        record
            .cookies
            .extend(captured.set.iter().map(|(k, v)| (k.clone(), v.clone())));
        record.last_used = now;

        let saved = record.clone();
        if let Err(e) = self.storage.save(&key, &saved) {
            warn!(session = %key, error = %e, "failed to write session file");
        }
        drop(record);

        debug!(session = %key, cookie_count = saved.cookies.len(), "session cookies merged");
        Some(saved)
    }

    /// Removes the session from memory and disk.
    #[instrument(skip(self))]
    pub fn clear_session(&self, platform: &str, account_id: Option<&str>) {
        let key = session_key(platform, account_id);
        self.cache.remove(&key);
        if let Err(e) = self.storage.remove(&key) {
            warn!(session = %key, error = %e, "failed to remove session file");
        }
        info!(session = %key, "session cleared");
    }

    fn is_valid(&self, record: &SessionRecord, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(record.last_used) < self.timeout
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn store(dir: &TempDir) -> SessionStore {
        SessionStore::new(SessionConfig {
            dir: dir.path().to_path_buf(),
            timeout: Duration::from_secs(3600),
            master_key: None,
        })
    }

    fn cookies(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_session_key() {
        assert_eq!(session_key("biolincc", None), "biolincc");
        assert_eq!(session_key("biolincc", Some("alice")), "biolincc_alice");
        assert_eq!(session_key("biolincc", Some("")), "biolincc");
    }

    #[test]
    fn test_save_then_get_returns_cookies() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save_session("biolincc", cookies(&[("sid", "1")]), None, None);

        let session = store.get_session("biolincc", None).unwrap();
        assert_eq!(session.cookies, cookies(&[("sid", "1")]));
        assert_eq!(session.created_at, session.last_used);
    }

    #[test]
    fn test_accounts_are_separate() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save_session("biolincc", cookies(&[("sid", "a")]), Some("alice"), None);

        assert!(store.get_session("biolincc", None).is_none());
        assert!(store.get_session("biolincc", Some("bob")).is_none());
        assert_eq!(
            store.get_session("biolincc", Some("alice")).unwrap().cookies["sid"],
            "a"
        );
    }

    #[test]
    fn test_reads_do_not_refresh_last_used() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let saved = store.save_session("biolincc", cookies(&[("sid", "1")]), None, None);

        let later = saved.last_used + TimeDelta::minutes(30);
        let read = store.lookup("biolincc", later).unwrap();
        assert_eq!(read.last_used, saved.last_used);
    }

    #[test]
    fn test_expired_cache_entry_is_evicted() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let saved = store.save_session("biolincc", cookies(&[("sid", "1")]), None, None);

        let expired_at = saved.last_used + TimeDelta::seconds(3600);
        assert!(store.lookup("biolincc", expired_at).is_none());
        assert!(!store.cache.contains_key("biolincc"));
    }

    #[test]
    fn test_promotes_file_session_into_cache() {
        let dir = TempDir::new().unwrap();
        store(&dir).save_session("biolincc", cookies(&[("sid", "1")]), None, None);

        let fresh = store(&dir);
        assert!(fresh.cache.is_empty());
        assert!(fresh.get_session("biolincc", None).is_some());
        assert!(fresh.cache.contains_key("biolincc"));
    }

    #[test]
    fn test_expired_file_session_is_not_promoted() {
        let dir = TempDir::new().unwrap();
        let old = Utc::now() - TimeDelta::hours(2);
        let record = SessionRecord {
            platform: "biolincc".to_string(),
            account_id: None,
            cookies: cookies(&[("sid", "stale")]),
            created_at: old,
            last_used: old,
            metadata: serde_json::Map::new(),
        };
        let store = store(&dir);
        store.storage().save("biolincc", &record).unwrap();

        assert!(store.get_session("biolincc", None).is_none());
        assert!(store.cache.is_empty());
    }

    #[test]
    fn test_clear_removes_memory_and_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save_session("biolincc", cookies(&[("sid", "1")]), Some("alice"), None);
        let path = store.storage().path_for("biolincc_alice");
        assert!(path.exists());

        store.clear_session("biolincc", Some("alice"));
        assert!(!path.exists());
        assert!(store.get_session("biolincc", Some("alice")).is_none());
    }

    #[test]
    fn test_save_overwrites_and_keeps_metadata() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save_session("biolincc", cookies(&[("sid", "1")]), None, None);
        let mut metadata = serde_json::Map::new();
        metadata.insert("login".to_string(), serde_json::json!("sso"));
        store.save_session("biolincc", cookies(&[("sid", "2")]), None, Some(metadata));

        let fresh = self::store(&dir);
        let session = fresh.get_session("biolincc", None).unwrap();
        assert_eq!(session.cookies["sid"], "2");
        assert_eq!(session.metadata["login"], "sso");
    }

    fn captured(set: &[(&str, &str)], removed: &[&str]) -> CapturedCookies {
        CapturedCookies {
            set: cookies(set),
            removed: removed.iter().map(|name| (*name).to_string()).collect(),
        }
    }

    #[test]
    fn test_merge_cookies_updates_and_removes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut metadata = serde_json::Map::new();
        metadata.insert("login".to_string(), serde_json::json!("sso"));
        let saved = store.save_session(
            "biolincc",
            cookies(&[("sid", "1"), ("pref", "x")]),
            None,
            Some(metadata),
        );

        let merged = store
            .merge_cookies("biolincc", None, &captured(&[("csrf", "t")], &["sid"]))
            .unwrap();
        assert_eq!(merged.cookies, cookies(&[("csrf", "t"), ("pref", "x")]));
        assert_eq!(merged.created_at, saved.created_at);
        assert_eq!(merged.metadata["login"], "sso");

        let fresh = self::store(&dir);
        assert_eq!(fresh.get_session("biolincc", None).unwrap(), merged);
    }

    #[test]
    fn test_merge_cookies_starts_new_session() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let merged = store
            .merge_cookies("biolincc", Some("alice"), &captured(&[("sid", "1")], &[]))
            .unwrap();
        assert_eq!(merged.account_id.as_deref(), Some("alice"));
        assert!(store.storage().path_for("biolincc_alice").exists());
    }

    #[test]
    fn test_merge_only_removals_without_session_saves_nothing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.merge_cookies("biolincc", None, &captured(&[], &["sid"])).is_none());
        assert!(!store.storage().path_for("biolincc").exists());
        assert!(store.cache.is_empty());
    }

    #[test]
    fn test_concurrent_merges_lose_no_cookies() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::thread::scope(|scope| {
            for worker in 0..8 {
                let store = &store;
                scope.spawn(move || {
                    for i in 0..50 {
                        let name = format!("w{worker}_{i}");
                        store.merge_cookies("p", None, &captured(&[(name.as_str(), "v")], &[]));
                    }
                });
            }
        });

        assert_eq!(store.get_session("p", None).unwrap().cookies.len(), 400);
        let on_disk = store.storage().load("p").unwrap().unwrap();
        assert_eq!(on_disk.cookies.len(), 400);
    }

    #[test]
    fn test_unreadable_file_degrades_to_none() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::write(store.storage().path_for("biolincc"), b"garbage").unwrap();
        assert!(store.get_session("biolincc", None).is_none());
    }

    #[test]
    fn test_config_debug_redacts_key() {
        let config = SessionConfig {
            master_key: Some("hunter2".to_string()),
            ..SessionConfig::default()
        };
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
