//! Platform login sessions: cookie capture, in-memory cache and durable storage.

mod cookies;
mod storage;
mod store;

pub use cookies::{CapturedCookies, capture_cookies, cookie_header, parse_set_cookie};
pub use storage::{SessionStorage, SessionStorageError};
pub use store::{
    DEFAULT_SESSION_DIR, DEFAULT_SESSION_TIMEOUT, SessionConfig, SessionRecord, SessionStore,
    session_key,
};
