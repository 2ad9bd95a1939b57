//! Session command handlers: show and clear stored platform sessions.

use std::path::Path;

use anyhow::Result;
use harvester_core::config::load_config;
use harvester_core::session::{SessionStore, session_key};
use tracing::info;

use crate::cli::SessionTarget;

/// Shows at most this many leading characters of a cookie value.
const VISIBLE_COOKIE_CHARS: usize = 4;

pub fn run_session_show_command(target: &SessionTarget, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?.config;
    let store = SessionStore::new(config.session_config());
    let account = target.account.as_deref();
    let key = session_key(&target.platform, account);

    let Some(session) = store.get_session(&target.platform, account) else {
        info!(session = %key, "No valid session stored");
        println!("session = {key}");
        println!("status = none");
        return Ok(());
    };

    println!("session = {key}");
    println!("status = valid");
    println!("path = {}", store.storage().path_for(&key).display());
    println!("created_at = {}", session.created_at.to_rfc3339());
    println!("last_used = {}", session.last_used.to_rfc3339());
    println!("cookies = {}", session.cookies.len());
    for (name, value) in &session.cookies {
        println!("  {name} = {}", mask_cookie_value(value));
    }
    if !session.metadata.is_empty() {
        println!("metadata = {}", serde_json::Value::Object(session.metadata));
    }

    Ok(())
}

pub fn run_session_clear_command(target: &SessionTarget, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?.config;
    let store = SessionStore::new(config.session_config());
    let key = session_key(&target.platform, target.account.as_deref());

    let existed = store.storage().path_for(&key).exists();
    store.clear_session(&target.platform, target.account.as_deref());

    if existed {
        println!("Cleared session {key}");
    } else {
        println!("No stored session {key}");
    }
    Ok(())
}

fn mask_cookie_value(value: &str) -> String {
    let visible: String = value.chars().take(VISIBLE_COOKIE_CHARS).collect();
    if visible.len() == value.len() {
        "*".repeat(value.chars().count().max(1))
    } else {
        format!("{visible}***")
    }
}
