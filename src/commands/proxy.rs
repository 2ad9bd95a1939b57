//! Proxy command handlers: health sweep and pool counters.

use std::path::Path;

use anyhow::Result;
use harvester_core::config::load_config;
use tracing::info;

use super::build_proxy_pool;

pub async fn run_proxy_check_command(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?.config;
    let http = config.http_client();
    let pool = build_proxy_pool(&config, &http).await;

    if pool.is_empty() {
        info!("No proxies configured");
    } else {
        info!(proxies = pool.len(), url = %pool.config().health_check_url, "probing proxies");
    }

    let report = pool.health_check(&http).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    for record in pool.records() {
        let status = if record.is_banned { "banned" } else { "ok" };
        info!(
            proxy = %record.url,
            protocol = %record.protocol,
            status,
            successes = record.success_count,
            failures = record.fail_count,
            "proxy"
        );
    }

    Ok(())
}

pub async fn run_proxy_stats_command(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?.config;
    let http = config.http_client();
    let pool = build_proxy_pool(&config, &http).await;

    println!("{}", serde_json::to_string_pretty(&pool.stats())?);
    Ok(())
}
