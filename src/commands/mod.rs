//! CLI command handlers.

mod download;
mod proxy;
mod session;

pub use download::run_download_command;
pub use proxy::{run_proxy_check_command, run_proxy_stats_command};
pub use session::{run_session_clear_command, run_session_show_command};

use harvester_core::config::HarvesterConfig;
use harvester_core::dispatch::{ProxyPool, proxy_source};
use harvester_core::download::HttpClient;
use tracing::{info, warn};

/// Builds the proxy pool from inline entries, the list file, and the list API.
///
/// A source that cannot be read is logged and skipped; the run continues with
/// whatever proxies the other sources produced.
pub(crate) async fn build_proxy_pool(config: &HarvesterConfig, http: &HttpClient) -> ProxyPool {
    let pool = ProxyPool::with_proxies(config.proxy_pool_config(), &config.proxy.proxies);

    if let Some(path) = &config.proxy.file {
        match proxy_source::load_from_file(path) {
            Ok(urls) => {
                let added = pool.extend_from(urls);
                info!(path = %path.display(), added, "loaded proxies from file");
            }
            Err(error) => warn!(%error, "skipping proxy file"),
        }
    }

    if let Some(api) = &config.proxy.api {
        match proxy_source::load_from_api(http, api).await {
            Ok(urls) => {
                let added = pool.extend_from(urls);
                info!(api = %api, added, "loaded proxies from api");
            }
            Err(error) => warn!(%error, "skipping proxy api"),
        }
    }

    pool
}
