//! Download command handler: enrich JSON-lines records with their files.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use harvester_core::config::load_config;
use harvester_core::dispatch::{Dispatcher, RateLimiter};
use harvester_core::pipeline::{FilePipeline, PipelineError, ScrapedRecord};
use harvester_core::session::SessionStore;
use harvester_core::user_agent::{RotationStrategy, UserAgentRotator};
use tracing::{debug, info, warn};

use super::build_proxy_pool;
use crate::cli::DownloadArgs;

#[derive(Debug, Default)]
struct RunTotals {
    records: usize,
    skipped: usize,
    duplicates: usize,
    files_ok: usize,
    files_failed: usize,
}

pub async fn run_download_command(
    args: &DownloadArgs,
    config_path: Option<&std::path::Path>,
) -> Result<()> {
    let loaded = load_config(config_path)?;
    let mut config = loaded.config;
    if loaded.loaded_from_file {
        debug!(path = ?loaded.path, "loaded config file");
    }
    if let Some(store_dir) = &args.store_dir {
        config.files.store_dir.clone_from(store_dir);
    }
    if let Some(concurrency) = args.concurrency {
        config.files.concurrency = usize::from(concurrency);
    }

    let http = config.http_client();
    let proxies = build_proxy_pool(&config, &http).await;
    let rate_limiter = RateLimiter::new(config.rate_limiter_config());
    let sessions = SessionStore::new(config.session_config());

    let mut dispatcher = Dispatcher::new(
        http,
        Arc::new(rate_limiter),
        Arc::new(proxies),
        Arc::new(sessions),
    )
    .with_proxy_retries(config.proxy.retries);
    if config.http.rotate_user_agents {
        dispatcher = dispatcher.with_user_agents(UserAgentRotator::new(RotationStrategy::Random));
    }

    let pipeline = FilePipeline::new(
        Arc::new(dispatcher),
        config.files.store_dir.clone(),
        config.files.concurrency,
    )?;

    let input = File::open(&args.input)
        .with_context(|| format!("cannot open input {}", args.input.display()))?;
    let mut output: Box<dyn Write> = match &args.output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("cannot create output {}", path.display()))?;
            Box::new(BufWriter::new(file))
        }
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    info!(
        input = %args.input.display(),
        store_dir = %pipeline.store_root().display(),
        concurrency = config.files.concurrency,
        "harvesting record files"
    );

    let mut totals = RunTotals::default();
    let mut seen_track_ids = HashSet::new();
    for (line_no, line) in BufReader::new(input).lines().enumerate() {
        let line = line.with_context(|| format!("cannot read {}", args.input.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut record: ScrapedRecord = match serde_json::from_str(trimmed) {
            Ok(record) => record,
            Err(error) => {
                warn!(line = line_no + 1, %error, "passing through unparseable record");
                totals.skipped += 1;
                writeln!(output, "{trimmed}")?;
                continue;
            }
        };

        if let Some(track_id) = record.track_id()
            && !seen_track_ids.insert(track_id.to_string())
        {
            warn!(line = line_no + 1, track_id, "dropping duplicate record");
            totals.duplicates += 1;
            continue;
        }

        totals.records += 1;
        match pipeline.process_record(&mut record).await {
            Ok(summary) => {
                totals.files_ok += summary.successful;
                totals.files_failed += summary.failed;
            }
            Err(PipelineError::MissingTrackId) => {
                warn!(line = line_no + 1, "record has no track_id; files not downloaded");
                totals.skipped += 1;
            }
            Err(error) => {
                warn!(line = line_no + 1, %error, "record file processing failed");
                totals.skipped += 1;
            }
        }

        serde_json::to_writer(&mut output, &record)?;
        writeln!(output)?;
    }
    output.flush()?;

    info!(
        records = totals.records,
        skipped = totals.skipped,
        duplicates = totals.duplicates,
        files_ok = totals.files_ok,
        files_failed = totals.files_failed,
        "harvest complete"
    );

    Ok(())
}
