//! CLI entry point for the harvester tool.

use anyhow::Result;
use clap::Parser;
use tracing::debug;

mod cli;
mod commands;

use cli::{Args, Command, ProxyCommand, SessionCommand};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // Logs go to stderr; stdout carries command output and enriched records.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config_path = args.config.as_deref();
    match &args.command {
        Command::Download(download) => {
            commands::run_download_command(download, config_path).await
        }
        Command::Proxy(ProxyCommand::Check) => commands::run_proxy_check_command(config_path).await,
        Command::Proxy(ProxyCommand::Stats) => commands::run_proxy_stats_command(config_path).await,
        Command::Session(SessionCommand::Show(target)) => {
            commands::run_session_show_command(target, config_path)
        }
        Command::Session(SessionCommand::Clear(target)) => {
            commands::run_session_clear_command(target, config_path)
        }
    }
}
