//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Request orchestration and file harvesting for biomedical data crawls.
///
/// Harvester paces requests per domain, rotates proxies, keeps platform
/// sessions, and downloads the files referenced by scraped records into a
/// fixed, track-id keyed directory layout.
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/harvester/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download the files referenced by JSON-lines records
    Download(DownloadArgs),

    /// Inspect the configured proxy pool
    #[command(subcommand)]
    Proxy(ProxyCommand),

    /// Inspect or clear stored platform sessions
    #[command(subcommand)]
    Session(SessionCommand),
}

#[derive(ClapArgs, Debug)]
pub struct DownloadArgs {
    /// JSON-lines file of scraped records
    #[arg(short, long, value_name = "FILE")]
    pub input: PathBuf,

    /// Where to write the enriched records (default: stdout)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Override the download root from the config file
    #[arg(long, value_name = "DIR")]
    pub store_dir: Option<PathBuf>,

    /// Override download concurrency (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,
}

#[derive(Subcommand, Debug)]
pub enum ProxyCommand {
    /// Probe every proxy and print the health report
    Check,
    /// Print pool counters without probing
    Stats,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    /// Print the stored session for a platform (cookie values are masked)
    Show(SessionTarget),
    /// Delete the stored session for a platform
    Clear(SessionTarget),
}

#[derive(ClapArgs, Debug)]
pub struct SessionTarget {
    /// Platform name, e.g. biolincc
    pub platform: String,

    /// Account id for multi-account platforms
    #[arg(long)]
    pub account: Option<String>,
}
