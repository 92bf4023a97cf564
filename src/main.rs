mod cli;
mod client;
mod consistent;
mod consumer;
mod download;
mod error;
mod extract;
mod getter;
mod multifile;
mod srv;
mod util;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info};
use reqwest::Url;
use tokio::sync::Semaphore;

use cli::{Cli, Command, LogLevel};
use client::HttpClient;
use consumer::Consumer;
use download::{BufferMode, ConsistentHashingMode, Strategy};
use getter::Getter;
use multifile::ManifestEntry;
use util::format_bytes;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.common.log_level);
    debug!("CLI arguments: {cli:?}");

    if matches!(cli.command, Some(Command::Version)) {
        println!("rget {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let common = &cli.common;
    let cache_hosts = match &common.cache_srv {
        Some(name) => {
            let hosts = srv::lookup_cache_hosts(name).await?;
            info!("discovered {} cache ring slots via SRV", hosts.len());
            hosts
        }
        None => common.cache_host_list(),
    };

    let client = Arc::new(HttpClient::new(&common.client_options()?)?);
    let semaphore = Arc::new(Semaphore::new(common.concurrency.max(1)));
    let options = common.download_options(cache_hosts, semaphore)?;

    let consumer = if common.extract {
        Consumer::Tar {
            overwrite: common.force,
        }
    } else {
        Consumer::File {
            overwrite: common.force,
        }
    };

    let plan = match &cli.command {
        Some(Command::Multifile { manifest }) => {
            Plan::Manifest(multifile::read_manifest(manifest, common.force)?)
        }
        Some(Command::Version) => unreachable!("handled above"),
        None => {
            let url = cli
                .url
                .as_deref()
                .ok_or_else(|| anyhow!("a URL and a destination are required"))?;
            let dest = cli
                .dest
                .clone()
                .ok_or_else(|| anyhow!("a destination path is required"))?;
            let url = Url::parse(url).with_context(|| format!("invalid url {url}"))?;
            util::ensure_destination_not_exist(&dest, common.force)?;
            Plan::Single(url, dest)
        }
    };

    let buffer = BufferMode::new(client.clone(), options.clone());
    if options.cache_hosts.is_empty() {
        execute(
            Getter::new(buffer, consumer),
            plan,
            common.max_concurrent_files,
        )
        .await
    } else {
        let strategy = ConsistentHashingMode::new(client, options, buffer);
        execute(
            Getter::new(strategy, consumer),
            plan,
            common.max_concurrent_files,
        )
        .await
    }
}

enum Plan {
    Single(Url, PathBuf),
    Manifest(Vec<ManifestEntry>),
}

async fn execute<S: Strategy>(getter: Getter<S>, plan: Plan, max_files: usize) -> Result<()> {
    match plan {
        Plan::Single(url, dest) => {
            let (size, elapsed) = getter.download_file(url.clone(), &dest).await?;
            info!(
                "downloaded {url} ({}) in {:.3}s",
                format_bytes(size),
                elapsed.as_secs_f64(),
            );
            Ok(())
        }
        Plan::Manifest(entries) => multifile::download_all(&getter, entries, max_files).await,
    }
}

fn init_logger(level: LogLevel) {
    use env_logger::Env;

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    builder.filter_level(level.filter());
    builder.format_timestamp_secs();
    let _ = builder.try_init();
}
