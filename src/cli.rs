use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use tokio::sync::Semaphore;

use crate::client::{ClientOptions, ResolveOverride};
use crate::download::Options;
use crate::util::{default_concurrency, parse_size};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rget",
    author,
    version,
    about = "Parallel HTTP(S) downloader with cache routing and streaming tar extraction",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// URL to download
    #[arg(value_name = "url")]
    pub url: Option<String>,

    /// Destination path (a directory when extracting)
    #[arg(value_name = "dest")]
    pub dest: Option<PathBuf>,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Download every file listed in a manifest of `URL DESTINATION` pairs
    Multifile {
        /// Manifest path, or `-` for stdin
        #[arg(value_name = "manifest")]
        manifest: String,
    },
    /// Print version information
    Version,
}

#[derive(clap::Args, Debug, Clone)]
pub struct CommonArgs {
    /// Maximum in-flight chunk requests per file
    #[arg(long, global = true, value_name = "int", default_value_t = default_concurrency())]
    pub concurrency: usize,

    /// Target chunk size ("125M", "64Mi")
    #[arg(long = "chunk-size", global = true, value_name = "size", default_value = "125M")]
    pub chunk_size: String,

    /// Cache-hash slice size
    #[arg(long = "slice-size", global = true, value_name = "size", default_value = "500M")]
    pub slice_size: String,

    /// TCP connect timeout in seconds
    #[arg(long = "connect-timeout", global = true, value_name = "secs", default_value_t = 5)]
    pub connect_timeout: u64,

    /// Overwrite existing destinations
    #[arg(short = 'f', long, global = true)]
    pub force: bool,

    /// Extract the downloaded tar archive under the destination directory
    #[arg(short = 'x', long, global = true)]
    pub extract: bool,

    /// Per-chunk retry count
    #[arg(short = 'r', long, global = true, value_name = "int", default_value_t = 5)]
    pub retries: u32,

    /// Pin DNS for a host: `host:port:ip` (repeatable)
    #[arg(long, global = true, value_name = "host:port:ip")]
    pub resolve: Vec<String>,

    /// Log verbosity
    #[arg(long = "log-level", global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Multifile worker pool size
    #[arg(long = "max-concurrent-files", global = true, value_name = "int", default_value_t = 40)]
    pub max_concurrent_files: usize,

    /// Per-host connection cap
    #[arg(long = "max-conn-per-host", global = true, value_name = "int", default_value_t = 40)]
    pub max_conn_per_host: usize,

    /// Comma-separated cache ring; empty slots keep their ring index
    #[arg(long = "cache-hosts", global = true, value_name = "hosts", conflicts_with = "cache_srv")]
    pub cache_hosts: Option<String>,

    /// Discover the cache ring from `_http._tcp.<name>` SRV records
    #[arg(long = "cache-srv", global = true, value_name = "name")]
    pub cache_srv: Option<String>,

    /// Comma-separated origin hostnames eligible for cache routing
    #[arg(long = "cache-domains", global = true, value_name = "domains")]
    pub cache_domains: Option<String>,

    /// Force cleartext HTTP/2
    #[arg(long = "force-http2", global = true)]
    pub force_http2: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
        }
    }
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

impl CommonArgs {
    pub fn client_options(&self) -> Result<ClientOptions> {
        let mut resolve_overrides = Vec::with_capacity(self.resolve.len());
        for pin in &self.resolve {
            resolve_overrides.push(ResolveOverride::parse(pin)?);
        }
        Ok(ClientOptions {
            retries: self.retries,
            connect_timeout: Duration::from_secs(self.connect_timeout),
            resolve_overrides,
            force_http2: self.force_http2,
            max_conn_per_host: self.max_conn_per_host.max(1),
        })
    }

    pub fn download_options(
        &self,
        cache_hosts: Vec<String>,
        semaphore: Arc<Semaphore>,
    ) -> Result<Options> {
        if self.concurrency == 0 {
            bail!("--concurrency must be positive");
        }
        let chunk_size = parse_size(&self.chunk_size).context("invalid --chunk-size")?;
        let slice_size = parse_size(&self.slice_size).context("invalid --slice-size")?;
        Ok(Options {
            max_concurrency: self.concurrency,
            chunk_size,
            slice_size,
            cache_hosts,
            domains_to_cache: split_list(self.cache_domains.as_deref()),
            semaphore: Some(semaphore),
        })
    }

    /// The literal `--cache-hosts` ring. Empty slots are preserved:
    /// `"a,,b"` is a three-slot ring with an absent middle replica.
    pub fn cache_host_list(&self) -> Vec<String> {
        match self.cache_hosts.as_deref() {
            None | Some("") => Vec::new(),
            Some(hosts) => hosts.split(',').map(|h| h.trim().to_string()).collect(),
        }
    }
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cli = Cli::try_parse_from(["rget", "http://example.com/f", "out"]).expect("cli parse");
        assert_eq!(cli.common.retries, 5);
        assert_eq!(cli.common.connect_timeout, 5);
        assert_eq!(cli.common.max_concurrent_files, 40);
        assert_eq!(cli.common.max_conn_per_host, 40);
        assert_eq!(cli.common.concurrency, default_concurrency());
        assert_eq!(cli.common.log_level, LogLevel::Info);
        assert!(!cli.common.force);
        assert!(!cli.common.extract);

        let options = cli
            .common
            .download_options(Vec::new(), Arc::new(Semaphore::new(4)))
            .expect("options");
        assert_eq!(options.chunk_size, 125_000_000);
        assert_eq!(options.slice_size, 500_000_000);
    }

    #[test]
    fn cache_host_ring_preserves_empty_slots() {
        let cli = Cli::try_parse_from([
            "rget",
            "http://example.com/f",
            "out",
            "--cache-hosts",
            "cache-0.internal,,cache-2.internal:8080",
        ])
        .expect("cli parse");
        assert_eq!(
            cli.common.cache_host_list(),
            vec![
                "cache-0.internal".to_string(),
                String::new(),
                "cache-2.internal:8080".to_string(),
            ]
        );
    }

    #[test]
    fn cache_hosts_and_srv_discovery_conflict() {
        let result = Cli::try_parse_from([
            "rget",
            "http://example.com/f",
            "out",
            "--cache-hosts",
            "a",
            "--cache-srv",
            "cache.example.com",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn multifile_subcommand_accepts_global_flags() {
        let cli = Cli::try_parse_from(["rget", "multifile", "list.txt", "--retries", "2", "-f"])
            .expect("cli parse");
        match cli.command {
            Some(Command::Multifile { ref manifest }) => assert_eq!(manifest, "list.txt"),
            ref other => panic!("expected multifile, got {other:?}"),
        }
        assert_eq!(cli.common.retries, 2);
        assert!(cli.common.force);
    }

    #[test]
    fn resolve_overrides_flow_into_client_options() {
        let cli = Cli::try_parse_from([
            "rget",
            "http://example.com/f",
            "out",
            "--resolve",
            "example.com:443:10.0.0.7",
        ])
        .expect("cli parse");
        let options = cli.common.client_options().expect("client options");
        assert_eq!(options.resolve_overrides.len(), 1);
        assert_eq!(options.resolve_overrides[0].host, "example.com");

        let bad = Cli::try_parse_from([
            "rget",
            "http://example.com/f",
            "out",
            "--resolve",
            "nonsense",
        ])
        .expect("cli parse");
        assert!(bad.common.client_options().is_err());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let cli = Cli::try_parse_from([
            "rget",
            "http://example.com/f",
            "out",
            "--concurrency",
            "0",
        ])
        .expect("cli parse");
        assert!(cli
            .common
            .download_options(Vec::new(), Arc::new(Semaphore::new(1)))
            .is_err());
    }

    #[test]
    fn cache_domains_are_split_and_trimmed() {
        let cli = Cli::try_parse_from([
            "rget",
            "http://example.com/f",
            "out",
            "--cache-domains",
            "weights.example.com, data.example.com,",
        ])
        .expect("cli parse");
        let options = cli
            .common
            .download_options(Vec::new(), Arc::new(Semaphore::new(1)))
            .expect("options");
        assert_eq!(
            options.domains_to_cache,
            vec![
                "weights.example.com".to_string(),
                "data.example.com".to_string(),
            ]
        );
    }
}
