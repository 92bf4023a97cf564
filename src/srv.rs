use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use hickory_resolver::TokioAsyncResolver;
use log::debug;
use regex::Regex;

/// One SRV answer, already reduced to what host ordering needs.
#[derive(Debug, Clone)]
pub struct SrvTarget {
    pub target: String,
    pub port: u16,
}

/// Discovers the cache ring behind `_http._tcp.<srv_name>`.
pub async fn lookup_cache_hosts(srv_name: &str) -> Result<Vec<String>> {
    let resolver =
        TokioAsyncResolver::tokio_from_system_conf().context("failed to build DNS resolver")?;
    let lookup = resolver
        .srv_lookup(format!("_http._tcp.{srv_name}"))
        .await
        .with_context(|| format!("SRV lookup for {srv_name} failed"))?;
    let targets: Vec<SrvTarget> = lookup
        .iter()
        .map(|srv| SrvTarget {
            target: srv.target().to_utf8(),
            port: srv.port(),
        })
        .collect();
    order_cache_hosts(&targets)
}

/// Orders SRV targets into a dense ring by the index embedded in the
/// hostname (`cache-<N>.…`). Missing indices stay as empty slots so the
/// ring keeps its geometry; non-80 ports are carried along.
pub fn order_cache_hosts(targets: &[SrvTarget]) -> Result<Vec<String>> {
    let mut highest = 0usize;
    for target in targets {
        let index = cache_index_for(&target.target)?;
        debug!("cache target {} has ring index {index}", target.target);
        highest = highest.max(index);
    }

    let mut output = vec![String::new(); if targets.is_empty() { 0 } else { highest + 1 }];
    for target in targets {
        let index = cache_index_for(&target.target)?;
        let hostname = target.target.trim_end_matches('.');
        output[index] = if target.port != 80 {
            format!("{hostname}:{}", target.port)
        } else {
            hostname.to_string()
        };
    }
    Ok(output)
}

fn cache_index_for(hostname: &str) -> Result<usize> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[a-z0-9-]*-([0-9]+)\.").expect("valid regex"));
    let captures = re
        .captures(hostname)
        .ok_or_else(|| anyhow!("couldn't parse cache hostname {hostname}"))?;
    captures[1]
        .parse()
        .with_context(|| format!("bad cache index in hostname {hostname}"))
}
