use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{StreamExt, TryStreamExt};
use log::{debug, warn};
use reqwest::{Response, StatusCode, Url};
use tokio::sync::Semaphore;

use crate::client::{content_range_total, read_body_checked, HttpClient};
use crate::consistent::hash_bucket;
use crate::error::DownloadError;

use super::buffer::{acquire_global, plan_chunks};
use super::{chunk_pipeline, Fetched, Options, Strategy};

/// Consistent-hashing mode: partition the object into fixed-size slices,
/// route each slice to a cache host picked by `hash_bucket`, and fall back
/// to the wrapped origin strategy when a cache misbehaves.
pub struct ConsistentHashingMode<F> {
    client: Arc<HttpClient>,
    options: Options,
    fallback: F,
}

impl<F: Strategy + Clone> ConsistentHashingMode<F> {
    pub fn new(client: Arc<HttpClient>, options: Options, fallback: F) -> Self {
        Self {
            client,
            options,
            fallback,
        }
    }

    fn routable(&self, url: &Url) -> bool {
        if self.options.cache_hosts.is_empty() {
            return false;
        }
        match url.host_str() {
            Some(host) => self
                .options
                .domains_to_cache
                .iter()
                .any(|domain| domain == host),
            None => false,
        }
    }

    /// Cache host for one slice, or `None` when the ring slot is an absent
    /// replica.
    fn slice_host(&self, url_base: &str, slice: u64) -> Option<&str> {
        let key = format!("{url_base}:{slice}");
        let index = hash_bucket(&key, self.options.cache_hosts.len());
        let host = self.options.cache_hosts[index].as_str();
        if host.is_empty() {
            None
        } else {
            Some(host)
        }
    }

    async fn fetch_routed(&self, url: Url) -> Result<Fetched, DownloadError> {
        let slice_size = self.options.slice_size.max(1);
        // A chunk must never span two slices.
        let chunk_size = self.options.chunk_size.clamp(1, slice_size);
        let url_base = base_of(&url);

        let probe_target = match self.slice_host(&url_base, 0) {
            Some(host) => Some(rewrite_host(&url, host)?),
            None => None,
        };

        let permit = acquire_global(&self.options.semaphore).await?;
        let probe_url = probe_target.as_ref().unwrap_or(&url);
        let response = match self.client.do_request(probe_url, 0, chunk_size - 1).await {
            Ok(response) => response,
            Err(err) if probe_target.is_some() && err.is_retriable() => {
                // File-level fallback: abandon cache routing for this URL.
                let miss = DownloadError::CacheMiss {
                    host: probe_url.host_str().unwrap_or_default().to_string(),
                    source: Box::new(err),
                };
                warn!("{miss}; fetching {url} from origin");
                drop(permit);
                return self.fallback.fetch(url).await;
            }
            Err(err) => return Err(err),
        };

        if response.status() == StatusCode::OK {
            debug!("{probe_url}: plain 200 for ranged request, streaming whole body");
            let size = response.content_length().unwrap_or(0);
            let stream = response
                .bytes_stream()
                .map_err(DownloadError::from)
                .boxed();
            return Ok(Fetched { stream, size });
        }

        let total = content_range_total(response.headers()).ok_or_else(|| {
            DownloadError::InvalidInput(format!(
                "missing or malformed Content-Range for {probe_url}"
            ))
        })?;
        if total == 0 {
            return Ok(Fetched {
                stream: futures_util::stream::empty().boxed(),
                size: 0,
            });
        }

        let first_len = chunk_size.min(total);
        let first = read_body_checked(response, probe_url, first_len).await?;
        drop(permit);

        let mut workers = Vec::new();
        let slice_count = total.div_ceil(slice_size);
        for slice in 0..slice_count {
            let slice_start = slice * slice_size;
            let slice_end = ((slice + 1) * slice_size).min(total);
            let cache_url = match self.slice_host(&url_base, slice) {
                Some(host) => Some(rewrite_host(&url, host)?),
                None => None,
            };
            // Chunk 0 came back with the probe.
            let from = if slice == 0 { first_len } else { slice_start };
            for (start, end) in plan_chunks(chunk_size, from, slice_end) {
                workers.push(slice_chunk_worker(
                    self.client.clone(),
                    self.fallback.clone(),
                    url.clone(),
                    cache_url.clone(),
                    start,
                    end,
                    self.options.semaphore.clone(),
                ));
            }
        }
        debug!(
            "{url}: {slice_count} slices over {} cache hosts, {} chunks",
            self.options.cache_hosts.len(),
            workers.len() + 1,
        );

        Ok(Fetched {
            stream: chunk_pipeline(Some(first), workers, self.options.max_concurrency),
            size: total,
        })
    }
}

impl<F: Strategy + Clone> Strategy for ConsistentHashingMode<F> {
    async fn fetch(&self, url: Url) -> Result<Fetched, DownloadError> {
        if !self.routable(&url) {
            return self.fallback.fetch(url).await;
        }
        self.fetch_routed(url).await
    }

    async fn do_request(
        &self,
        url: Url,
        start: u64,
        end: u64,
    ) -> Result<Response, DownloadError> {
        self.client.do_request(&url, start, end).await
    }
}

/// One slice chunk: fetch from the assigned cache host, and on a retriable
/// failure re-issue the range once against origin through the fallback.
/// Absent ring slots go straight to origin.
async fn slice_chunk_worker<F: Strategy>(
    client: Arc<HttpClient>,
    fallback: F,
    origin: Url,
    cache_url: Option<Url>,
    start: u64,
    end: u64,
    semaphore: Option<Arc<Semaphore>>,
) -> Result<Bytes, DownloadError> {
    let _permit = acquire_global(&semaphore).await?;
    let expected = end - start + 1;
    if let Some(cache) = &cache_url {
        match client.fetch_range(cache, start, end).await {
            Ok(bytes) => return Ok(bytes),
            Err(err) if err.is_retriable() => {
                let miss = DownloadError::CacheMiss {
                    host: cache.host_str().unwrap_or_default().to_string(),
                    source: Box::new(err),
                };
                warn!("{miss}; fetching bytes={start}-{end} of {origin} from origin");
            }
            Err(err) => return Err(err),
        }
    }
    let response = fallback.do_request(origin.clone(), start, end).await?;
    read_body_checked(response, &origin, expected).await
}

/// The URL with query and fragment stripped; the hash key prefix, so two
/// presigned variants of the same object share slice assignments.
fn base_of(url: &Url) -> String {
    let mut base = url.clone();
    base.set_query(None);
    base.set_fragment(None);
    base.to_string()
}

/// Swaps the URL authority for a `host[:port]` cache address; scheme and
/// path are preserved.
fn rewrite_host(url: &Url, cache_host: &str) -> Result<Url, DownloadError> {
    let (host, port) = match cache_host.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| {
                DownloadError::InvalidInput(format!("invalid cache host port in `{cache_host}`"))
            })?;
            (host, Some(port))
        }
        _ => (cache_host, None),
    };
    let mut rewritten = url.clone();
    rewritten
        .set_host(Some(host))
        .map_err(|_| DownloadError::InvalidInput(format!("invalid cache host `{cache_host}`")))?;
    rewritten
        .set_port(port)
        .map_err(|_| DownloadError::InvalidInput(format!("invalid cache host `{cache_host}`")))?;
    Ok(rewritten)
}
