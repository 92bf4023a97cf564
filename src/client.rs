use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use rand::Rng;
use reqwest::header::{self, HeaderMap};
use reqwest::{Response, StatusCode, Url};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;

use crate::error::DownloadError;

const BACKOFF_BASE: Duration = Duration::from_millis(200);
const BACKOFF_MAX_EXPONENT: u32 = 5;
const BACKOFF_JITTER_MS: u64 = 250;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// A curl-style `host:port:ip` DNS pin. Dialing goes to `addr`; TLS keeps the
/// original hostname for SNI and certificate checks.
#[derive(Debug, Clone)]
pub struct ResolveOverride {
    pub host: String,
    pub port: u16,
    pub addr: IpAddr,
}

impl ResolveOverride {
    pub fn parse(input: &str) -> Result<Self, DownloadError> {
        let mut parts = input.splitn(3, ':');
        let (host, port, addr) = match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(port), Some(addr)) if !host.is_empty() => (host, port, addr),
            _ => {
                return Err(DownloadError::InvalidInput(format!(
                    "resolve override must be host:port:ip, got `{input}`"
                )))
            }
        };
        let port = port.parse::<u16>().map_err(|_| {
            DownloadError::InvalidInput(format!("invalid port in resolve override `{input}`"))
        })?;
        let addr = addr.parse::<IpAddr>().map_err(|_| {
            DownloadError::InvalidInput(format!("invalid address in resolve override `{input}`"))
        })?;
        Ok(Self {
            host: host.to_string(),
            port,
            addr,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub retries: u32,
    pub connect_timeout: Duration,
    pub resolve_overrides: Vec<ResolveOverride>,
    pub force_http2: bool,
    pub max_conn_per_host: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            retries: 5,
            connect_timeout: Duration::from_secs(5),
            resolve_overrides: Vec::new(),
            force_http2: false,
            max_conn_per_host: 40,
        }
    }
}

/// Shared transport for every strategy: one reqwest client plus the retry
/// policy and per-host connection budget.
pub struct HttpClient {
    client: reqwest::Client,
    retries: u32,
    host_limits: HostLimits,
}

impl HttpClient {
    pub fn new(options: &ClientOptions) -> Result<Self, DownloadError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("rget/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(options.connect_timeout)
            .pool_max_idle_per_host(options.max_conn_per_host)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .tcp_keepalive(KEEPALIVE_INTERVAL)
            .tcp_nodelay(true);
        if options.force_http2 {
            builder = builder.http2_prior_knowledge();
        }
        for pin in &options.resolve_overrides {
            debug!(
                "pinning {}:{} to {} for all dials",
                pin.host, pin.port, pin.addr
            );
            builder = builder.resolve_to_addrs(&pin.host, &[SocketAddr::new(pin.addr, pin.port)]);
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            retries: options.retries,
            host_limits: HostLimits::new(options.max_conn_per_host),
        })
    }

    /// Issues `GET url` with `Range: bytes=start-end`, retrying transient
    /// failures with backoff. The response is either `206 Partial Content`
    /// or, for objects smaller than the requested range, `200 OK`.
    pub async fn do_request(
        &self,
        url: &Url,
        start: u64,
        end: u64,
    ) -> Result<Response, DownloadError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.request_once(url, start, end).await {
                Ok((response, _permit)) => return Ok(response),
                Err(err) if attempt <= self.retries && err.is_retriable() => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        "range bytes={start}-{end} of {url} failed on attempt {attempt}: {err}; \
                         retrying in {delay:?}"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Fetches one chunk fully into memory. Short bodies count as transient
    /// and re-enter the retry loop; the per-host permit is held until the
    /// body has been read.
    pub async fn fetch_range(
        &self,
        url: &Url,
        start: u64,
        end: u64,
    ) -> Result<Bytes, DownloadError> {
        let expected = end - start + 1;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = async {
                let (response, _permit) = self.request_once(url, start, end).await?;
                read_body_checked(response, url, expected).await
            }
            .await;
            match result {
                Ok(body) => return Ok(body),
                Err(err) if attempt <= self.retries && err.is_retriable() => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        "chunk bytes={start}-{end} of {url} failed on attempt {attempt}: {err}; \
                         retrying in {delay:?}"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn request_once(
        &self,
        url: &Url,
        start: u64,
        end: u64,
    ) -> Result<(Response, OwnedSemaphorePermit), DownloadError> {
        let permit = self.host_limits.acquire(url).await?;
        let response = self
            .client
            .get(url.clone())
            .header(header::RANGE, format!("bytes={start}-{end}"))
            .send()
            .await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::UnexpectedStatus {
                url: url.to_string(),
                status,
            });
        }
        Ok((response, permit))
    }
}

/// Reads a response body whose length is known up front, failing on any
/// mismatch so the caller's retry policy can kick in.
pub(crate) async fn read_body_checked(
    response: Response,
    url: &Url,
    expected: u64,
) -> Result<Bytes, DownloadError> {
    let body = response.bytes().await?;
    if body.len() as u64 != expected {
        return Err(DownloadError::ShortRead {
            url: url.to_string(),
            expected,
            actual: body.len() as u64,
        });
    }
    Ok(body)
}

/// Extracts the total object size from a `Content-Range: bytes a-b/TOTAL`
/// header.
pub(crate) fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    let rest = raw.strip_prefix("bytes ")?;
    let (_range, total) = rest.split_once('/')?;
    total.trim().parse().ok()
}

fn backoff_delay(attempt: u32) -> Duration {
    let exponent = (attempt - 1).min(BACKOFF_MAX_EXPONENT);
    let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);
    BACKOFF_BASE * 2u32.pow(exponent) + Duration::from_millis(jitter)
}

/// Per-host in-flight request budget. reqwest bounds idle connections but
/// not active ones, so saturation is enforced here: requests past the cap
/// wait for a permit.
struct HostLimits {
    max: usize,
    inner: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostLimits {
    fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, url: &Url) -> Result<OwnedSemaphorePermit, DownloadError> {
        let key = match (url.host_str(), url.port_or_known_default()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(DownloadError::InvalidInput(format!(
                    "url {url} has no host"
                )))
            }
        };
        let semaphore = {
            let mut map = self.inner.lock().expect("host limit map poisoned");
            map.entry(key)
                .or_insert_with(|| Arc::new(Semaphore::new(self.max)))
                .clone()
        };
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| DownloadError::Canceled)
    }
}
