mod buffer;
mod consistent_hashing;

pub use buffer::BufferMode;
pub use consistent_hashing::ConsistentHashingMode;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use futures_util::future;
use reqwest::{Response, Url};
use tokio::sync::Semaphore;
use tokio_util::task::AbortOnDropHandle;

use crate::error::DownloadError;

/// Ordered byte stream: chunk boundaries are an implementation detail, but
/// the concatenation equals the object byte-for-byte.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, DownloadError>> + Send>>;

pub struct Fetched {
    pub stream: ByteStream,
    pub size: u64,
}

impl std::fmt::Debug for Fetched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetched").field("size", &self.size).finish_non_exhaustive()
    }
}

/// A download strategy: turn a URL into an ordered byte stream, and issue a
/// single ranged request on behalf of another strategy's fallback path.
pub trait Strategy: Send + Sync + 'static {
    fn fetch(&self, url: Url) -> impl Future<Output = Result<Fetched, DownloadError>> + Send;

    fn do_request(
        &self,
        url: Url,
        start: u64,
        end: u64,
    ) -> impl Future<Output = Result<Response, DownloadError>> + Send;
}

#[derive(Clone)]
pub struct Options {
    /// Maximum in-flight chunk requests per object.
    pub max_concurrency: usize,
    /// Target bytes per range request.
    pub chunk_size: u64,
    /// Stride of the cache-hash partitioning; chunks never cross a slice.
    pub slice_size: u64,
    /// Ordered cache ring. Empty strings are absent replicas that keep
    /// their slot.
    pub cache_hosts: Vec<String>,
    /// Origin hostnames eligible for cache routing.
    pub domains_to_cache: Vec<String>,
    /// Cross-file chunk budget shared by every concurrent fetch.
    pub semaphore: Option<Arc<Semaphore>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            chunk_size: 125_000_000,
            slice_size: 500_000_000,
            cache_hosts: Vec::new(),
            domains_to_cache: Vec::new(),
            semaphore: None,
        }
    }
}

/// Runs chunk workers as spawned tasks behind an ordered bounded queue.
///
/// Workers are spawned lazily as the queue takes them, at most `concurrency`
/// outstanding (in flight or finished-but-unconsumed), so a slow consumer
/// throttles producers and peak memory stays at `concurrency` chunk buffers.
/// Dropping the stream aborts every outstanding worker.
pub(crate) fn chunk_pipeline<W>(first: Option<Bytes>, workers: Vec<W>, concurrency: usize) -> ByteStream
where
    W: Future<Output = Result<Bytes, DownloadError>> + Send + 'static,
{
    let tail = stream::iter(workers)
        .map(|worker| {
            let handle = AbortOnDropHandle::new(tokio::spawn(worker));
            async move {
                match handle.await {
                    Ok(result) => result,
                    Err(err) if err.is_cancelled() => Err(DownloadError::Canceled),
                    Err(err) => std::panic::resume_unwind(err.into_panic()),
                }
            }
        })
        .buffered(concurrency.max(1));
    match first {
        Some(bytes) => stream::once(future::ready(Ok(bytes))).chain(tail).boxed(),
        None => tail.boxed(),
    }
}

/// Drains a fetched stream into one buffer.
#[cfg(test)]
pub(crate) async fn collect(mut fetched: Fetched) -> Result<Vec<u8>, DownloadError> {
    let mut out = Vec::with_capacity(fetched.size as usize);
    while let Some(chunk) = fetched.stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod testing {
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};
    use wiremock::matchers::method;

    /// Serves a fixed body, honoring `Range` headers with proper
    /// `206 Partial Content` + `Content-Range` responses, like a production
    /// object store. Without a parseable range (or for an empty body) it
    /// falls back to a plain 200 of the whole object.
    pub(crate) struct RangeResponder {
        body: Vec<u8>,
        ignore_range: bool,
    }

    impl RangeResponder {
        pub(crate) fn new(body: Vec<u8>) -> Self {
            Self {
                body,
                ignore_range: false,
            }
        }

        /// A server that answers ranged requests with the whole object.
        pub(crate) fn ignoring_range(body: Vec<u8>) -> Self {
            Self {
                body,
                ignore_range: true,
            }
        }
    }

    impl Respond for RangeResponder {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let range = request
                .headers
                .get("range")
                .and_then(|value| value.to_str().ok())
                .and_then(parse_range);
            match range {
                Some((start, end)) if !self.ignore_range && (start as usize) < self.body.len() => {
                    let end = (end as usize).min(self.body.len() - 1);
                    ResponseTemplate::new(206)
                        .insert_header(
                            "Content-Range",
                            format!("bytes {start}-{end}/{}", self.body.len()).as_str(),
                        )
                        .set_body_bytes(self.body[start as usize..=end].to_vec())
                }
                _ => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
            }
        }
    }

    fn parse_range(value: &str) -> Option<(u64, u64)> {
        let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
        Some((start.parse().ok()?, end.parse().ok()?))
    }

    pub(crate) async fn serve(body: Vec<u8>) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(RangeResponder::new(body))
            .mount(&server)
            .await;
        server
    }
}
