use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use log::debug;
use reqwest::{Response, StatusCode, Url};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::client::{content_range_total, read_body_checked, HttpClient};
use crate::error::DownloadError;
use crate::util::format_bytes;

use super::{chunk_pipeline, Fetched, Options, Strategy};

/// Buffer mode: split one object into contiguous byte ranges, fetch them
/// concurrently against its own origin, and expose the ordered
/// concatenation.
#[derive(Clone)]
pub struct BufferMode {
    client: Arc<HttpClient>,
    options: Options,
}

impl BufferMode {
    pub fn new(client: Arc<HttpClient>, options: Options) -> Self {
        Self { client, options }
    }

    async fn fetch_inner(&self, url: Url) -> Result<Fetched, DownloadError> {
        let chunk_size = self.options.chunk_size.max(1);

        // The probe doubles as chunk 0, so it draws from the shared budget
        // like any other chunk.
        let permit = acquire_global(&self.options.semaphore).await?;
        let response = self.client.do_request(&url, 0, chunk_size - 1).await?;

        if response.status() == StatusCode::OK {
            // Origin ignored the range: the object fits in one response.
            debug!("{url}: plain 200 for ranged request, streaming whole body");
            let size = response.content_length().unwrap_or(0);
            let stream = response
                .bytes_stream()
                .map_err(DownloadError::from)
                .boxed();
            return Ok(Fetched { stream, size });
        }

        let total = content_range_total(response.headers()).ok_or_else(|| {
            DownloadError::InvalidInput(format!("missing or malformed Content-Range for {url}"))
        })?;
        if total == 0 {
            return Ok(Fetched {
                stream: stream::empty().boxed(),
                size: 0,
            });
        }

        let first_len = chunk_size.min(total);
        let first = read_body_checked(response, &url, first_len).await?;
        drop(permit);

        let workers: Vec<_> = plan_chunks(chunk_size, first_len, total)
            .into_iter()
            .map(|(start, end)| {
                chunk_worker(
                    self.client.clone(),
                    url.clone(),
                    start,
                    end,
                    self.options.semaphore.clone(),
                )
            })
            .collect();
        debug!(
            "{url}: {} in {} chunks of up to {}",
            format_bytes(total),
            workers.len() + 1,
            format_bytes(chunk_size),
        );

        Ok(Fetched {
            stream: chunk_pipeline(Some(first), workers, self.options.max_concurrency),
            size: total,
        })
    }
}

impl Strategy for BufferMode {
    async fn fetch(&self, url: Url) -> Result<Fetched, DownloadError> {
        self.fetch_inner(url).await
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

async fn chunk_worker(
    client: Arc<HttpClient>,
    url: Url,
    start: u64,
    end: u64,
    semaphore: Option<Arc<Semaphore>>,
) -> Result<Bytes, DownloadError> {
    let _permit = acquire_global(&semaphore).await?;
    client.fetch_range(&url, start, end).await
}

pub(crate) async fn acquire_global(
    semaphore: &Option<Arc<Semaphore>>,
) -> Result<Option<OwnedSemaphorePermit>, DownloadError> {
    match semaphore {
        Some(semaphore) => semaphore
            .clone()
            .acquire_owned()
            .await
            .map(Some)
            .map_err(|_| DownloadError::Canceled),
        None => Ok(None),
    }
}

/// Splits `[from, to)` into inclusive `(start, end)` ranges of at most
/// `chunk_size` bytes.
pub(crate) fn plan_chunks(chunk_size: u64, from: u64, to: u64) -> Vec<(u64, u64)> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut start = from;
    while start < to {
        let end = (start + chunk_size - 1).min(to - 1);
        chunks.push((start, end));
        start = end + 1;
    }
    chunks
}
