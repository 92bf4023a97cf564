use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::debug;
use reqwest::Url;

use crate::consumer::Consumer;
use crate::download::Strategy;
use crate::util::format_bytes;

/// Binds a download strategy to a consumer: fetch the ordered stream, hand
/// it to the sink, and account for both phases.
pub struct Getter<S> {
    strategy: S,
    consumer: Consumer,
}

impl<S: Strategy> Getter<S> {
    pub fn new(strategy: S, consumer: Consumer) -> Self {
        Self { strategy, consumer }
    }

    /// Downloads `url` into `dest`. Returns the object size and the total
    /// elapsed time.
    pub async fn download_file(&self, url: Url, dest: &Path) -> Result<(u64, Duration)> {
        let download_start = Instant::now();
        let fetched = self
            .strategy
            .fetch(url.clone())
            .await
            .with_context(|| format!("failed to fetch {url}"))?;
        let size = fetched.size;
        let download_elapsed = download_start.elapsed();

        let write_start = Instant::now();
        self.consumer
            .consume(fetched, dest)
            .await
            .with_context(|| format!("failed to write {}", dest.display()))?;
        let write_elapsed = write_start.elapsed();
        let total_elapsed = download_start.elapsed();

        let throughput = if total_elapsed.as_secs_f64() > 0.0 {
            (size as f64 / total_elapsed.as_secs_f64()) as u64
        } else {
            size
        };
        debug!(
            "{}: {} downloaded, download {:.3}s, write {:.3}s, total {:.3}s, {}/s",
            dest.display(),
            format_bytes(size),
            download_elapsed.as_secs_f64(),
            write_elapsed.as_secs_f64(),
            total_elapsed.as_secs_f64(),
            format_bytes(throughput),
        );
        Ok((size, total_elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::client::{ClientOptions, HttpClient};
    use crate::download::testing::serve;
    use crate::download::{BufferMode, Options};

    fn file_getter(client: Arc<HttpClient>) -> Getter<BufferMode> {
        Getter::new(
            BufferMode::new(
                client,
                Options {
                    max_concurrency: 4,
                    chunk_size: 1000,
                    ..Options::default()
                },
            ),
            Consumer::File { overwrite: false },
        )
    }

    #[tokio::test]
    async fn downloads_to_file_byte_for_byte() {
        let body: Vec<u8> = (0..10_000).map(|i| (i % 149) as u8).collect();
        let server = serve(body.clone()).await;
        let client = Arc::new(HttpClient::new(&ClientOptions::default()).unwrap());
        let getter = file_getter(client);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("weights.bin");
        let url = Url::parse(&format!("{}/weights.bin", server.uri())).unwrap();
        let (size, _elapsed) = getter.download_file(url, &dest).await.unwrap();
        assert_eq!(size, body.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn fetch_failure_reports_the_url() {
        // no mounted mocks, so every request gets a 404
        let server = wiremock::MockServer::start().await;
        let url = Url::parse(&format!("{}/absent", server.uri())).unwrap();
        let client = Arc::new(
            HttpClient::new(&ClientOptions {
                retries: 0,
                ..ClientOptions::default()
            })
            .unwrap(),
        );
        let getter = Getter::new(
            BufferMode::new(client, Options::default()),
            Consumer::Null,
        );
        let dir = tempfile::tempdir().unwrap();
        let err = getter
            .download_file(url.clone(), &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains(url.as_str()));
    }
}
