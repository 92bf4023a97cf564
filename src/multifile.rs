use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use log::{info, warn};
use reqwest::Url;

use crate::download::Strategy;
use crate::getter::Getter;
use crate::util::{ensure_destination_not_exist, format_bytes};

#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub url: Url,
    pub dest: PathBuf,
}

/// Opens a manifest path, `-` meaning stdin, and parses it.
pub fn read_manifest(path: &str, force: bool) -> Result<Vec<ManifestEntry>> {
    if path == "-" {
        return parse_manifest(io::stdin().lock(), force);
    }
    let file =
        File::open(path).with_context(|| format!("failed to open manifest file {path}"))?;
    parse_manifest(BufReader::new(file), force)
}

/// Parses whitespace-separated `URL DESTINATION` pairs, one per line.
///
/// Blank lines are skipped. A repeated `(url, dest)` pair is skipped with a
/// warning; the same destination under two different URLs is an error, as is
/// an existing destination without `force`.
pub fn parse_manifest<R: BufRead>(reader: R, force: bool) -> Result<Vec<ManifestEntry>> {
    let mut seen: HashMap<PathBuf, Url> = HashMap::new();
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line.context("failed to read manifest")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (url, dest) = match (fields.next(), fields.next(), fields.next()) {
            (Some(url), Some(dest), None) => (url, dest),
            _ => bail!("invalid manifest line `{line}`: expected `URL DESTINATION`"),
        };
        let url = Url::parse(url).with_context(|| format!("invalid manifest url {url}"))?;
        let dest = PathBuf::from(dest);

        if let Some(seen_url) = seen.get(&dest) {
            if *seen_url == url {
                warn!(
                    "skipping duplicate manifest entry {url} -> {}",
                    dest.display()
                );
                continue;
            }
            bail!(
                "duplicate destination {} with different urls: {seen_url} and {url}",
                dest.display()
            );
        }
        ensure_destination_not_exist(&dest, force)?;
        seen.insert(dest.clone(), url.clone());
        entries.push(ManifestEntry { url, dest });
    }
    Ok(entries)
}

/// Downloads every manifest entry through a pool of up to
/// `max_concurrent_files` workers sharing one strategy (and therefore one
/// connection pool and chunk budget). The first failure cancels the
/// in-flight siblings and is reported with its URL.
pub async fn download_all<S: Strategy>(
    getter: &Getter<S>,
    entries: Vec<ManifestEntry>,
    max_concurrent_files: usize,
) -> Result<()> {
    if entries.is_empty() {
        info!("manifest is empty; nothing to download");
        return Ok(());
    }

    let started = Instant::now();
    let count = entries.len();
    let total_bytes = stream::iter(entries.into_iter().map(|entry| async move {
        let (size, _elapsed) = getter
            .download_file(entry.url.clone(), &entry.dest)
            .await
            .with_context(|| format!("download of {} failed", entry.url))?;
        Ok::<u64, anyhow::Error>(size)
    }))
    .buffer_unordered(max_concurrent_files.max(1))
    .try_fold(0u64, |acc, size| async move { Ok(acc + size) })
    .await?;

    let elapsed = started.elapsed();
    let throughput = if elapsed.as_secs_f64() > 0.0 {
        (total_bytes as f64 / elapsed.as_secs_f64()) as u64
    } else {
        total_bytes
    };
    info!(
        "downloaded {count} files, {} in {:.3}s ({}/s)",
        format_bytes(total_bytes),
        elapsed.as_secs_f64(),
        format_bytes(throughput),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer};

    use crate::client::{ClientOptions, HttpClient};
    use crate::consumer::Consumer;
    use crate::download::testing::RangeResponder;
    use crate::download::{BufferMode, Options};

    #[test]
    fn parses_pairs_and_skips_blank_lines() {
        let input = "http://a.example.com/x out/x\n\n   \nhttp://a.example.com/y out/y\n";
        let entries = parse_manifest(input.as_bytes(), false).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].url.as_str(), "http://a.example.com/x");
        assert_eq!(entries[1].dest, PathBuf::from("out/y"));
    }

    #[test]
    fn duplicate_pairs_are_skipped() {
        let input = "http://a.example.com/x out/x\nhttp://a.example.com/x out/x\n";
        let entries = parse_manifest(input.as_bytes(), false).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn conflicting_destinations_abort() {
        let input = "http://a.example.com/x out/x\nhttp://a.example.com/other out/x\n";
        let err = parse_manifest(input.as_bytes(), false).unwrap_err();
        assert!(err.to_string().contains("duplicate destination"));
    }

    #[test]
    fn malformed_lines_abort() {
        assert!(parse_manifest(&b"just-one-field\n"[..], false).is_err());
        assert!(parse_manifest(&b"a b c\n"[..], false).is_err());
        assert!(parse_manifest(&b"not a url dest\n"[..], false).is_err());
    }

    #[test]
    fn existing_destination_requires_force() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("present");
        std::fs::write(&dest, b"x").unwrap();
        let line = format!("http://a.example.com/x {}\n", dest.display());
        assert!(parse_manifest(line.as_bytes(), false).is_err());
        assert!(parse_manifest(line.as_bytes(), true).is_ok());
    }

    #[tokio::test]
    async fn downloads_a_manifest_concurrently() {
        let server = MockServer::start().await;
        let mut bodies = Vec::new();
        for i in 0..5u8 {
            let body: Vec<u8> = (0..20_000usize).map(|j| (j % (31 + i as usize)) as u8).collect();
            Mock::given(method("GET"))
                .and(path(format!("/file-{i}")))
                .respond_with(RangeResponder::new(body.clone()))
                .mount(&server)
                .await;
            bodies.push(body);
        }

        let dir = tempfile::tempdir().unwrap();
        let manifest: String = (0..5)
            .map(|i| {
                format!(
                    "{}/file-{i} {}\n",
                    server.uri(),
                    dir.path().join(format!("file-{i}")).display()
                )
            })
            .collect();
        let entries = parse_manifest(manifest.as_bytes(), false).unwrap();

        let client = Arc::new(HttpClient::new(&ClientOptions::default()).unwrap());
        let getter = Getter::new(
            BufferMode::new(
                client,
                Options {
                    max_concurrency: 4,
                    chunk_size: 3_000,
                    ..Options::default()
                },
            ),
            Consumer::File { overwrite: false },
        );
        download_all(&getter, entries, 3).await.unwrap();

        for (i, body) in bodies.iter().enumerate() {
            let written = std::fs::read(dir.path().join(format!("file-{i}"))).unwrap();
            assert_eq!(&written, body, "file-{i} differs");
        }
    }

    #[tokio::test]
    async fn first_failure_cancels_the_pool() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/good"))
            .respond_with(RangeResponder::new(vec![1u8; 4096]))
            .mount(&server)
            .await;
        // `/bad` has no mock and 404s

        let dir = tempfile::tempdir().unwrap();
        let manifest = format!(
            "{uri}/good {good}\n{uri}/bad {bad}\n",
            uri = server.uri(),
            good = dir.path().join("good").display(),
            bad = dir.path().join("bad").display(),
        );
        let entries = parse_manifest(manifest.as_bytes(), false).unwrap();

        let client = Arc::new(
            HttpClient::new(&ClientOptions {
                retries: 0,
                ..ClientOptions::default()
            })
            .unwrap(),
        );
        let getter = Getter::new(
            BufferMode::new(client, Options::default()),
            Consumer::File { overwrite: false },
        );
        let err = download_all(&getter, entries, 2).await.unwrap_err();
        assert!(format!("{err:#}").contains("/bad"));
    }

    #[test]
    fn read_manifest_reports_missing_files() {
        let err = read_manifest("/definitely/not/here.txt", false).unwrap_err();
        assert!(err.to_string().contains("manifest"));
    }
}
