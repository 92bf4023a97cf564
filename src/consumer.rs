use std::io::{self, Read};
use std::path::{Path, PathBuf};

use bytes::{Buf, Bytes};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task;

use crate::download::Fetched;
use crate::error::DownloadError;
use crate::extract::extract_tar;

/// Bounded handoff between the network stream and the blocking extractor;
/// small on purpose so the downloader feels backpressure from disk.
const BRIDGE_DEPTH: usize = 2;

/// Sink for a fetched byte stream.
#[derive(Debug, Clone)]
pub enum Consumer {
    /// Write the bytes to the destination path.
    File { overwrite: bool },
    /// Treat the bytes as a (possibly compressed) tar archive and unpack it
    /// under the destination directory.
    Tar { overwrite: bool },
    /// Drain and discard; used for validation runs.
    Null,
}

impl Consumer {
    pub async fn consume(&self, fetched: Fetched, dest: &Path) -> Result<(), DownloadError> {
        match self {
            Consumer::File { overwrite } => write_file(fetched, dest, *overwrite).await,
            Consumer::Tar { overwrite } => extract_stream(fetched, dest, *overwrite).await,
            Consumer::Null => {
                let mut stream = fetched.stream;
                while let Some(chunk) = stream.next().await {
                    chunk?;
                }
                Ok(())
            }
        }
    }
}

async fn write_file(fetched: Fetched, dest: &Path, overwrite: bool) -> Result<(), DownloadError> {
    let fs_err = |source: io::Error| DownloadError::Filesystem {
        path: dest.to_path_buf(),
        source,
    };

    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(fs_err)?;
        }
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    let mut file = options.open(dest).await.map_err(fs_err)?;

    let mut stream = fetched.stream;
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await.map_err(fs_err)?;
    }
    file.flush().await.map_err(fs_err)?;
    Ok(())
}

async fn extract_stream(fetched: Fetched, dest: &Path, overwrite: bool) -> Result<(), DownloadError> {
    let (tx, rx) = mpsc::channel::<Result<Bytes, DownloadError>>(BRIDGE_DEPTH);
    let mut stream = fetched.stream;
    let forwarder = tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });

    let reader = ChannelReader::new(rx);
    let dest: PathBuf = dest.to_path_buf();
    let result = task::spawn_blocking(move || extract_tar(reader, &dest, overwrite)).await;
    forwarder.abort();
    match result {
        Ok(outcome) => outcome.map_err(DownloadError::from),
        Err(err) if err.is_cancelled() => Err(DownloadError::Canceled),
        Err(err) => std::panic::resume_unwind(err.into_panic()),
    }
}

/// Blocking `Read` over the ordered chunk channel, for feeding sync
/// consumers from inside `spawn_blocking`.
struct ChannelReader {
    rx: mpsc::Receiver<Result<Bytes, DownloadError>>,
    current: Bytes,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<Result<Bytes, DownloadError>>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(Ok(bytes)) => self.current = bytes,
                Some(Err(err)) => return Err(io::Error::other(err)),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}
