use std::io;
use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

/// HTTP statuses that are worth another attempt. Everything else in the
/// 4xx range (404 included) is final.
const RETRIABLE_STATUSES: [StatusCode; 7] = [
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::TOO_EARLY,
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected http status {status} for {url}")]
    UnexpectedStatus { url: String, status: StatusCode },

    #[error("short read for {url}: expected {expected} bytes, got {actual}")]
    ShortRead {
        url: String,
        expected: u64,
        actual: u64,
    },

    #[error("cache host {host} failed: {source}")]
    CacheMiss {
        host: String,
        #[source]
        source: Box<DownloadError>,
    },

    #[error("filesystem error at {path:?}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("download canceled")]
    Canceled,
}

impl DownloadError {
    /// Whether another attempt (or a cache fallback) could succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            DownloadError::Network(_) => true,
            DownloadError::ShortRead { .. } => true,
            DownloadError::CacheMiss { .. } => true,
            DownloadError::UnexpectedStatus { status, .. } => {
                RETRIABLE_STATUSES.contains(status)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("archive entry `{name}` escapes the destination directory")]
    ZipSlip { name: String },

    #[error("archive contains an entry with an empty name")]
    EmptyName,

    #[error("unsupported entry type {type_flag:?} for `{name}`")]
    UnsupportedEntry { name: String, type_flag: u8 },

    #[error("unexpected non-null byte 0x{byte:02x} in archive padding")]
    Padding { byte: u8 },

    #[error(transparent)]
    Io(#[from] io::Error),
}
