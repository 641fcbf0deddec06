//! Error types shared by the synchronization engine.
//!
//! Library code returns [`SyncError`]; the binary wraps it with `anyhow` at the edge.

use std::path::PathBuf;

use reqwest::StatusCode;

/// Errors raised while fetching, extracting, packaging or persisting a work.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Every host and every retry failed for a request.
    #[error("all hosts exhausted for {url} after {attempts} attempts: {last}")]
    NetworkExhausted {
        url: String,
        attempts: u32,
        #[source]
        last: AttemptError,
    },

    /// The resource does not exist (HTTP 404). Never retried.
    #[error("not found: {url}")]
    NotFound { url: String },

    /// None of the configured hosts answered the startup probe.
    #[error("no reachable host among: {hosts}")]
    NoReachableHost { hosts: String },

    /// The fetched document does not have the expected structure.
    #[error("extraction failed for {url}: {message}")]
    ExtractionFailed { url: String, message: String },

    /// Reading or writing an artifact file failed.
    #[error("artifact I/O error at {path:?}: {message}")]
    ArtifactIo { path: PathBuf, message: String },

    /// Reading or writing the persisted catalog failed.
    #[error("catalog I/O error at {path:?}: {message}")]
    CatalogIo { path: PathBuf, message: String },

    /// Image bytes could not be decoded or re-encoded.
    #[error("image error for {url}: {source}")]
    Media {
        url: String,
        #[source]
        source: image::ImageError,
    },

    /// The URL is malformed or does not belong to a configured host.
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// Invalid runtime configuration.
    #[error("config error: {message}")]
    Config { message: String },
}

/// Cause of a single failed request attempt.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(StatusCode),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn extraction(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExtractionFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn artifact_io(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::ArtifactIo {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn catalog_io(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::CatalogIo {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether this error means "the input was not something we can work with"
    /// rather than an internal failure.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl { .. } | Self::NotFound { .. } | Self::ExtractionFailed { .. }
        )
    }
}
