//! Error taxonomy for binary provisioning.
//!
//! Manifest-level variants are fatal to a whole run. Download, verification,
//! compression and extraction variants are scoped to a single tool and are
//! surfaced to the UI as `"[stage] message"`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Unsupported platform/arch: {os} {arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("Failed to fetch manifest from {url}: {reason}")]
    ManifestFetch { url: String, reason: String },

    #[error("Failed to parse manifest: {0}")]
    ManifestParse(String),

    #[error(
        "Local manifest {} must contain appVersion (version correspondence with the host application is unknown)",
        .path.display()
    )]
    LocalManifestMissingAppVersion { path: PathBuf },

    #[error("Failed to download {url}: HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Network error while fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("SHA256 mismatch for {url}. Expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("Too many redirects (more than {limit}) starting at {url}")]
    TooManyRedirects { url: String, limit: usize },

    #[error("Timed out after {secs}s while fetching {url}")]
    Timeout { url: String, secs: u64 },

    #[error("Failed to compress {}: {reason}", .path.display())]
    Compression { path: PathBuf, reason: String },

    #[error("Failed to extract {}: {reason}", .path.display())]
    Extraction { path: PathBuf, reason: String },

    #[error("{context}: {source}")]
    Io {
        /// Stage label the failed operation belongs to.
        stage: &'static str,
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    /// Wraps an I/O error with the stage it happened in and a short
    /// description of what was attempted.
    pub fn io(stage: &'static str, context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            stage,
            context: context.into(),
            source,
        }
    }

    /// The pipeline stage this error belongs to, as shown in `"[stage] message"`.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::UnsupportedPlatform { .. } => "platform",
            Self::ManifestFetch { .. }
            | Self::ManifestParse(_)
            | Self::LocalManifestMissingAppVersion { .. } => "manifest",
            Self::HttpStatus { .. }
            | Self::Network { .. }
            | Self::TooManyRedirects { .. }
            | Self::Timeout { .. } => "download",
            Self::Io { stage, .. } => *stage,
            Self::ChecksumMismatch { .. } => "verify",
            Self::Compression { .. } => "compress",
            Self::Extraction { .. } => "extract",
        }
    }

    /// Whether the error is scoped to a single tool rather than the whole run.
    pub fn is_per_tool(&self) -> bool {
        !matches!(
            self,
            Self::UnsupportedPlatform { .. }
                | Self::ManifestFetch { .. }
                | Self::ManifestParse(_)
                | Self::LocalManifestMissingAppVersion { .. }
        )
    }
}

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;
