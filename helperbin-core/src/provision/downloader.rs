//! Verified streaming downloader.
//!
//! Downloads stream into `<dest>.download` while a SHA-256 digest is computed
//! over the same chunks. Only a matching digest is renamed onto `<dest>`, so
//! a partial or corrupt file is never visible at the final path.
//!
//! Redirects are followed by hand (the transport never follows them) so the
//! hop count can be bounded and every hop is verified against the same hash.

use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::{Client, Response};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use super::paths::with_suffix;
use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, Result};

/// Suffix of the in-flight temp file next to the destination.
pub const TEMP_SUFFIX: &str = ".download";

// ============================================================================
// HTTP Plumbing
// ============================================================================

/// Builds a client that never follows redirects on its own.
pub(crate) fn build_client(connect_timeout: Duration) -> Result<Client> {
    Client::builder()
        .redirect(Policy::none())
        .connect_timeout(connect_timeout)
        .user_agent(concat!("helperbin/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|source| ProvisionError::Network {
            url: "<client setup>".to_string(),
            source,
        })
}

/// Returns the absolute URL a redirect response points at.
///
/// `None` for non-3xx responses and for redirects without a usable
/// `Location`; relative locations are resolved against `current`.
pub(crate) fn redirect_target(current: &str, response: &Response) -> Option<String> {
    if !response.status().is_redirection() {
        return None;
    }
    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    let next = Url::parse(current).ok()?.join(location).ok()?;
    Some(next.to_string())
}

// ============================================================================
// Download Progress
// ============================================================================

/// Progress information during a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes received so far.
    pub received: u64,
    /// Total bytes from `Content-Length`, or 0 when unknown.
    pub total: u64,
}

impl DownloadProgress {
    /// Rounded percentage, 0 when the total is unknown.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let ratio = self.received as f64 / self.total as f64;
        (ratio * 100.0).round().clamp(0.0, 100.0) as u8
    }
}

/// Result of a verified download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Bytes written to the destination.
    pub bytes: u64,
    /// URL that finally served the content, after redirects.
    pub final_url: String,
    /// Lowercase hex digest of the content.
    pub sha256: String,
}

// ============================================================================
// Verified Downloader
// ============================================================================

/// Streams URLs to disk and commits them only when their SHA-256 matches.
#[derive(Debug, Clone)]
pub struct VerifiedDownloader {
    client: Client,
    max_redirects: usize,
    idle_timeout: Duration,
    total_timeout: Option<Duration>,
}

impl VerifiedDownloader {
    pub fn new(config: &ProvisionConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.connect_timeout())?,
            max_redirects: config.max_redirects,
            idle_timeout: config.idle_timeout(),
            total_timeout: None,
        })
    }

    /// Bounds the whole transfer, redirects included.
    pub fn with_total_timeout(mut self, total_timeout: Option<Duration>) -> Self {
        self.total_timeout = total_timeout;
        self
    }

    /// Downloads `url` to `dest`, verifying it against `expected_sha256`.
    pub async fn download(
        &self,
        url: &str,
        expected_sha256: &str,
        dest: &Path,
    ) -> Result<DownloadOutcome> {
        self.download_with_progress(url, expected_sha256, dest, |_| {})
            .await
    }

    /// Like [`download`](Self::download), reporting progress after every chunk.
    ///
    /// # Errors
    ///
    /// - `HttpStatus` for a final non-2xx response.
    /// - `Network` for transport failures.
    /// - `TooManyRedirects` when the redirect chain exceeds the configured cap.
    /// - `Timeout` when the idle or total deadline passes.
    /// - `ChecksumMismatch` when the content does not match; nothing is left on disk.
    pub async fn download_with_progress<F>(
        &self,
        url: &str,
        expected_sha256: &str,
        dest: &Path,
        progress_cb: F,
    ) -> Result<DownloadOutcome>
    where
        F: FnMut(DownloadProgress),
    {
        info!("Downloading {} to {}", url, dest.display());
        let tmp = with_suffix(dest, TEMP_SUFFIX);

        let transfer = self.transfer(url, expected_sha256, dest, progress_cb);
        let result = match self.total_timeout {
            Some(limit) => match tokio::time::timeout(limit, transfer).await {
                Ok(result) => result,
                Err(_) => Err(ProvisionError::Timeout {
                    url: url.to_string(),
                    secs: limit.as_secs(),
                }),
            },
            None => transfer.await,
        };

        if result.is_err() {
            discard(&tmp).await;
        }
        result
    }

    async fn transfer<F>(
        &self,
        url: &str,
        expected_sha256: &str,
        dest: &Path,
        mut progress_cb: F,
    ) -> Result<DownloadOutcome>
    where
        F: FnMut(DownloadProgress),
    {
        let mut response = self.open(url).await?;
        let final_url = response.url().to_string();

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ProvisionError::io(
                    "download",
                    format!("Failed to create directory: {}", parent.display()),
                    e,
                )
            })?;
        }

        let tmp = with_suffix(dest, TEMP_SUFFIX);
        let mut file = File::create(&tmp)
            .await
            .map_err(|e| {
                ProvisionError::io("download", format!("Failed to create file: {}", tmp.display()), e)
            })?;

        let total = response.content_length().unwrap_or(0);
        debug!("Content-Length: {}", total);

        let mut received: u64 = 0;
        let mut hasher = Sha256::new();
        progress_cb(DownloadProgress { received, total });

        loop {
            let chunk = match tokio::time::timeout(self.idle_timeout, response.chunk()).await {
                Ok(Ok(Some(chunk))) => chunk,
                Ok(Ok(None)) => break,
                Ok(Err(source)) => {
                    return Err(ProvisionError::Network {
                        url: url.to_string(),
                        source,
                    })
                }
                Err(_) => {
                    return Err(ProvisionError::Timeout {
                        url: url.to_string(),
                        secs: self.idle_timeout.as_secs(),
                    })
                }
            };

            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| ProvisionError::io("download", "Failed to write chunk to file", e))?;

            received += chunk.len() as u64;
            progress_cb(DownloadProgress { received, total });
        }

        file.flush()
            .await
            .map_err(|e| ProvisionError::io("download", "Failed to flush file", e))?;
        file.sync_all()
            .await
            .map_err(|e| ProvisionError::io("download", "Failed to sync file", e))?;
        drop(file);

        let actual = format_sha256_hex(&hasher.finalize());
        let expected = expected_sha256.to_lowercase();
        if actual != expected {
            return Err(ProvisionError::ChecksumMismatch {
                url: url.to_string(),
                expected,
                actual,
            });
        }
        debug!("SHA256 verified: {}", actual);

        tokio::fs::rename(&tmp, dest).await.map_err(|e| {
            ProvisionError::io(
                "download",
                format!("Failed to move download to {}", dest.display()),
                e,
            )
        })?;

        info!(
            "Download complete: {} bytes written to {}",
            received,
            dest.display()
        );

        Ok(DownloadOutcome {
            bytes: received,
            final_url,
            sha256: actual,
        })
    }

    /// Issues GETs until a non-redirect response arrives, then checks its status.
    async fn open(&self, url: &str) -> Result<Response> {
        let mut current = url.to_string();
        let mut hops = 0;

        loop {
            let response = self
                .client
                .get(&current)
                .send()
                .await
                .map_err(|source| ProvisionError::Network {
                    url: current.clone(),
                    source,
                })?;

            if let Some(next) = redirect_target(&current, &response) {
                if hops == self.max_redirects {
                    return Err(ProvisionError::TooManyRedirects {
                        url: url.to_string(),
                        limit: self.max_redirects,
                    });
                }
                hops += 1;
                debug!("Redirect {} -> {}", current, next);
                current = next;
                continue;
            }

            let status = response.status();
            if !status.is_success() {
                return Err(ProvisionError::HttpStatus {
                    url: current,
                    status: status.as_u16(),
                });
            }
            return Ok(response);
        }
    }
}

async fn discard(tmp: &Path) {
    match tokio::fs::remove_file(tmp).await {
        Ok(()) => debug!("Removed partial download {}", tmp.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial download {}: {}", tmp.display(), e),
    }
}

/// Formats a SHA256 hash as lowercase hex without using the hex crate.
pub(crate) fn format_sha256_hex(hash: &[u8]) -> String {
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}
