//! Tool manifest schema, fetching and persistence.
//!
//! The manifest maps every helper tool to a version and, per platform key,
//! the URL and SHA-256 of the file to download:
//!
//! ```json
//! { "appVersion": "1.2.3", "generatedAt": "2025-01-01T00:00:00Z",
//!   "tools": { "yt-dlp": { "version": "2025.01.01",
//!       "files": { "linux-x86_64": { "url": "...", "sha256": "..." } } } } }
//! ```
//!
//! A fetched or loaded manifest is always persisted to the store's
//! well-known path so that later offline runs pin the same versions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::downloader::{build_client, redirect_target};
use super::paths::with_suffix;
use super::platform::PlatformKey;
use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, Result};

/// Tools kept by minimal mode.
pub const MINIMAL_TOOLS: &[&str] = &["yt-dlp", "ffmpeg", "ffprobe", "AtomicParsley"];

// ============================================================================
// Manifest Data Structures
// ============================================================================

/// Root of the manifest file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Host application version this tool set is pinned to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    pub generated_at: String,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolEntry>,
}

/// One tool's version and its per-platform files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEntry {
    pub version: String,
    /// Keyed by platform key text; unknown keys are kept but never selected.
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,
}

/// A downloadable file for one (tool, platform) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub url: String,
    pub sha256: String,
    /// Path of the binary inside an archive download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<BundleInfo>,
}

/// Describes an archive whose folder must be installed as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleInfo {
    #[serde(default)]
    pub keep_folder: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_name: Option<String>,
    pub entry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rename_entry_to: Option<String>,
}

impl Manifest {
    /// Parses and validates manifest JSON.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|e| ProvisionError::ManifestParse(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Checks that every declared hash is a 64-character hex digest.
    pub fn validate(&self) -> Result<()> {
        for (tool, entry) in &self.tools {
            for (platform, file) in &entry.files {
                let ok = file.sha256.len() == 64
                    && file.sha256.chars().all(|c| c.is_ascii_hexdigit());
                if !ok {
                    return Err(ProvisionError::ManifestParse(format!(
                        "invalid sha256 for {tool} ({platform}): {:?}",
                        file.sha256
                    )));
                }
            }
        }
        Ok(())
    }

    /// Returns the file for a tool on a platform, if the tool ships one there.
    pub fn file_for(&self, tool: &str, platform: PlatformKey) -> Option<&FileEntry> {
        self.tools.get(tool)?.files.get(platform.as_str())
    }

    /// Lists `(name, tool, file)` for every tool available on `platform`.
    pub fn tools_for(&self, platform: PlatformKey) -> Vec<(&str, &ToolEntry, &FileEntry)> {
        self.tools
            .iter()
            .filter_map(|(name, tool)| {
                tool.files
                    .get(platform.as_str())
                    .map(|file| (name.as_str(), tool, file))
            })
            .collect()
    }

    /// Drops every tool not on the minimal allow-list.
    pub fn retain_minimal(&mut self) {
        self.tools
            .retain(|name, _| MINIMAL_TOOLS.contains(&name.as_str()));
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ProvisionError::ManifestParse(e.to_string()))
    }
}

/// Reads the host application's version from a `package.json`-style file.
///
/// Returns `None` when the file is missing, unreadable, or has no `version`.
pub fn read_app_version(path: &Path) -> Option<String> {
    let raw = std::fs::read(path).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    value
        .get("version")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

// ============================================================================
// Manifest Store
// ============================================================================

/// Fetches, loads and persists the tool manifest.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    client: reqwest::Client,
    persist_path: PathBuf,
    max_redirects: usize,
    minimal: bool,
    app_version: Option<String>,
}

impl ManifestStore {
    /// Creates a store persisting to `persist_path`.
    pub fn new(persist_path: impl Into<PathBuf>, config: &ProvisionConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.connect_timeout())?,
            persist_path: persist_path.into(),
            max_redirects: config.max_redirects,
            minimal: false,
            app_version: None,
        })
    }

    /// Restricts returned and persisted manifests to [`MINIMAL_TOOLS`].
    pub fn minimal(mut self, minimal: bool) -> Self {
        self.minimal = minimal;
        self
    }

    /// Host application version stamped onto remotely fetched manifests.
    pub fn app_version(mut self, app_version: Option<String>) -> Self {
        self.app_version = app_version;
        self
    }

    pub fn persist_path(&self) -> &Path {
        &self.persist_path
    }

    /// Fetches the manifest over HTTP, following redirects by hand.
    pub async fn fetch_remote(&self, url: &str) -> Result<Manifest> {
        info!("Fetching manifest from {}", url);

        let fetch_err = |reason: String| ProvisionError::ManifestFetch {
            url: url.to_string(),
            reason,
        };

        let mut current = url.to_string();
        for _ in 0..=self.max_redirects {
            let response = self
                .client
                .get(&current)
                .send()
                .await
                .map_err(|e| fetch_err(e.to_string()))?;

            if let Some(next) = redirect_target(&current, &response) {
                debug!("Manifest redirected {} -> {}", current, next);
                current = next;
                continue;
            }

            let status = response.status();
            if !status.is_success() {
                return Err(fetch_err(format!("HTTP {}", status.as_u16())));
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| fetch_err(e.to_string()))?;
            let mut manifest = Manifest::parse(&body)?;

            if let Some(version) = &self.app_version {
                manifest.app_version = Some(version.clone());
            }

            return self.finish(manifest).await;
        }

        Err(fetch_err(format!(
            "more than {} redirects",
            self.max_redirects
        )))
    }

    /// Loads a previously persisted manifest for offline use.
    ///
    /// The manifest must carry `appVersion`; without it the helper versions
    /// cannot be matched to the host application.
    pub async fn load_local(&self, path: &Path) -> Result<Manifest> {
        let raw = tokio::fs::read(path).await.map_err(|e| {
            warn!("Local manifest {} is not readable: {}", path.display(), e);
            ProvisionError::ManifestFetch {
                url: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        let manifest = Manifest::parse(&raw)?;
        let Some(app_version) = manifest.app_version.as_deref() else {
            return Err(ProvisionError::LocalManifestMissingAppVersion {
                path: path.to_path_buf(),
            });
        };

        info!(
            "Using local manifest (appVersion={}), tools: {}",
            app_version,
            manifest.tool_names().join(", ")
        );
        self.finish(manifest).await
    }

    async fn finish(&self, mut manifest: Manifest) -> Result<Manifest> {
        if self.minimal {
            manifest.retain_minimal();
            info!("Minimal mode: only {}", manifest.tool_names().join(", "));
        }
        self.persist(&manifest).await?;
        Ok(manifest)
    }

    /// Writes the manifest to the well-known path via a sibling temp file.
    async fn persist(&self, manifest: &Manifest) -> Result<()> {
        let path = &self.persist_path;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ProvisionError::io("manifest", format!("Failed to create {}", parent.display()), e)
            })?;
        }

        let tmp = with_suffix(path, ".tmp");
        tokio::fs::write(&tmp, manifest.to_json_pretty()?)
            .await
            .map_err(|e| {
                ProvisionError::io("manifest", format!("Failed to write {}", tmp.display()), e)
            })?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| {
                ProvisionError::io("manifest", format!("Failed to replace {}", path.display()), e)
            })?;

        info!("Wrote {}", path.display());
        Ok(())
    }
}
