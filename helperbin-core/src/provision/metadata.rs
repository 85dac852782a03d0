//! Install metadata kept next to runtime binaries.
//!
//! Stored at `{bin}/metadata.json`. Records which manifest version of each
//! helper is installed; a tool is only considered present when its recorded
//! version matches the manifest and its binary exists.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use super::paths::with_suffix;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallMetadata {
    /// Installed version per tool.
    pub versions: BTreeMap<String, String>,
    /// When each tool was last installed.
    pub installed_at: BTreeMap<String, DateTime<Utc>>,
    /// Managed deployments ship their own helpers; nothing is downloaded.
    pub is_locked: bool,
}

impl InstallMetadata {
    /// Whether `tool` is recorded at exactly `version`.
    pub fn has_version(&self, tool: &str, version: &str) -> bool {
        self.versions.get(tool).is_some_and(|v| v == version)
    }

    pub fn record(&mut self, tool: &str, version: &str) {
        self.versions.insert(tool.to_string(), version.to_string());
        self.installed_at.insert(tool.to_string(), Utc::now());
    }

    pub fn forget(&mut self, tool: &str) {
        self.versions.remove(tool);
        self.installed_at.remove(tool);
    }

    /// Loads metadata, returning defaults when the file does not exist.
    ///
    /// A corrupted file is logged and treated as empty so every tool is
    /// re-verified on the next run.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No install metadata at {}", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read metadata from {}", path.display()))?;

        match serde_json::from_str(&content) {
            Ok(meta) => Ok(meta),
            Err(e) => {
                warn!(
                    "Failed to parse metadata at {}: {}. Starting fresh.",
                    path.display(),
                    e
                );
                Ok(Self::default())
            }
        }
    }

    /// Writes metadata through a sibling temp file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize install metadata")?;
        let tmp = with_suffix(path, ".tmp");
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write metadata to {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move metadata into {}", path.display()))?;

        debug!("Saved install metadata to {}", path.display());
        Ok(())
    }
}
