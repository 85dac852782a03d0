//! Provisioning configuration.
//!
//! Settings are persisted as JSON under the user config directory and can be
//! overridden from the environment for CI and mirror setups.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::provision::paths;

/// Upstream manifest published alongside the helper builds.
pub const DEFAULT_MANIFEST_URL: &str =
    "https://jely2002.github.io/youtube-dl-gui/manifest/manifest.json";

/// Environment variable holding a mirror prefix for build-time downloads.
pub const MIRROR_ENV: &str = "EMBEDDED_MIRROR";

/// Environment variable holding an extra runtime proxy, tried before the built-in ones.
pub const PROXY_ENV: &str = "BINARIES_GH_PROXY";

/// Proxies tried (in order) when a runtime install opts into proxying.
pub const BUILTIN_GH_PROXIES: &[&str] = &[
    "https://gh-proxy.org",
    "https://hk.gh-proxy.org",
    "https://cdn.gh-proxy.org",
    "https://edgeone.gh-proxy.org",
];

// =============================================================================
// Provision Config
// =============================================================================

/// Provisioning settings - persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Where the tool manifest is fetched from.
    pub manifest_url: String,

    /// Prefix replacing `https://github.com/` for build-time downloads.
    pub mirror_prefix: Option<String>,

    /// Extra proxy tried first when runtime installs use proxies.
    pub extra_proxy: Option<String>,

    /// Built-in proxy list for runtime installs.
    pub builtin_proxies: Vec<String>,

    /// Maximum number of redirects followed per request.
    pub max_redirects: usize,

    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Abort a transfer when no bytes arrive for this many seconds.
    pub idle_timeout_secs: u64,

    /// Deadline for a single candidate URL during runtime installs.
    pub per_url_timeout_secs: u64,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            manifest_url: DEFAULT_MANIFEST_URL.to_string(),
            mirror_prefix: None,
            extra_proxy: None,
            builtin_proxies: BUILTIN_GH_PROXIES.iter().map(|p| p.to_string()).collect(),
            max_redirects: 10,
            connect_timeout_secs: 30,
            idle_timeout_secs: 60,
            per_url_timeout_secs: 600,
        }
    }
}

impl ProvisionConfig {
    /// Loads the config from the default location, then applies environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&paths::get_config_path())?;
        config.apply_env();
        Ok(config)
    }

    /// Loads the config from a specific path.
    ///
    /// A missing file yields defaults. A corrupted file is logged and replaced
    /// by defaults rather than aborting provisioning.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        match serde_json::from_str::<Self>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(
                    "Failed to parse config at {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Ok(Self::default())
            }
        }
    }

    /// Saves the config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// Applies `EMBEDDED_MIRROR` and `BINARIES_GH_PROXY` when set and non-empty.
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var(MIRROR_ENV).ok(),
            std::env::var(PROXY_ENV).ok(),
        );
    }

    fn apply_overrides(&mut self, mirror: Option<String>, proxy: Option<String>) {
        if let Some(mirror) = non_empty(mirror) {
            self.mirror_prefix = Some(mirror);
        }
        if let Some(proxy) = non_empty(proxy) {
            self.extra_proxy = Some(proxy);
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn per_url_timeout(&self) -> Duration {
        Duration::from_secs(self.per_url_timeout_secs)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ProvisionConfig::default();
        assert_eq!(config.manifest_url, DEFAULT_MANIFEST_URL);
        assert_eq!(config.max_redirects, 10);
        assert_eq!(config.builtin_proxies.len(), 4);
        assert!(config.mirror_prefix.is_none());
    }

    #[test]
    fn test_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.json");

        let mut config = ProvisionConfig::default();
        config.mirror_prefix = Some("https://mirror.example/".to_string());
        config.idle_timeout_secs = 5;
        config.save_to(&path).unwrap();

        let loaded = ProvisionConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, r#"{ "max_redirects": 3 }"#).unwrap();

        let loaded = ProvisionConfig::load_from(&path).unwrap();
        assert_eq!(loaded.max_redirects, 3);
        assert_eq!(loaded.manifest_url, DEFAULT_MANIFEST_URL);
    }

    #[test]
    fn test_corrupted_file_returns_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, "not json {{").unwrap();

        let loaded = ProvisionConfig::load_from(&path).unwrap();
        assert_eq!(loaded, ProvisionConfig::default());
    }

    #[test]
    fn test_overrides_ignore_blank_values() {
        let mut config = ProvisionConfig::default();
        config.apply_overrides(Some("  ".to_string()), None);
        assert!(config.mirror_prefix.is_none());

        config.apply_overrides(
            Some(" https://ghproxy.com/https://github.com/ ".to_string()),
            Some("https://proxy.example".to_string()),
        );
        assert_eq!(
            config.mirror_prefix.as_deref(),
            Some("https://ghproxy.com/https://github.com/")
        );
        assert_eq!(config.extra_proxy.as_deref(), Some("https://proxy.example"));
    }
}
