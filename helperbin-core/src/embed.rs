//! Build-time embedding of helper binaries.
//!
//! Resolves the manifest (remote fetch, or the previously persisted copy in
//! offline mode), then for every selected platform downloads each available
//! tool to `<out>/<platform>/<tool>`, verifies it and compresses it to
//! `<tool>.xz`. Any manifest, download or compression error aborts the run.

use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, Result};
use crate::provision::compressor;
use crate::provision::downloader::VerifiedDownloader;
use crate::provision::manifest::{Manifest, ManifestStore};
use crate::provision::mirror;
use crate::provision::paths::{embedded_manifest_path, embedded_tool_path};
use crate::provision::platform::PlatformKey;

/// Which platforms an embed run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformSelection {
    All,
    /// Falls back to the current platform when empty.
    Explicit(Vec<PlatformKey>),
    Current,
}

impl PlatformSelection {
    pub fn resolve(&self) -> Result<Vec<PlatformKey>> {
        match self {
            Self::All => Ok(PlatformKey::ALL.to_vec()),
            Self::Explicit(keys) if !keys.is_empty() => Ok(keys.clone()),
            Self::Explicit(_) | Self::Current => Ok(vec![PlatformKey::current()?]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbedOptions {
    pub out_dir: PathBuf,
    pub platforms: PlatformSelection,
    pub minimal: bool,
    /// Fetch a fresh manifest; `false` reuses `<out>/manifest.json`.
    pub update_manifest: bool,
    pub manifest_url: String,
    pub mirror_prefix: Option<String>,
    pub app_version: Option<String>,
}

impl EmbedOptions {
    pub fn new(out_dir: impl Into<PathBuf>, config: &ProvisionConfig) -> Self {
        Self {
            out_dir: out_dir.into(),
            platforms: PlatformSelection::Current,
            minimal: false,
            update_manifest: true,
            manifest_url: config.manifest_url.clone(),
            mirror_prefix: config.mirror_prefix.clone(),
            app_version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedArtifact {
    pub tool: String,
    pub platform: PlatformKey,
    pub path: PathBuf,
    /// Uncompressed size.
    pub bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct EmbedReport {
    pub embedded: Vec<EmbeddedArtifact>,
    /// `(tool, platform)` pairs the manifest has no file for.
    pub skipped: Vec<(String, PlatformKey)>,
}

/// Runs the embed pipeline.
pub async fn run_embed(options: &EmbedOptions, config: &ProvisionConfig) -> Result<EmbedReport> {
    let platforms = options.platforms.resolve()?;
    info!(
        "Embedding helpers for {}",
        platforms
            .iter()
            .map(PlatformKey::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    );

    let store = ManifestStore::new(embedded_manifest_path(&options.out_dir), config)?
        .minimal(options.minimal)
        .app_version(options.app_version.clone());

    let manifest = if options.update_manifest {
        store.fetch_remote(&options.manifest_url).await?
    } else {
        store.load_local(store.persist_path()).await?
    };

    let downloader =
        VerifiedDownloader::new(config)?.with_total_timeout(Some(config.per_url_timeout()));

    let mut report = EmbedReport::default();
    for platform in platforms {
        embed_platform(&manifest, platform, options, &downloader, &mut report).await?;
    }

    info!(
        embedded = report.embedded.len(),
        skipped = report.skipped.len(),
        "Embedding finished"
    );
    Ok(report)
}

async fn embed_platform(
    manifest: &Manifest,
    platform: PlatformKey,
    options: &EmbedOptions,
    downloader: &VerifiedDownloader,
    report: &mut EmbedReport,
) -> Result<()> {
    for (name, tool) in &manifest.tools {
        let Some(file) = tool.files.get(platform.as_str()) else {
            info!("{} has no build for {}, skipping", name, platform);
            report.skipped.push((name.clone(), platform));
            continue;
        };

        let url = mirror::resolve(&file.url, options.mirror_prefix.as_deref());
        let dest = embedded_tool_path(&options.out_dir, platform, name);
        info!("[{}] {} {} <- {}", platform, name, tool.version, url);

        let outcome = downloader.download(&url, &file.sha256, &dest).await?;
        let path = compressor::compress(&dest).await?;

        report.embedded.push(EmbeddedArtifact {
            tool: name.clone(),
            platform,
            path,
            bytes: outcome.bytes,
        });
    }
    Ok(())
}

/// Loads the embedded manifest, failing when it has not been generated yet.
pub fn check_embedded(out_dir: &Path) -> Result<Manifest> {
    let path = embedded_manifest_path(out_dir);
    let raw = std::fs::read(&path).map_err(|e| {
        ProvisionError::io(
            "manifest",
            format!("Embedded manifest missing at {}", path.display()),
            e,
        )
    })?;
    Manifest::parse(&raw)
}
