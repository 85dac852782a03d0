//! Reference provisioning backend.
//!
//! [`Provisioner`] implements [`Orchestrator`] over a manifest, a bin
//! directory and an event sender. Each run classifies tools against the
//! install metadata, downloads what is missing or outdated through the
//! verified downloader (walking proxy candidates when asked to), installs
//! plain binaries or archive contents onto their canonical paths, and
//! reports every step on the event stream.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::ProvisionConfig;
use crate::error::ProvisionError;
use crate::events::{BinaryEvent, EventSender, ToolError, UpdateSummary};
use crate::orchestrator::{CheckResult, Orchestrator};
use crate::provision::downloader::{DownloadOutcome, VerifiedDownloader};
use crate::provision::extractor::{
    extract_archive, file_name_from_url, install_bundle, install_entry, make_executable,
    ArchiveFormat,
};
use crate::provision::manifest::{FileEntry, Manifest, ToolEntry};
use crate::provision::metadata::InstallMetadata;
use crate::provision::mirror::candidate_urls;
use crate::provision::paths::{canonical_binary_path, METADATA_FILE};
use crate::provision::platform::PlatformKey;

/// Scratch directory under the bin directory for in-flight installs.
const STAGING_DIR: &str = ".staging";

/// One row of the helper tools page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelperToolStatus {
    pub name: String,
    pub version: String,
    pub installed: bool,
}

/// Where to get a tool by hand and where to put it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualToolInfo {
    pub url: String,
    pub bin_dir: String,
}

struct ToolFailure {
    stage: &'static str,
    message: String,
}

impl ToolFailure {
    fn install(message: impl Into<String>) -> Self {
        Self {
            stage: "install",
            message: message.into(),
        }
    }
}

impl From<ProvisionError> for ToolFailure {
    fn from(err: ProvisionError) -> Self {
        Self {
            stage: err.stage(),
            message: err.to_string(),
        }
    }
}

/// An `ensure` request that arrived while a run was active.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingRun {
    /// `None` means every tool.
    tools: Option<Vec<String>>,
    use_proxy: bool,
}

impl PendingRun {
    fn merge(&mut self, tools: Option<Vec<String>>, use_proxy: bool) {
        self.use_proxy |= use_proxy;
        match (&mut self.tools, tools) {
            (Some(queued), Some(more)) => {
                for tool in more {
                    if !queued.contains(&tool) {
                        queued.push(tool);
                    }
                }
            }
            (slot, _) => *slot = None,
        }
    }
}

// ============================================================================
// Provisioner
// ============================================================================

#[derive(Clone)]
pub struct Provisioner {
    manifest: Arc<Manifest>,
    platform: PlatformKey,
    bin_dir: PathBuf,
    config: ProvisionConfig,
    downloader: VerifiedDownloader,
    events: EventSender,
    metadata: Arc<RwLock<InstallMetadata>>,
    running: Arc<AtomicBool>,
    pending: Arc<Mutex<Option<PendingRun>>>,
}

impl Provisioner {
    /// Creates a provisioner, loading install metadata from `bin_dir`.
    pub fn new(
        manifest: Manifest,
        bin_dir: impl Into<PathBuf>,
        config: ProvisionConfig,
        events: EventSender,
        platform: PlatformKey,
    ) -> Result<Self> {
        let bin_dir = bin_dir.into();
        let downloader = VerifiedDownloader::new(&config)?
            .with_total_timeout(Some(config.per_url_timeout()));
        let metadata = InstallMetadata::load(&bin_dir.join(METADATA_FILE))?;

        Ok(Self {
            manifest: Arc::new(manifest),
            platform,
            bin_dir,
            config,
            downloader,
            events,
            metadata: Arc::new(RwLock::new(metadata)),
            running: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(Mutex::new(None)),
        })
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    pub fn platform(&self) -> PlatformKey {
        self.platform
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn metadata_path(&self) -> PathBuf {
        self.bin_dir.join(METADATA_FILE)
    }

    fn canonical(&self, tool: &str) -> PathBuf {
        canonical_binary_path(&self.bin_dir, self.platform, tool)
    }

    // ------------------------------------------------------------------------
    // Classification
    // ------------------------------------------------------------------------

    async fn is_installed(&self, meta: &InstallMetadata, tool: &str, version: &str) -> bool {
        meta.has_version(tool, version)
            && tokio::fs::try_exists(self.canonical(tool))
                .await
                .unwrap_or(false)
    }

    async fn plan<'a>(
        &'a self,
        meta: &InstallMetadata,
        allow: Option<&[String]>,
    ) -> Vec<(&'a str, &'a ToolEntry, &'a FileEntry)> {
        let mut plan = Vec::new();
        for (name, tool, file) in self.manifest.tools_for(self.platform) {
            if allow.is_some_and(|allow| !allow.iter().any(|n| n == name)) {
                continue;
            }
            if !self.is_installed(meta, name, &tool.version).await {
                plan.push((name, tool, file));
            }
        }
        plan
    }

    /// Splits the platform's tools into those needing a download and all of them.
    pub async fn classify(&self) -> CheckResult {
        let meta = self.metadata.read().await.clone();
        if meta.is_locked {
            debug!("Install metadata is locked; nothing to classify");
            return CheckResult::default();
        }

        let all_tools = self
            .manifest
            .tools_for(self.platform)
            .into_iter()
            .map(|(name, _, _)| name.to_string())
            .collect();
        let tools = self
            .plan(&meta, None)
            .await
            .into_iter()
            .map(|(name, _, _)| name.to_string())
            .collect();

        CheckResult { tools, all_tools }
    }

    // ------------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------------

    fn try_start(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<PendingRun>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ends the active run. A queued request keeps the guard and starts next.
    fn release(&self) {
        let next = {
            let mut pending = self.lock_pending();
            let next = pending.take();
            if next.is_none() {
                self.finish();
            }
            next
        };

        if let Some(next) = next {
            info!("Starting queued provisioning run for {:?}", next.tools);
            self.spawn_run(next.tools, next.use_proxy);
        }
    }

    /// Runs on the tokio runtime while this provisioner holds the guard.
    fn spawn_run(&self, tools: Option<Vec<String>>, use_proxy: bool) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_exclusive(tools, use_proxy).await {
                warn!("Provisioning run failed: {:#}", e);
            }
            this.release();
        });
    }

    /// Performs a provisioning run inline and returns its summary.
    ///
    /// `tools` restricts the run; `None` means every tool. Returns `None`
    /// when another run is already active. Requests queued by `ensure`
    /// during this run start once it returns.
    pub async fn run(
        &self,
        tools: Option<Vec<String>>,
        use_proxy: bool,
    ) -> Result<Option<UpdateSummary>> {
        if !self.try_start() {
            info!("A provisioning run is already active; skipping");
            return Ok(None);
        }
        let result = self.run_exclusive(tools, use_proxy).await;
        self.release();
        result.map(Some)
    }

    async fn run_exclusive(
        &self,
        tools: Option<Vec<String>>,
        use_proxy: bool,
    ) -> Result<UpdateSummary> {
        if let Err(e) = tokio::fs::create_dir_all(&self.bin_dir).await {
            let e = anyhow!(e).context(format!("Failed to create {}", self.bin_dir.display()));
            self.emit(BinaryEvent::UpdateComplete(UpdateSummary {
                error: Some(format!("{e:#}")),
                ..Default::default()
            }));
            return Err(e);
        }

        let meta = self.metadata.read().await.clone();
        if meta.is_locked {
            info!("Install metadata is locked; skipping provisioning");
            let summary = UpdateSummary::default();
            self.emit(BinaryEvent::UpdateComplete(summary.clone()));
            return Ok(summary);
        }

        let plan = self.plan(&meta, tools.as_deref()).await;
        let mut summary = UpdateSummary::default();
        if let Some(requested) = &tools {
            self.settle_unplanned(requested, &plan, &mut summary);
        }
        if plan.is_empty() {
            info!("All requested helper tools are up to date");
            self.emit(BinaryEvent::UpdateComplete(summary.clone()));
            return Ok(summary);
        }

        for (name, tool, file) in plan {
            match self.install_tool(name, tool, file, use_proxy).await {
                Ok(()) => {
                    self.metadata.write().await.record(name, &tool.version);
                    summary.successes.push(name.to_string());
                }
                Err(failure) => summary.failures.push(failure),
            }
        }

        let saved = self.save_metadata().await;
        if let Err(e) = &saved {
            summary.error = Some(format!("{e:#}"));
        }

        info!(
            successes = summary.successes.len(),
            failures = summary.failures.len(),
            "Provisioning run finished"
        );
        self.emit(BinaryEvent::UpdateComplete(summary.clone()));
        saved.map(|_| summary)
    }

    /// Gives every requested tool outside the plan a terminal event.
    ///
    /// Up-to-date tools complete at once; names without a file for this
    /// platform fail at stage `manifest`.
    fn settle_unplanned(
        &self,
        requested: &[String],
        plan: &[(&str, &ToolEntry, &FileEntry)],
        summary: &mut UpdateSummary,
    ) {
        for name in requested {
            if plan.iter().any(|(planned, _, _)| *planned == name.as_str()) {
                continue;
            }
            match self.manifest.tools.get(name) {
                Some(tool) if tool.files.contains_key(self.platform.as_str()) => {
                    debug!("{} is already up to date", name);
                    self.emit(BinaryEvent::complete(name.as_str()));
                }
                tool => {
                    let version = tool.map(|t| t.version.as_str()).unwrap_or_default();
                    let failure = ToolFailure {
                        stage: "manifest",
                        message: format!("{name} is not available for {}", self.platform),
                    };
                    summary.failures.push(self.fail(name, version, failure));
                }
            }
        }
    }

    async fn save_metadata(&self) -> Result<()> {
        let snapshot = self.metadata.read().await.clone();
        snapshot.save(&self.metadata_path())
    }

    async fn install_tool(
        &self,
        name: &str,
        tool: &ToolEntry,
        file: &FileEntry,
        use_proxy: bool,
    ) -> Result<(), ToolError> {
        info!("Installing {} {}", name, tool.version);
        self.emit(BinaryEvent::start(name, &tool.version));

        let canonical = self.canonical(name);
        if let Err(failure) = self.stage_and_install(name, file, &canonical, use_proxy).await {
            return Err(self.fail(name, &tool.version, failure));
        }

        if !tokio::fs::try_exists(&canonical).await.unwrap_or(false) {
            let failure = ToolFailure::install(format!(
                "canonical binary missing after install: {}",
                canonical.display()
            ));
            return Err(self.fail(name, &tool.version, failure));
        }

        self.emit(BinaryEvent::complete(name));
        info!("{} {} installed at {}", name, tool.version, canonical.display());
        Ok(())
    }

    async fn stage_and_install(
        &self,
        name: &str,
        file: &FileEntry,
        canonical: &Path,
        use_proxy: bool,
    ) -> Result<(), ToolFailure> {
        let staging = self.bin_dir.join(STAGING_DIR).join(name);
        if tokio::fs::try_exists(&staging).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&staging)
                .await
                .map_err(|e| ToolFailure::install(format!("Failed to clear staging: {e}")))?;
        }
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| ToolFailure::install(format!("Failed to create staging: {e}")))?;

        let result = self.install_from(&staging, name, file, canonical, use_proxy).await;

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            debug!("Failed to clean up {}: {}", staging.display(), e);
        }
        result
    }

    async fn install_from(
        &self,
        staging: &Path,
        name: &str,
        file: &FileEntry,
        canonical: &Path,
        use_proxy: bool,
    ) -> Result<(), ToolFailure> {
        let file_name = match file_name_from_url(&file.url) {
            "" => name,
            other => other,
        };
        let download_path = staging.join(file_name);

        if let Err(err) = self.fetch_any(name, file, &download_path, use_proxy).await {
            return Err(ToolFailure {
                stage: err.stage(),
                message: format!(
                    "{err}. All download sources failed; download {} manually and place {} in {}",
                    file.url,
                    canonical
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| name.to_string()),
                    self.bin_dir.display()
                ),
            });
        }

        let format = ArchiveFormat::from_url(&file.url).ok_or_else(|| ToolFailure {
            stage: "extract",
            message: format!("unsupported archive type: {file_name}"),
        })?;

        if !format.requires_extraction() {
            tokio::fs::rename(&download_path, canonical)
                .await
                .map_err(|e| {
                    ToolFailure::install(format!(
                        "Failed to move {} to {}: {e}",
                        download_path.display(),
                        canonical.display()
                    ))
                })?;
            make_executable(canonical).map_err(|e| ToolFailure::install(format!("{e:#}")))?;
            return Ok(());
        }

        let extract_dir = staging.join("extracted");
        let bin_dir = self.bin_dir.clone();
        let canonical = canonical.to_path_buf();
        let entry = file.entry.clone();
        let bundle = file.bundle.clone();

        tokio::task::spawn_blocking(move || {
            extract_archive(&download_path, &extract_dir, format)?;
            match bundle {
                Some(bundle) => install_bundle(&extract_dir, &bundle, &bin_dir),
                None => install_entry(&extract_dir, entry.as_deref(), &canonical),
            }
        })
        .await
        .map_err(|e| ToolFailure {
            stage: "extract",
            message: format!("extraction task failed: {e}"),
        })??;

        Ok(())
    }

    /// Tries each candidate URL in order until one verifies.
    async fn fetch_any(
        &self,
        name: &str,
        file: &FileEntry,
        dest: &Path,
        use_proxy: bool,
    ) -> Result<DownloadOutcome, ProvisionError> {
        let mut urls = candidate_urls(
            &file.url,
            use_proxy,
            self.config.extra_proxy.as_deref(),
            &self.config.builtin_proxies,
        )
        .into_iter();

        let direct = urls.next().unwrap_or_else(|| file.url.clone());
        let mut result = self.fetch_from(name, &direct, &file.sha256, dest).await;
        for url in urls {
            let Err(e) = &result else { break };
            warn!("Download of {} failed ({}); trying {}", name, e, url);
            result = self.fetch_from(name, &url, &file.sha256, dest).await;
        }
        result
    }

    async fn fetch_from(
        &self,
        name: &str,
        url: &str,
        sha256: &str,
        dest: &Path,
    ) -> Result<DownloadOutcome, ProvisionError> {
        let events = self.events.clone();
        let tool = name.to_string();
        self.downloader
            .download_with_progress(url, sha256, dest, move |p| {
                let _ = events.send(BinaryEvent::progress(tool.as_str(), p.received, p.total));
            })
            .await
    }

    fn fail(&self, name: &str, version: &str, failure: ToolFailure) -> ToolError {
        warn!("{} failed at {}: {}", name, failure.stage, failure.message);
        let error = ToolError {
            tool: name.to_string(),
            version: version.to_string(),
            stage: failure.stage.to_string(),
            error: failure.message,
        };
        self.emit(BinaryEvent::Error(error.clone()));
        error
    }

    fn emit(&self, event: BinaryEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    // ------------------------------------------------------------------------
    // Management
    // ------------------------------------------------------------------------

    /// Every tool for the platform with its manifest version and install state.
    pub async fn list_with_status(&self) -> Vec<HelperToolStatus> {
        let meta = self.metadata.read().await.clone();
        let mut out = Vec::new();
        for (name, tool, _) in self.manifest.tools_for(self.platform) {
            out.push(HelperToolStatus {
                name: name.to_string(),
                version: tool.version.clone(),
                installed: self.is_installed(&meta, name, &tool.version).await,
            });
        }
        out
    }

    pub fn manual_info(&self, name: &str) -> Result<ManualToolInfo> {
        let file = self
            .manifest
            .tools
            .get(name)
            .ok_or_else(|| anyhow!("tool not found: {name}"))?
            .files
            .get(self.platform.as_str())
            .ok_or_else(|| anyhow!("{name} has no file for {}", self.platform))?;

        Ok(ManualToolInfo {
            url: file.url.clone(),
            bin_dir: self.bin_dir.to_string_lossy().to_string(),
        })
    }

    /// Forgets a tool and deletes its binary so the next run reinstalls it.
    pub async fn remove_tool(&self, name: &str) -> Result<()> {
        self.metadata.write().await.forget(name);
        self.save_metadata().await?;

        let canonical = self.canonical(name);
        match tokio::fs::remove_file(&canonical).await {
            Ok(()) => info!("Removed {}", canonical.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", canonical.display()))
            }
        }
        Ok(())
    }

    /// Clears every recorded version, then reinstalls everything through proxies.
    pub async fn redownload_all(&self) -> Result<Option<UpdateSummary>> {
        {
            let mut meta = self.metadata.write().await;
            meta.versions.clear();
            meta.installed_at.clear();
            meta.is_locked = false;
        }
        self.save_metadata().await?;
        self.run(None, true).await
    }
}

#[async_trait]
impl Orchestrator for Provisioner {
    async fn check(&self) -> Result<CheckResult> {
        tokio::fs::create_dir_all(&self.bin_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.bin_dir.display()))?;
        Ok(self.classify().await)
    }

    /// Spawns a run for `tools` (every tool when empty) and returns at once.
    ///
    /// While a run is active the request is queued, merged with any other
    /// queued request, and started when that run ends.
    async fn ensure(&self, tools: Vec<String>, use_proxy: bool) -> Result<()> {
        let allow = (!tools.is_empty()).then_some(tools);
        {
            let mut pending = self.lock_pending();
            if !self.try_start() {
                info!("A provisioning run is active; queueing {:?}", allow);
                match pending.as_mut() {
                    Some(queued) => queued.merge(allow, use_proxy),
                    None => {
                        *pending = Some(PendingRun {
                            tools: allow,
                            use_proxy,
                        })
                    }
                }
                return Ok(());
            }
        }

        self.spawn_run(allow, use_proxy);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .manifest
            .tools_for(self.platform)
            .into_iter()
            .map(|(name, _, _)| name.to_string())
            .collect())
    }
}
