use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use helperbin_core::provision::paths::MANIFEST_FILE;
use helperbin_core::provision::{get_bin_dir, read_app_version};
use helperbin_core::{
    check_embedded, event_channel, run_embed, BinaryEvent, EmbedOptions, Manifest, ManifestStore,
    PlatformKey, PlatformSelection, ProvisionConfig, Provisioner, ToolPhase, ToolStateStore,
    UpdateSummary,
};
use tracing::{debug, info, warn};

use crate::cli::{Cli, HelperCommand, RuntimeArgs};

pub async fn execute(cli: Cli) -> Result<()> {
    let config = ProvisionConfig::load().context("Failed to load configuration")?;
    debug!(?config, "Configuration loaded");

    match cli.command {
        HelperCommand::Embed {
            platforms,
            all,
            minimal,
            no_update_manifest,
            mirror,
            out_dir,
            manifest_url,
            package_json,
            app_version,
        } => {
            let mut options = EmbedOptions::new(out_dir, &config);
            options.platforms = if all {
                PlatformSelection::All
            } else {
                PlatformSelection::Explicit(platforms)
            };
            options.minimal = minimal;
            options.update_manifest = !no_update_manifest;
            if let Some(url) = manifest_url {
                options.manifest_url = url;
            }
            if mirror.is_some() {
                options.mirror_prefix = mirror;
            }
            options.app_version =
                app_version.or_else(|| package_json.as_deref().and_then(read_app_version));
            execute_embed(&options, &config).await
        }
        HelperCommand::CheckEmbedded { out_dir } => execute_check_embedded(&out_dir),
        HelperCommand::Install { tools, proxy, runtime } => {
            execute_install(&runtime, config, tools, proxy).await
        }
        HelperCommand::List { runtime } => execute_list(&runtime, config).await,
        HelperCommand::Status { runtime } => execute_status(&runtime, config).await,
        HelperCommand::Remove { tool, runtime } => execute_remove(&runtime, config, &tool).await,
        HelperCommand::Redownload { runtime } => execute_redownload(&runtime, config).await,
    }
}

pub async fn execute_embed(options: &EmbedOptions, config: &ProvisionConfig) -> Result<()> {
    let report = run_embed(options, config).await?;

    for artifact in &report.embedded {
        println!(
            "{} [{}]: {} bytes -> {}",
            artifact.tool,
            artifact.platform,
            artifact.bytes,
            artifact.path.display()
        );
    }
    for (tool, platform) in &report.skipped {
        println!("{} [{}]: no build, skipped", tool, platform);
    }
    Ok(())
}

pub fn execute_check_embedded(out_dir: &Path) -> Result<()> {
    let manifest = check_embedded(out_dir)?;
    println!(
        "Embedded manifest OK (appVersion={}): {}",
        manifest.app_version.as_deref().unwrap_or("unknown"),
        manifest.tool_names().join(", ")
    );
    Ok(())
}

pub async fn execute_install(
    runtime: &RuntimeArgs,
    config: ProvisionConfig,
    tools: Vec<String>,
    use_proxy: bool,
) -> Result<()> {
    let (provisioner, mut rx) = open_provisioner(runtime, config).await?;
    let mut store = ToolStateStore::new(provisioner);
    let needed = store.check().await?;
    info!("Helpers needing a download: {:?}", needed);

    let requested = (!tools.is_empty()).then_some(tools);
    let dispatched = store.ensure(requested, use_proxy).await?;
    if dispatched.is_empty() {
        print_tools(&store);
        println!("Nothing to install");
        return Ok(());
    }

    let summary = loop {
        let Some(event) = rx.recv().await else {
            bail!("Provisioning stopped before reporting a result");
        };
        log_event(&event);
        let done = match &event {
            BinaryEvent::UpdateComplete(summary) => Some(summary.clone()),
            _ => None,
        };
        store.apply(event);
        if let Some(summary) = done {
            break summary;
        }
    };

    print_tools(&store);
    report_summary(&summary)
}

pub async fn execute_list(runtime: &RuntimeArgs, config: ProvisionConfig) -> Result<()> {
    let (provisioner, _rx) = open_provisioner(runtime, config).await?;
    let statuses = provisioner.list_with_status().await;

    if statuses.is_empty() {
        println!("No helpers for {}", provisioner.platform());
        return Ok(());
    }
    for status in statuses {
        let state = if status.installed { "installed" } else { "not installed" };
        println!("{}: {} ({})", status.name, status.version, state);
    }
    Ok(())
}

pub async fn execute_status(runtime: &RuntimeArgs, config: ProvisionConfig) -> Result<()> {
    let (provisioner, _rx) = open_provisioner(runtime, config).await?;
    let mut store = ToolStateStore::new(provisioner.clone());
    store.check().await?;

    if store.is_all_complete() {
        println!("All helpers are installed in {}", provisioner.bin_dir().display());
        return Ok(());
    }
    for (name, progress) in store.tools() {
        if !progress.needs_download() {
            println!("{}: ok", name);
            continue;
        }
        match provisioner.manual_info(name) {
            Ok(manual) => println!(
                "{}: missing, download {} into {}",
                name, manual.url, manual.bin_dir
            ),
            Err(e) => println!("{}: missing ({:#})", name, e),
        }
    }
    Ok(())
}

pub async fn execute_remove(
    runtime: &RuntimeArgs,
    config: ProvisionConfig,
    tool: &str,
) -> Result<()> {
    let (provisioner, _rx) = open_provisioner(runtime, config).await?;
    if !provisioner.manifest().tools.contains_key(tool) {
        bail!("Unknown helper: {}", tool);
    }
    provisioner.remove_tool(tool).await?;
    println!("Removed {}", tool);
    Ok(())
}

pub async fn execute_redownload(runtime: &RuntimeArgs, config: ProvisionConfig) -> Result<()> {
    let (provisioner, mut rx) = open_provisioner(runtime, config).await?;
    let mut store = ToolStateStore::new(provisioner.clone());
    store.fetch_and_merge_tool_list().await?;

    let summary = provisioner.redownload_all().await?;
    store.drain(&mut rx);
    print_tools(&store);

    match summary {
        Some(summary) => report_summary(&summary),
        None => bail!("Another provisioning run is already active"),
    }
}

/// Resolves the manifest and bin directory, then builds a provisioner for this host.
async fn open_provisioner(
    runtime: &RuntimeArgs,
    config: ProvisionConfig,
) -> Result<(Provisioner, helperbin_core::EventReceiver)> {
    let bin_dir = runtime.bin_dir.clone().unwrap_or_else(get_bin_dir);
    let manifest = load_manifest(runtime.manifest.as_deref(), &bin_dir, &config).await?;
    let platform = PlatformKey::current()?;

    let (tx, rx) = event_channel();
    let provisioner = Provisioner::new(manifest, bin_dir, config, tx, platform)?;
    Ok((provisioner, rx))
}

async fn load_manifest(
    local: Option<&Path>,
    bin_dir: &Path,
    config: &ProvisionConfig,
) -> Result<Manifest> {
    let persist: PathBuf = bin_dir.join(MANIFEST_FILE);
    let store = ManifestStore::new(persist, config)?;
    let manifest = match local {
        Some(path) => store.load_local(path).await?,
        None => store.fetch_remote(&config.manifest_url).await?,
    };
    Ok(manifest)
}

fn print_tools(store: &ToolStateStore<Provisioner>) {
    for (name, progress) in store.tools() {
        match &progress.phase {
            ToolPhase::Complete => println!("{}: installed", name),
            ToolPhase::Errored { message } => println!("{}: {}", name, message),
            ToolPhase::Downloading { .. } | ToolPhase::Idle => {
                println!("{}: {}%", name, progress.percent)
            }
        }
    }
}

fn log_event(event: &BinaryEvent) {
    match event {
        BinaryEvent::Start(start) => info!("{} {}: starting", start.tool, start.version),
        BinaryEvent::Progress(p) => debug!("{}: {}/{} bytes", p.tool, p.received, p.total),
        BinaryEvent::Complete(c) => info!("{}: complete", c.tool),
        BinaryEvent::Error(e) => warn!("{}: {}", e.tool, e.display_message()),
        BinaryEvent::UpdateComplete(_) => {}
    }
}

fn report_summary(summary: &UpdateSummary) -> Result<()> {
    if let Some(error) = &summary.error {
        bail!("Provisioning finished with an error: {}", error);
    }
    if !summary.failures.is_empty() {
        let failed: Vec<String> = summary
            .failures
            .iter()
            .map(|f| format!("{} {}", f.tool, f.display_message()))
            .collect();
        bail!("{} helper(s) failed:\n  {}", failed.len(), failed.join("\n  "));
    }
    if summary.successes.is_empty() {
        println!("Nothing to install");
    } else {
        println!("Installed: {}", summary.successes.join(", "));
    }
    Ok(())
}
