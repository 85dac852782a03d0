use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use helperbin_core::provision::paths::DEFAULT_EMBEDDED_DIR;
use helperbin_core::PlatformKey;

#[derive(Debug, Parser, Clone)]
#[clap(author, version, about = "Provision verified helper binaries", long_about = None)]
pub struct Cli {
    /// Raise log verbosity (-v debug, -vv trace)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub(crate) command: HelperCommand,
}

#[derive(Debug, Subcommand, Clone, PartialEq)]
pub enum HelperCommand {
    /// Download, verify and compress helpers into the embedded output directory.
    /// Defaults to the current platform
    Embed {
        /// Platform keys to embed, e.g. `linux-x86_64`
        platforms: Vec<PlatformKey>,
        /// Embed every known platform
        #[clap(long, conflicts_with = "platforms")]
        all: bool,
        /// Only yt-dlp, ffmpeg, ffprobe and AtomicParsley
        #[clap(long)]
        minimal: bool,
        /// Reuse `<out-dir>/manifest.json` instead of fetching it. It must carry `appVersion`
        #[clap(long)]
        no_update_manifest: bool,
        /// Prefix prepended to every download URL
        #[clap(long, env = "EMBEDDED_MIRROR")]
        mirror: Option<String>,
        #[clap(long, default_value = DEFAULT_EMBEDDED_DIR)]
        out_dir: PathBuf,
        /// Overrides the configured manifest URL
        #[clap(long)]
        manifest_url: Option<String>,
        /// package.json to read the host application version from
        #[clap(long, conflicts_with = "app_version")]
        package_json: Option<PathBuf>,
        #[clap(long)]
        app_version: Option<String>,
    },
    /// Fail unless the embedded manifest exists
    CheckEmbedded {
        #[clap(long, default_value = DEFAULT_EMBEDDED_DIR)]
        out_dir: PathBuf,
    },
    /// Install missing or outdated helpers. Defaults to all
    Install {
        tools: Vec<String>,
        /// Walk the download proxies before the direct URL
        #[clap(long)]
        proxy: bool,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// List helpers for this platform with their install state
    List {
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Show which helpers need a download and where to get them by hand
    Status {
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Delete one helper so the next install fetches it again
    Remove {
        tool: String,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Forget every installed version and reinstall through the proxies
    Redownload {
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
}

/// Options shared by the runtime subcommands.
#[derive(Debug, Args, Clone, PartialEq)]
pub struct RuntimeArgs {
    /// Where helpers are installed. Defaults to the user data directory
    #[clap(long)]
    pub bin_dir: Option<PathBuf>,
    /// Local manifest to use instead of fetching one. It must carry `appVersion`
    #[clap(long)]
    pub manifest: Option<PathBuf>,
}
