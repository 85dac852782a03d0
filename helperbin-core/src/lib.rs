//! Helperbin Core Library
//!
//! Provisions the external helper binaries a host application depends on
//! (a video/audio extractor, a media transcoder and related utilities)
//! without bundling them at full size. It includes:
//!
//! - Manifest resolution with per-platform URLs and SHA-256 hashes
//! - Verified streaming downloads with mirror and proxy support
//! - XZ compression for build-time embedding
//! - A reference orchestrator for runtime installs
//! - A client-side state store reconciling lifecycle events into progress

pub mod config;
pub mod embed;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod provision;
pub mod provisioner;
pub mod state;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use config::ProvisionConfig;
pub use error::{ProvisionError, Result};

// Re-export events
pub use events::{event_channel, BinaryEvent, EventReceiver, EventSender, ToolError, UpdateSummary};

// Re-export orchestration
pub use orchestrator::{CheckResult, Orchestrator};
pub use provisioner::{HelperToolStatus, ManualToolInfo, Provisioner};
pub use state::{ToolPhase, ToolProgress, ToolStateStore};

// Re-export build-time embedding
pub use embed::{check_embedded, run_embed, EmbedOptions, EmbedReport, PlatformSelection};

pub use provision::{Manifest, ManifestStore, PlatformKey, VerifiedDownloader};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
