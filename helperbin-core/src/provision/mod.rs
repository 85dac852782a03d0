//! Binary provisioning building blocks.
//!
//! # Architecture
//!
//! - `platform`: (OS, arch) to platform key resolution
//! - `paths`: Data, bin and embedded output locations
//! - `manifest`: Manifest schema, remote fetch, offline load and persistence
//! - `mirror`: Mirror prefix rewriting and proxy candidate URLs
//! - `downloader`: Redirect-following, hash-verified streaming downloads
//! - `compressor`: Two-phase XZ compression of staged artifacts
//! - `extractor`: Archive extraction and entry/bundle installation
//! - `metadata`: Installed-version bookkeeping for runtime installs

pub mod compressor;
pub mod downloader;
pub mod extractor;
pub mod manifest;
pub mod metadata;
pub mod mirror;
pub mod paths;
pub mod platform;

// Re-export commonly used types
pub use compressor::{compress, decompress};
pub use downloader::{DownloadOutcome, DownloadProgress, VerifiedDownloader};
pub use extractor::ArchiveFormat;
pub use manifest::{
    read_app_version, BundleInfo, FileEntry, Manifest, ManifestStore, ToolEntry, MINIMAL_TOOLS,
};
pub use metadata::InstallMetadata;
pub use mirror::candidate_urls;
pub use paths::{canonical_binary_path, get_bin_dir, get_data_dir, DEFAULT_EMBEDDED_DIR};
pub use platform::PlatformKey;
