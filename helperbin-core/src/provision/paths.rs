//! Well-known locations for provisioned helpers.
//!
//! Runtime installs live under the per-user local data directory:
//!
//! - Linux: `~/.local/share/helperbin/bin/`
//! - macOS: `~/Library/Application Support/helperbin/bin/`
//! - Windows: `C:\Users\<User>\AppData\Local\helperbin\bin\`
//!
//! Build-time embedding writes into the host project's source tree instead.

use std::path::{Path, PathBuf};

use super::platform::PlatformKey;

/// Subdirectory name under the OS data/config folders.
const APP_DIR: &str = "helperbin";

/// Default build-time output directory, relative to the host project root.
pub const DEFAULT_EMBEDDED_DIR: &str = "src-tauri/src/embedded";

/// File name of the persisted tool manifest.
pub const MANIFEST_FILE: &str = "manifest.json";

/// File name of the install metadata kept next to runtime binaries.
pub const METADATA_FILE: &str = "metadata.json";

// ============================================================================
// Path Resolution
// ============================================================================

/// Returns the base data directory, falling back to the OS temp folder.
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

/// Returns the directory holding installed helper binaries.
///
/// Path: `{data}/helperbin/bin/`
pub fn get_bin_dir() -> PathBuf {
    get_data_dir().join("bin")
}

/// Returns the path to the config file.
///
/// Path: `{config}/helperbin/config.json`
pub fn get_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
        .join("config.json")
}

/// Returns the manifest path inside an embedded output directory.
pub fn embedded_manifest_path(out_dir: &Path) -> PathBuf {
    out_dir.join(MANIFEST_FILE)
}

/// Returns where a tool is staged for one platform during embedding.
///
/// Path: `{out}/{platform}/{tool}` (compressed later to `{tool}.xz`)
pub fn embedded_tool_path(out_dir: &Path, platform: PlatformKey, tool: &str) -> PathBuf {
    out_dir.join(platform.as_str()).join(tool)
}

/// Returns the canonical location of an installed helper for a platform.
///
/// - Windows: `{bin}/{tool}.exe`
/// - Others: `{bin}/{tool}`
pub fn canonical_binary_path(bin_dir: &Path, platform: PlatformKey, tool: &str) -> PathBuf {
    if platform.is_windows() {
        bin_dir.join(format!("{tool}.exe"))
    } else {
        bin_dir.join(tool)
    }
}

/// Appends a suffix to the full file name (`foo.tar.gz` + `.download`).
///
/// `Path::with_extension` would replace the last extension instead.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}
