//! Canonical platform keys.
//!
//! Manifest files are keyed by `<os>-<arch>` strings. This module maps the
//! many spellings of an (OS, architecture) pair onto the six keys the
//! manifest uses.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProvisionError;

// ============================================================================
// Platform Keys
// ============================================================================

/// A supported (OS, architecture) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PlatformKey {
    #[serde(rename = "windows-x86_64")]
    WindowsX86_64,
    #[serde(rename = "windows-aarch64")]
    WindowsAarch64,
    #[serde(rename = "linux-x86_64")]
    LinuxX86_64,
    #[serde(rename = "linux-aarch64")]
    LinuxAarch64,
    #[serde(rename = "darwin-x86_64")]
    DarwinX86_64,
    #[serde(rename = "darwin-aarch64")]
    DarwinAarch64,
}

impl PlatformKey {
    /// Every supported key, in manifest order.
    pub const ALL: [PlatformKey; 6] = [
        Self::WindowsX86_64,
        Self::WindowsAarch64,
        Self::LinuxX86_64,
        Self::LinuxAarch64,
        Self::DarwinX86_64,
        Self::DarwinAarch64,
    ];

    /// Returns the manifest key string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WindowsX86_64 => "windows-x86_64",
            Self::WindowsAarch64 => "windows-aarch64",
            Self::LinuxX86_64 => "linux-x86_64",
            Self::LinuxAarch64 => "linux-aarch64",
            Self::DarwinX86_64 => "darwin-x86_64",
            Self::DarwinAarch64 => "darwin-aarch64",
        }
    }

    /// Maps a raw OS name and CPU architecture to a key.
    ///
    /// Accepts both Rust (`macos`, `x86_64`, `aarch64`) and Node-style
    /// (`darwin`, `win32`, `x64`, `arm64`) spellings.
    pub fn resolve(os: &str, arch: &str) -> Result<Self, ProvisionError> {
        let unsupported = || ProvisionError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        };

        let os_family = match os.to_ascii_lowercase().as_str() {
            "windows" | "win32" => "windows",
            "linux" => "linux",
            "macos" | "darwin" => "darwin",
            _ => return Err(unsupported()),
        };

        let is_arm = match arch.to_ascii_lowercase().as_str() {
            "x86_64" | "x64" | "amd64" => false,
            "aarch64" | "arm64" | "arm" => true,
            _ => return Err(unsupported()),
        };

        Ok(match (os_family, is_arm) {
            ("windows", false) => Self::WindowsX86_64,
            ("windows", true) => Self::WindowsAarch64,
            ("linux", false) => Self::LinuxX86_64,
            ("linux", true) => Self::LinuxAarch64,
            ("darwin", false) => Self::DarwinX86_64,
            _ => Self::DarwinAarch64,
        })
    }

    /// Resolves the platform this process is running on.
    pub fn current() -> Result<Self, ProvisionError> {
        Self::resolve(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Returns true for Windows keys, where binaries carry an `.exe` suffix.
    pub fn is_windows(&self) -> bool {
        matches!(self, Self::WindowsX86_64 | Self::WindowsAarch64)
    }
}

impl fmt::Display for PlatformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlatformKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|k| k.as_str()).collect();
                format!("Unknown platform key: {} (expected one of {})", s, known.join(", "))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_supported_pairs() {
        assert_eq!(
            PlatformKey::resolve("windows", "x86_64").unwrap(),
            PlatformKey::WindowsX86_64
        );
        assert_eq!(
            PlatformKey::resolve("win32", "arm64").unwrap(),
            PlatformKey::WindowsAarch64
        );
        assert_eq!(
            PlatformKey::resolve("linux", "x64").unwrap(),
            PlatformKey::LinuxX86_64
        );
        assert_eq!(
            PlatformKey::resolve("linux", "aarch64").unwrap(),
            PlatformKey::LinuxAarch64
        );
        assert_eq!(
            PlatformKey::resolve("macos", "x86_64").unwrap(),
            PlatformKey::DarwinX86_64
        );
        assert_eq!(
            PlatformKey::resolve("darwin", "arm64").unwrap(),
            PlatformKey::DarwinAarch64
        );
    }

    #[test]
    fn test_arm_aliases_normalize() {
        let a = PlatformKey::resolve("linux", "arm64").unwrap();
        let b = PlatformKey::resolve("linux", "aarch64").unwrap();
        let c = PlatformKey::resolve("linux", "arm").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_unsupported_carries_raw_values() {
        match PlatformKey::resolve("freebsd", "x86_64") {
            Err(ProvisionError::UnsupportedPlatform { os, arch }) => {
                assert_eq!(os, "freebsd");
                assert_eq!(arch, "x86_64");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(PlatformKey::resolve("linux", "riscv64").is_err());
        assert!(PlatformKey::resolve("linux", "x86").is_err());
    }

    #[test]
    fn test_from_str_round_trips_display() {
        for key in PlatformKey::ALL {
            assert_eq!(key.to_string().parse::<PlatformKey>().unwrap(), key);
        }
        assert!("linux-riscv64".parse::<PlatformKey>().is_err());
    }

    #[test]
    fn test_serde_uses_manifest_key() {
        let json = serde_json::to_string(&PlatformKey::DarwinAarch64).unwrap();
        assert_eq!(json, "\"darwin-aarch64\"");
    }

    #[test]
    fn test_current_on_supported_hosts() {
        let current = PlatformKey::current();
        #[cfg(any(
            all(target_os = "linux", target_arch = "x86_64"),
            all(target_os = "linux", target_arch = "aarch64"),
            all(target_os = "macos", target_arch = "x86_64"),
            all(target_os = "macos", target_arch = "aarch64"),
            all(target_os = "windows", target_arch = "x86_64"),
            all(target_os = "windows", target_arch = "aarch64"),
        ))]
        assert!(current.is_ok());
        let _ = current;
    }
}
