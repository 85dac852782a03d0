//! XZ compression of staged helper binaries.
//!
//! `compress` is a two-phase commit: the encoder writes `<file>.xz.part`,
//! which is renamed to `<file>.xz` once finished and synced, and only then is
//! the original removed. A failure at any point leaves the original in place
//! and no partial output behind.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use super::paths::with_suffix;
use crate::error::{ProvisionError, Result};

/// Maximum-ratio preset; build-time embedding trades CPU for size.
pub const XZ_PRESET: u32 = 9;

const XZ_SUFFIX: &str = ".xz";
const PART_SUFFIX: &str = ".xz.part";

/// Compresses `path` to `path.xz` on the blocking pool and removes the original.
pub async fn compress(path: &Path) -> Result<PathBuf> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || compress_blocking(&owned))
        .await
        .map_err(|e| ProvisionError::Compression {
            path: path.to_path_buf(),
            reason: format!("compression task failed: {e}"),
        })?
}

/// Synchronous body of [`compress`].
pub fn compress_blocking(path: &Path) -> Result<PathBuf> {
    let xz_path = with_suffix(path, XZ_SUFFIX);
    let part_path = with_suffix(path, PART_SUFFIX);

    let written = match encode(path, &part_path) {
        Ok(n) => n,
        Err(e) => {
            discard(&part_path);
            return Err(ProvisionError::Compression {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        }
    };

    if let Err(e) = fs::rename(&part_path, &xz_path) {
        discard(&part_path);
        return Err(ProvisionError::Compression {
            path: path.to_path_buf(),
            reason: format!("rename to {} failed: {e}", xz_path.display()),
        });
    }

    fs::remove_file(path).map_err(|e| {
        ProvisionError::io(
            "compress",
            format!("Failed to remove original {}", path.display()),
            e,
        )
    })?;

    info!(
        "Compressed {} ({} bytes) -> {}",
        path.display(),
        written,
        xz_path.display()
    );
    Ok(xz_path)
}

/// Restores an `.xz` artifact to `dest`, returning the decompressed size.
pub async fn decompress(xz_path: &Path, dest: &Path) -> Result<u64> {
    let src = xz_path.to_path_buf();
    let out = dest.to_path_buf();
    tokio::task::spawn_blocking(move || decompress_blocking(&src, &out))
        .await
        .map_err(|e| ProvisionError::Compression {
            path: xz_path.to_path_buf(),
            reason: format!("decompression task failed: {e}"),
        })?
}

pub fn decompress_blocking(xz_path: &Path, dest: &Path) -> Result<u64> {
    let part_path = with_suffix(dest, ".part");
    let result = (|| -> io::Result<u64> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut decoder = XzDecoder::new(BufReader::new(File::open(xz_path)?));
        let mut out = BufWriter::new(File::create(&part_path)?);
        let n = io::copy(&mut decoder, &mut out)?;
        out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        fs::rename(&part_path, dest)?;
        Ok(n)
    })();

    result.map_err(|e| {
        discard(&part_path);
        ProvisionError::Compression {
            path: xz_path.to_path_buf(),
            reason: e.to_string(),
        }
    })
}

fn encode(src: &Path, part_path: &Path) -> io::Result<u64> {
    let mut input = BufReader::new(File::open(src)?);
    let output = BufWriter::new(File::create(part_path)?);

    let mut encoder = XzEncoder::new(output, XZ_PRESET);
    let n = io::copy(&mut input, &mut encoder)?;
    let mut output = encoder.finish()?;
    output.flush()?;
    output.into_inner().map_err(|e| e.into_error())?.sync_all()?;

    debug!("Encoded {} bytes into {}", n, part_path.display());
    Ok(n)
}

fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {}: {}", path.display(), e),
    }
}
