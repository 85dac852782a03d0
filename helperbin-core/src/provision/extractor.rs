//! Archive extraction and installation of downloaded helpers.
//!
//! Manifest files either point at a plain executable, at an archive with a
//! single `entry` binary inside, or at an archive whose whole folder is a
//! `bundle` (an executable plus the libraries next to it). Everything here is
//! synchronous; callers run it on the blocking pool.

use anyhow::{bail, Context};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use super::manifest::BundleInfo;
use crate::error::{ProvisionError, Result};

// ============================================================================
// Archive Format
// ============================================================================

/// How a downloaded file is turned into an installed binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// The download is the executable itself.
    Binary,
    Zip,
    TarGz,
    TarXz,
    /// `.tar.bz2`, `.tbz2`, and bare `.bz2` releases, which are tarballs too.
    TarBz2,
}

impl ArchiveFormat {
    /// Infers the format from the last URL path segment.
    ///
    /// Returns `None` for archive types that are recognised but cannot be
    /// unpacked here (`.7z`, `.rar`, plain `.tar`).
    pub fn from_url(url: &str) -> Option<Self> {
        let name = file_name_from_url(url).to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Some(Self::TarXz)
        } else if name.ends_with(".bz2") || name.ends_with(".tbz2") {
            Some(Self::TarBz2)
        } else if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if [".7z", ".tar", ".rar"]
            .iter()
            .any(|ext| name.ends_with(ext))
        {
            None
        } else {
            Some(Self::Binary)
        }
    }

    pub fn requires_extraction(&self) -> bool {
        !matches!(self, Self::Binary)
    }
}

/// Last path segment of a URL, ignoring query and fragment.
pub fn file_name_from_url(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

// ============================================================================
// Archive Extraction
// ============================================================================

/// Extracts an archive into `dest_dir`, skipping entries that would escape it.
pub fn extract_archive(archive_path: &Path, dest_dir: &Path, format: ArchiveFormat) -> Result<()> {
    info!(
        "Extracting {:?} archive {} to {}",
        format,
        archive_path.display(),
        dest_dir.display()
    );

    let result = fs::create_dir_all(dest_dir)
        .with_context(|| format!("Failed to create directory: {}", dest_dir.display()))
        .and_then(|_| match format {
            ArchiveFormat::Zip => extract_zip(archive_path, dest_dir),
            ArchiveFormat::TarGz => {
                let file = open(archive_path)?;
                extract_tar(flate2::read::GzDecoder::new(file), dest_dir)
            }
            ArchiveFormat::TarXz => {
                let file = open(archive_path)?;
                extract_tar(xz2::read::XzDecoder::new(file), dest_dir)
            }
            ArchiveFormat::TarBz2 => {
                let file = open(archive_path)?;
                extract_tar(bzip2::read::BzDecoder::new(file), dest_dir)
            }
            ArchiveFormat::Binary => bail!("a plain binary is not an extractable archive"),
        });

    result.map_err(|e| extraction_error(archive_path, e))
}

fn open(path: &Path) -> anyhow::Result<BufReader<File>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open archive: {}", path.display()))?;
    Ok(BufReader::new(file))
}

fn extract_zip(archive_path: &Path, dest_dir: &Path) -> anyhow::Result<()> {
    let mut archive = zip::ZipArchive::new(open(archive_path)?)
        .with_context(|| format!("Failed to read zip: {}", archive_path.display()))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(entry_path) = entry.enclosed_name() else {
            debug!("Skipping unsafe path in zip");
            continue;
        };
        let dest_path = dest_dir.join(entry_path);

        if entry.is_dir() {
            fs::create_dir_all(&dest_path)?;
            continue;
        }
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&dest_path)
            .with_context(|| format!("Failed to create: {}", dest_path.display()))?;
        io::copy(&mut entry, &mut outfile)?;

        #[cfg(unix)]
        set_unix_permissions(&dest_path, entry.unix_mode())?;
    }

    debug!("ZIP extraction complete");
    Ok(())
}

fn extract_tar<R: Read>(reader: R, dest_dir: &Path) -> anyhow::Result<()> {
    let mut archive = tar::Archive::new(reader);

    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        let entry_type = entry.header().entry_type();

        if entry_type.is_symlink() || entry_type.is_hard_link() {
            warn!("Skipping link entry in tar archive");
            continue;
        }

        let path = entry.path()?.into_owned();
        if !is_safe_relative(&path) {
            warn!("Skipping unsafe path in tar: {:?}", path);
            continue;
        }
        let dest_path = dest_dir.join(&path);

        if entry_type.is_dir() {
            fs::create_dir_all(&dest_path)?;
        } else if entry_type.is_file() {
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&dest_path)
                .with_context(|| format!("Failed to create: {}", dest_path.display()))?;
            io::copy(&mut entry, &mut outfile)?;
            outfile.flush()?;

            #[cfg(unix)]
            {
                if let Ok(mode) = entry.header().mode() {
                    set_unix_permissions(&dest_path, Some(mode))?;
                }
            }
        }
    }

    debug!("TAR extraction complete");
    Ok(())
}

/// Relative, with no `..`, root or prefix components.
fn is_safe_relative(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

// ============================================================================
// Installation
// ============================================================================

/// Moves the binary for a tool out of an extraction directory onto `canonical`.
///
/// With `entry` set the binary is taken from that relative path; otherwise
/// the extraction tree is searched for a file named like `canonical`.
pub fn install_entry(extract_dir: &Path, entry: Option<&str>, canonical: &Path) -> Result<PathBuf> {
    let found = match entry {
        Some(rel) => {
            let rel = Path::new(rel);
            if !is_safe_relative(rel) {
                return Err(extraction_error(
                    extract_dir,
                    anyhow::anyhow!("entry {} is not a relative path", rel.display()),
                ));
            }
            let candidate = extract_dir.join(rel);
            candidate.is_file().then_some(candidate)
        }
        None => canonical
            .file_name()
            .and_then(|name| find_file_recursive(extract_dir, name.to_string_lossy().as_ref())),
    };

    let Some(source) = found else {
        let wanted = match entry {
            Some(rel) => rel.to_string(),
            None => canonical.display().to_string(),
        };
        return Err(extraction_error(
            extract_dir,
            anyhow::anyhow!("{wanted} not found in archive"),
        ));
    };

    place_file(&source, canonical)
        .and_then(|_| make_executable(canonical))
        .map_err(|e| extraction_error(extract_dir, e))?;

    debug!("Installed {} -> {}", source.display(), canonical.display());
    Ok(canonical.to_path_buf())
}

/// Hoists a bundle folder's contents into `bin_dir`.
///
/// The folder is `folder_name` inside the extraction directory when given,
/// otherwise the single top-level directory (or the extraction directory
/// itself). `rename_entry_to` renames the entry binary before hoisting.
/// Returns the installed entry path.
///
/// `keep_folder` is carried in the manifest for hosts that ship the folder
/// intact; installation always hoists the contents.
pub fn install_bundle(extract_dir: &Path, bundle: &BundleInfo, bin_dir: &Path) -> Result<PathBuf> {
    install_bundle_inner(extract_dir, bundle, bin_dir).map_err(|e| extraction_error(extract_dir, e))
}

fn install_bundle_inner(
    extract_dir: &Path,
    bundle: &BundleInfo,
    bin_dir: &Path,
) -> anyhow::Result<PathBuf> {
    let root = bundle_root(extract_dir, bundle.folder_name.as_deref())?;

    let entry_rel = Path::new(&bundle.entry);
    if !is_safe_relative(entry_rel) {
        bail!("bundle entry {} is not a relative path", entry_rel.display());
    }
    let mut entry_path = root.join(entry_rel);
    if !entry_path.is_file() {
        bail!("bundle entry {} not found", bundle.entry);
    }

    if let Some(new_name) = bundle.rename_entry_to.as_deref() {
        let renamed = entry_path.with_file_name(new_name);
        fs::rename(&entry_path, &renamed)
            .with_context(|| format!("Failed to rename bundle entry to {new_name}"))?;
        entry_path = renamed;
    }
    let entry_in_root = entry_path
        .strip_prefix(&root)
        .context("bundle entry outside its folder")?
        .to_path_buf();

    hoist_contents(&root, bin_dir)?;

    let installed = bin_dir.join(entry_in_root);
    make_executable(&installed)?;
    info!("Installed bundle entry {}", installed.display());
    Ok(installed)
}

fn bundle_root(extract_dir: &Path, folder_name: Option<&str>) -> anyhow::Result<PathBuf> {
    if let Some(name) = folder_name {
        let root = extract_dir.join(name);
        if !root.is_dir() {
            bail!("bundle folder {name} not found in archive");
        }
        return Ok(root);
    }

    let entries: Vec<PathBuf> = fs::read_dir(extract_dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    match entries.as_slice() {
        [only] if only.is_dir() => Ok(only.clone()),
        _ => Ok(extract_dir.to_path_buf()),
    }
}

/// Moves every child of `from` into `to`, replacing what is already there.
fn hoist_contents(from: &Path, to: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let source = entry?.path();
        let Some(name) = source.file_name() else {
            continue;
        };
        let dest = to.join(name);
        if dest.is_dir() {
            fs::remove_dir_all(&dest)?;
        } else if dest.exists() {
            fs::remove_file(&dest)?;
        }
        fs::rename(&source, &dest).with_context(|| {
            format!("Failed to move {} to {}", source.display(), dest.display())
        })?;
    }
    Ok(())
}

fn place_file(source: &Path, dest: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(source, dest)
        .with_context(|| format!("Failed to move {} to {}", source.display(), dest.display()))
}

fn find_file_recursive(dir: &Path, name: &str) -> Option<PathBuf> {
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().and_then(|s| s.to_str()) == Some(name) {
                return Some(path);
            }
        }
    }
    None
}

fn extraction_error(path: &Path, e: anyhow::Error) -> ProvisionError {
    ProvisionError::Extraction {
        path: path.to_path_buf(),
        reason: format!("{e:#}"),
    }
}

// ============================================================================
// Unix Permissions
// ============================================================================

#[cfg(unix)]
fn set_unix_permissions(path: &Path, mode: Option<u32>) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = mode {
        if mode & 0o111 != 0 {
            fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o755))
                .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
        }
    }
    Ok(())
}

/// Adds the executable bits on Unix; a no-op elsewhere.
#[allow(unused_variables)]
pub fn make_executable(path: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mut permissions = fs::metadata(path)
            .with_context(|| format!("Failed to get metadata for {}", path.display()))?
            .permissions();
        if permissions.mode() & 0o111 == 0 {
            permissions.set_mode(permissions.mode() | 0o755);
            fs::set_permissions(path, permissions).with_context(|| {
                format!("Failed to set executable permission on {}", path.display())
            })?;
            debug!("Set executable permission on {}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, data) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn append(builder: &mut tar::Builder<impl Write>, name: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_path(name).unwrap();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append(&header, data).unwrap();
    }

    #[test]
    fn test_format_from_url() {
        assert_eq!(
            ArchiveFormat::from_url("https://github.com/a/b/releases/download/v1/yt-dlp"),
            Some(ArchiveFormat::Binary)
        );
        assert_eq!(
            ArchiveFormat::from_url("https://x/ffmpeg-master-latest-win64-gpl.zip"),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(
            ArchiveFormat::from_url("https://x/ffmpeg.tar.xz?raw=1"),
            Some(ArchiveFormat::TarXz)
        );
        assert_eq!(ArchiveFormat::from_url("https://x/f.tgz"), Some(ArchiveFormat::TarGz));
        assert_eq!(
            ArchiveFormat::from_url("https://x/AtomicParsley.tar.bz2"),
            Some(ArchiveFormat::TarBz2)
        );
        assert_eq!(ArchiveFormat::from_url("https://x/f.tbz2"), Some(ArchiveFormat::TarBz2));
        assert_eq!(ArchiveFormat::from_url("https://x/f.7z"), None);
        assert_eq!(
            ArchiveFormat::from_url("https://x/yt-dlp.exe"),
            Some(ArchiveFormat::Binary)
        );
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(file_name_from_url("https://x/a/b/tool.zip?x=1#f"), "tool.zip");
        assert_eq!(file_name_from_url("tool"), "tool");
    }

    #[test]
    fn test_install_entry_from_zip() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("ffmpeg.zip");
        write_zip(
            &archive,
            &[
                ("ffmpeg-7.1/bin/ffmpeg", b"ffmpeg-bin"),
                ("ffmpeg-7.1/README", b"readme"),
            ],
        );

        let staging = temp.path().join("staging");
        extract_archive(&archive, &staging, ArchiveFormat::Zip).unwrap();

        let canonical = temp.path().join("bin").join("ffmpeg");
        install_entry(&staging, Some("ffmpeg-7.1/bin/ffmpeg"), &canonical).unwrap();
        assert_eq!(fs::read(&canonical).unwrap(), b"ffmpeg-bin");
    }

    #[test]
    fn test_install_entry_searches_by_name() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("probe.tar.gz");
        {
            let file = File::create(&archive).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            append(&mut builder, "dist/deep/ffprobe", b"probe-bin");
            builder.into_inner().unwrap().finish().unwrap();
        }

        let staging = temp.path().join("staging");
        extract_archive(&archive, &staging, ArchiveFormat::TarGz).unwrap();
        let canonical = temp.path().join("bin").join("ffprobe");
        install_entry(&staging, None, &canonical).unwrap();

        assert_eq!(fs::read(&canonical).unwrap(), b"probe-bin");
    }

    #[test]
    fn test_install_entry_missing_is_extract_error() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("staging");
        fs::create_dir_all(&staging).unwrap();

        let err = install_entry(&staging, Some("bin/nothing"), &temp.path().join("tool"))
            .unwrap_err();
        assert_eq!(err.stage(), "extract");

        let err = install_entry(&staging, Some("../escape"), &temp.path().join("tool"))
            .unwrap_err();
        assert_eq!(err.stage(), "extract");
    }

    #[test]
    fn test_install_bundle_hoists_and_renames() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("ap.tar.xz");
        {
            let file = File::create(&archive).unwrap();
            let encoder = xz2::write::XzEncoder::new(file, 6);
            let mut builder = tar::Builder::new(encoder);
            append(&mut builder, "AtomicParsley-1.0/AtomicParsley-bin", b"ap-bin");
            append(&mut builder, "AtomicParsley-1.0/lib/libap.so", b"lib");
            builder.into_inner().unwrap().finish().unwrap();
        }

        let staging = temp.path().join("staging");
        extract_archive(&archive, &staging, ArchiveFormat::TarXz).unwrap();

        let bin = temp.path().join("bin");
        fs::create_dir_all(bin.join("lib")).unwrap();
        fs::write(bin.join("lib").join("stale.so"), b"old").unwrap();

        let bundle = BundleInfo {
            keep_folder: false,
            folder_name: Some("AtomicParsley-1.0".to_string()),
            entry: "AtomicParsley-bin".to_string(),
            rename_entry_to: Some("AtomicParsley".to_string()),
        };
        let installed = install_bundle(&staging, &bundle, &bin).unwrap();

        assert_eq!(installed, bin.join("AtomicParsley"));
        assert_eq!(fs::read(bin.join("AtomicParsley")).unwrap(), b"ap-bin");
        assert!(bin.join("lib").join("libap.so").exists());
        assert!(!bin.join("lib").join("stale.so").exists());
    }

    fn write_tar_bz2(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in files {
            append(&mut builder, name, data);
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_install_entry_from_tar_bz2() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("ffprobe.tar.bz2");
        write_tar_bz2(&archive, &[("ffprobe-7.1/ffprobe", b"probe-bz2")]);

        let staging = temp.path().join("staging");
        extract_archive(&archive, &staging, ArchiveFormat::TarBz2).unwrap();
        let canonical = temp.path().join("bin").join("ffprobe");
        install_entry(&staging, Some("ffprobe-7.1/ffprobe"), &canonical).unwrap();

        assert_eq!(fs::read(&canonical).unwrap(), b"probe-bz2");
    }

    #[test]
    fn test_install_bundle_from_tar_bz2() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("AtomicParsley.bz2");
        write_tar_bz2(
            &archive,
            &[
                ("AtomicParsleyLinux/AtomicParsley", b"ap-bz2"),
                ("AtomicParsleyLinux/libs/libz.so", b"z"),
            ],
        );
        let format = ArchiveFormat::from_url("https://x/AtomicParsley.bz2").unwrap();

        let staging = temp.path().join("staging");
        extract_archive(&archive, &staging, format).unwrap();
        let bundle = BundleInfo {
            keep_folder: false,
            folder_name: Some("AtomicParsleyLinux".to_string()),
            entry: "AtomicParsley".to_string(),
            rename_entry_to: None,
        };
        let bin = temp.path().join("bin");
        let installed = install_bundle(&staging, &bundle, &bin).unwrap();

        assert_eq!(installed, bin.join("AtomicParsley"));
        assert_eq!(fs::read(&installed).unwrap(), b"ap-bz2");
        assert!(bin.join("libs").join("libz.so").exists());
    }

    #[test]
    fn test_corrupt_tar_bz2_is_extract_error() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("broken.tar.bz2");
        fs::write(&archive, b"not bzip2 at all").unwrap();

        let err = extract_archive(&archive, &temp.path().join("staging"), ArchiveFormat::TarBz2)
            .unwrap_err();
        assert_eq!(err.stage(), "extract");
    }

    #[test]
    fn test_install_bundle_detects_single_top_folder() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("staging");
        fs::create_dir_all(staging.join("pkg")).unwrap();
        fs::write(staging.join("pkg").join("tool"), b"t").unwrap();

        let bundle = BundleInfo {
            keep_folder: true,
            folder_name: None,
            entry: "tool".to_string(),
            rename_entry_to: None,
        };
        let bin = temp.path().join("bin");
        install_bundle(&staging, &bundle, &bin).unwrap();
        assert!(bin.join("tool").exists());
    }

    #[test]
    fn test_tar_link_entries_skipped() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("malicious.tar.gz");
        let escape_target = temp.path().join("escaped_file.txt");
        {
            let file = File::create(&archive).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            builder
                .append_link(&mut header, "escape_link", "../escaped_file.txt")
                .unwrap();
            append(&mut builder, "escape_link", b"payload");
            builder.into_inner().unwrap().finish().unwrap();
        }

        let staging = temp.path().join("staging");
        extract_archive(&archive, &staging, ArchiveFormat::TarGz).unwrap();
        assert!(!escape_target.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_make_executable() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("yt-dlp");
        fs::write(&path, b"#!/bin/sh").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        make_executable(&path).unwrap();
        assert_ne!(fs::metadata(&path).unwrap().permissions().mode() & 0o111, 0);
    }
}
