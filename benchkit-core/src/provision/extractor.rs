//! Format-sniffing archive extraction with layout normalization.
//!
//! The format is detected from file content, not the extension, because
//! mislabeled downloads occur. Extraction tries the sniffed format first,
//! then every other in-process extractor, then a system tool as a last
//! resort; it fails only when all methods fail.

use anyhow::{bail, Context};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

use super::types::ArchiveFormat;
use crate::error::{ProvisionError, Result};

/// Bytes needed to recognize every supported format (tar's magic sits at
/// offset 257).
const SNIFF_LEN: usize = 512;

// ============================================================================
// Format Detection
// ============================================================================

/// Detects the archive format from leading file content. Pure function,
/// independent of I/O.
pub fn detect_archive_format(bytes: &[u8]) -> Option<ArchiveFormat> {
    if bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(b"PK\x05\x06") {
        return Some(ArchiveFormat::Zip);
    }
    if bytes.starts_with(&[0x1f, 0x8b]) {
        return Some(ArchiveFormat::TarGz);
    }
    if bytes.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
        return Some(ArchiveFormat::TarXz);
    }
    if bytes.len() > 262 && &bytes[257..262] == b"ustar" {
        return Some(ArchiveFormat::Tar);
    }
    None
}

fn sniff_file(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        let read = file.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    buf.truncate(filled);
    Ok(buf)
}

// ============================================================================
// Extraction
// ============================================================================

/// Extracts `archive_path` into `dest_dir`, creating it if needed.
///
/// Returns the format that succeeded. `ArchiveError` only when every
/// method, including the system fallback, has failed.
pub fn extract(archive_path: &Path, dest_dir: &Path) -> Result<ArchiveFormat> {
    let head = sniff_file(archive_path)?;
    let sniffed = detect_archive_format(&head);
    info!(
        "Extracting {} (detected: {:?}) to {}",
        archive_path.display(),
        sniffed,
        dest_dir.display()
    );

    let mut candidates = Vec::new();
    if let Some(format) = sniffed {
        candidates.push(format);
    }
    for format in [
        ArchiveFormat::Zip,
        ArchiveFormat::TarGz,
        ArchiveFormat::TarXz,
        ArchiveFormat::Tar,
    ] {
        if !candidates.contains(&format) {
            candidates.push(format);
        }
    }

    let mut last_error = None;
    for format in candidates {
        reset_dir(dest_dir)?;
        match extract_as(archive_path, dest_dir, format) {
            Ok(()) => {
                debug!("Extraction succeeded as {}", format);
                return Ok(format);
            }
            Err(e) => {
                debug!("Extraction as {} failed: {:#}", format, e);
                last_error = Some(e);
            }
        }
    }

    // Last resort: a system extraction tool may cope with variants the
    // in-process extractors reject.
    reset_dir(dest_dir)?;
    if extract_with_system_tool(archive_path, dest_dir) {
        info!("System tool extracted {}", archive_path.display());
        return Ok(sniffed.unwrap_or(ArchiveFormat::Tar));
    }

    Err(ProvisionError::Archive(format!(
        "all extraction methods failed for {}: {}",
        archive_path.display(),
        last_error
            .map(|e| format!("{:#}", e))
            .unwrap_or_else(|| "no extractor accepted the file".to_string())
    )))
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

fn extract_as(archive_path: &Path, dest_dir: &Path, format: ArchiveFormat) -> anyhow::Result<()> {
    match format {
        ArchiveFormat::Zip => extract_zip(archive_path, dest_dir),
        ArchiveFormat::TarGz => {
            let file = open_buffered(archive_path)?;
            extract_tar(flate2::read::GzDecoder::new(file), dest_dir)
        }
        ArchiveFormat::TarXz => {
            let file = open_buffered(archive_path)?;
            extract_tar(xz2::read::XzDecoder::new(file), dest_dir)
        }
        ArchiveFormat::Tar => {
            let file = open_buffered(archive_path)?;
            extract_tar(file, dest_dir)
        }
    }
}

fn open_buffered(path: &Path) -> anyhow::Result<BufReader<File>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open archive: {}", path.display()))?;
    Ok(BufReader::new(file))
}

fn extract_zip(archive_path: &Path, dest_dir: &Path) -> anyhow::Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open zip: {}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Failed to read zip: {}", archive_path.display()))?;

    if archive.len() == 0 {
        bail!("zip archive contains no entries");
    }

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => path.to_owned(),
            None => {
                warn!("Skipping unsafe path in zip entry {}", i);
                continue;
            }
        };
        let dest_path = dest_dir.join(&entry_path);

        if entry.is_dir() {
            fs::create_dir_all(&dest_path)?;
        } else {
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&dest_path)
                .with_context(|| format!("Failed to create: {}", dest_path.display()))?;
            io::copy(&mut entry, &mut outfile)?;

            #[cfg(unix)]
            propagate_unix_mode(&dest_path, entry.unix_mode())?;
        }
    }
    Ok(())
}

fn extract_tar<R: Read>(reader: R, dest_dir: &Path) -> anyhow::Result<()> {
    let mut archive = tar::Archive::new(reader);
    let dest_canonical = dest_dir
        .canonicalize()
        .unwrap_or_else(|_| dest_dir.to_path_buf());
    let mut entry_count = 0usize;

    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        let entry_type = entry.header().entry_type();

        // Links can point outside the destination; skip them wholesale.
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            warn!("Skipping link entry in tar archive");
            continue;
        }

        let raw_path = entry.path()?.into_owned();
        let dest_path = match sanitized_entry_path(&raw_path, dest_dir, &dest_canonical)? {
            Some(path) => path,
            None => {
                warn!("Skipping unsafe path in tar: {:?}", raw_path);
                continue;
            }
        };

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
            propagate_unix_mode(&dest_path, entry.header().mode().ok())?;
        }
        entry_count += 1;
    }

    if entry_count == 0 {
        bail!("tar archive contains no entries");
    }
    Ok(())
}

/// Resolves a tar entry path inside `dest_dir`, or `None` when the entry
/// would escape it.
fn sanitized_entry_path(
    raw: &Path,
    dest_dir: &Path,
    dest_canonical: &Path,
) -> anyhow::Result<Option<PathBuf>> {
    if raw.is_absolute() || raw.components().any(|c| c == Component::ParentDir) {
        return Ok(None);
    }

    let dest_path = dest_dir.join(raw);
    let resolved = if dest_path.exists() {
        dest_path.canonicalize()?
    } else if let Some(parent) = dest_path.parent() {
        fs::create_dir_all(parent)?;
        parent
            .canonicalize()?
            .join(dest_path.file_name().unwrap_or_default())
    } else {
        dest_path.clone()
    };

    if resolved.starts_with(dest_canonical) {
        Ok(Some(dest_path))
    } else {
        Ok(None)
    }
}

fn extract_with_system_tool(archive_path: &Path, dest_dir: &Path) -> bool {
    let attempts: [(&str, Vec<&std::ffi::OsStr>); 2] = [
        (
            "tar",
            vec![
                "-xf".as_ref(),
                archive_path.as_os_str(),
                "-C".as_ref(),
                dest_dir.as_os_str(),
            ],
        ),
        (
            "unzip",
            vec![
                "-o".as_ref(),
                archive_path.as_os_str(),
                "-d".as_ref(),
                dest_dir.as_os_str(),
            ],
        ),
    ];

    for (program, args) in attempts {
        match Command::new(program).args(&args).output() {
            Ok(output) if output.status.success() => return true,
            Ok(output) => debug!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ),
            Err(e) => debug!("{} not usable: {}", program, e),
        }
    }
    false
}

#[cfg(unix)]
fn propagate_unix_mode(path: &Path, mode: Option<u32>) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = mode {
        if mode & 0o111 != 0 {
            fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o755))
                .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
        }
    }
    Ok(())
}

// ============================================================================
// Layout Normalization
// ============================================================================

/// If `dir` contains exactly one entry and it is a directory, hoists that
/// directory's contents into `dir`. Returns whether a collapse happened.
///
/// Release archives commonly nest everything under a versioned top-level
/// folder (`jdk-17.0.12+7/...`); the canonical install layout does not.
pub fn collapse_nested_dir(dir: &Path) -> Result<bool> {
    let entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();

    let [nested] = entries.as_slice() else {
        return Ok(false);
    };
    if !nested.is_dir() {
        return Ok(false);
    }

    // Rename first so a child may share the nested directory's name.
    let staging = dir.join(".collapse-tmp");
    fs::rename(nested, &staging)?;
    for entry in fs::read_dir(&staging)? {
        let entry = entry?;
        fs::rename(entry.path(), dir.join(entry.file_name()))?;
    }
    fs::remove_dir(&staging)?;
    debug!("Collapsed nested directory inside {}", dir.display());
    Ok(true)
}

/// Sets the executable bit on a file (no-op on Windows).
#[allow(unused_variables)]
pub fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(permissions.mode() | 0o755);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn test_detect_format_by_magic() {
        assert_eq!(
            detect_archive_format(b"PK\x03\x04rest"),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(
            detect_archive_format(&[0x1f, 0x8b, 0x08]),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            detect_archive_format(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00, 0x00]),
            Some(ArchiveFormat::TarXz)
        );
        assert_eq!(detect_archive_format(b"#!/bin/sh\n"), None);
        assert_eq!(detect_archive_format(&[]), None);
    }

    #[test]
    fn test_detect_plain_tar() {
        let mut bytes = vec![0u8; 512];
        bytes[257..262].copy_from_slice(b"ustar");
        assert_eq!(detect_archive_format(&bytes), Some(ArchiveFormat::Tar));
    }

    #[test]
    fn test_extract_zip() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("tool.zip");
        let dest = temp.path().join("out");
        write_zip(
            &archive,
            &[
                ("readme.txt", b"hello"),
                ("bin/tool", b"#!/bin/sh\necho tool"),
            ],
        );

        let format = extract(&archive, &dest).unwrap();
        assert_eq!(format, ArchiveFormat::Zip);
        assert_eq!(fs::read_to_string(dest.join("readme.txt")).unwrap(), "hello");
        assert!(dest.join("bin/tool").exists());
    }

    #[test]
    fn test_extract_tar_gz() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("tool.tar.gz");
        let dest = temp.path().join("out");
        write_tar_gz(&archive, &[("greetings.txt", b"from tar.gz")]);

        let format = extract(&archive, &dest).unwrap();
        assert_eq!(format, ArchiveFormat::TarGz);
        assert_eq!(
            fs::read_to_string(dest.join("greetings.txt")).unwrap(),
            "from tar.gz"
        );
    }

    #[test]
    fn test_extract_mislabeled_archive() {
        // A zip saved with a .tar.gz name still extracts: detection is by
        // content, not extension.
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("mislabeled.tar.gz");
        let dest = temp.path().join("out");
        write_zip(&archive, &[("inner.txt", b"surprise")]);

        let format = extract(&archive, &dest).unwrap();
        assert_eq!(format, ArchiveFormat::Zip);
        assert!(dest.join("inner.txt").exists());
    }

    #[test]
    fn test_extract_garbage_fails() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("garbage.zip");
        let dest = temp.path().join("out");
        fs::write(&archive, b"this is not an archive at all").unwrap();

        let result = extract(&archive, &dest);
        assert!(matches!(result, Err(ProvisionError::Archive(_))));
    }

    #[test]
    fn test_sanitized_entry_path_rejects_escapes() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        let canonical = dest.canonicalize().unwrap();

        assert!(
            sanitized_entry_path(Path::new("../escaped.txt"), &dest, &canonical)
                .unwrap()
                .is_none()
        );
        assert!(
            sanitized_entry_path(Path::new("/etc/passwd"), &dest, &canonical)
                .unwrap()
                .is_none()
        );

        let safe = sanitized_entry_path(Path::new("bin/tool"), &dest, &canonical)
            .unwrap()
            .expect("relative path inside the destination is allowed");
        assert!(safe.starts_with(&dest));
    }

    #[test]
    fn test_collapse_nested_dir() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("install");
        fs::create_dir_all(dir.join("jdk-17.0.12+7/bin")).unwrap();
        fs::write(dir.join("jdk-17.0.12+7/bin/java"), b"jvm").unwrap();
        fs::write(dir.join("jdk-17.0.12+7/release"), b"17").unwrap();

        assert!(collapse_nested_dir(&dir).unwrap());
        assert!(dir.join("bin/java").exists());
        assert!(dir.join("release").exists());
        assert!(!dir.join("jdk-17.0.12+7").exists());
    }

    #[test]
    fn test_collapse_leaves_flat_layout_alone() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("install");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("tool"), b"bin").unwrap();
        fs::write(dir.join("readme"), b"docs").unwrap();

        assert!(!collapse_nested_dir(&dir).unwrap());
        assert!(dir.join("tool").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_make_executable() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run.sh");
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        make_executable(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
    }
}
