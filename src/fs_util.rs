use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::debug;
use zip::ZipArchive;

use crate::error::AlmaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    Zip,
}

impl ArchiveFormat {
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else {
            None
        }
    }
}

pub fn is_archive(path: &Path) -> bool {
    ArchiveFormat::detect(path).is_some()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub files: usize,
    pub dirs: usize,
    /// Links and special entries, never materialized.
    pub skipped: usize,
}

/// Member path split into components, without empty and `.` parts.
pub fn member_parts(name: &str) -> Vec<String> {
    name.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .map(str::to_string)
        .collect()
}

/// Names of every member, in archive order.
pub fn entry_names(archive: &Path) -> Result<Vec<String>, AlmaError> {
    let format = ArchiveFormat::detect(archive)
        .ok_or_else(|| AlmaError::extraction(archive, "unsupported archive format"))?;
    match format {
        ArchiveFormat::Zip => {
            let mut zip = open_zip(archive)?;
            let mut names = Vec::with_capacity(zip.len());
            for i in 0..zip.len() {
                let entry = zip
                    .by_index(i)
                    .map_err(|err| AlmaError::extraction(archive, err.to_string()))?;
                names.push(entry.name().to_string());
            }
            Ok(names)
        }
        ArchiveFormat::Tar | ArchiveFormat::TarGz => {
            let mut tar = open_tar(archive, format)?;
            let mut names = Vec::new();
            let entries = tar
                .entries()
                .map_err(|err| AlmaError::extraction(archive, err.to_string()))?;
            for entry in entries {
                let entry = entry.map_err(|err| AlmaError::extraction(archive, err.to_string()))?;
                names.push(String::from_utf8_lossy(&entry.path_bytes()).to_string());
            }
            Ok(names)
        }
    }
}

/// Extracts `archive` under `target_dir`, dropping `strip_prefix` from member
/// paths that start with it. Members escaping the target are rejected;
/// links and special files are skipped.
pub fn extract_archive(
    archive: &Path,
    target_dir: &Path,
    strip_prefix: &[String],
) -> Result<ExtractStats, AlmaError> {
    let format = ArchiveFormat::detect(archive)
        .ok_or_else(|| AlmaError::extraction(archive, "unsupported archive format"))?;
    fs::create_dir_all(target_dir).map_err(|err| AlmaError::Filesystem(err.to_string()))?;
    match format {
        ArchiveFormat::Zip => extract_zip(archive, target_dir, strip_prefix),
        ArchiveFormat::Tar | ArchiveFormat::TarGz => {
            extract_tar(archive, format, target_dir, strip_prefix)
        }
    }
}

fn extract_tar(
    archive: &Path,
    format: ArchiveFormat,
    target_dir: &Path,
    strip_prefix: &[String],
) -> Result<ExtractStats, AlmaError> {
    let mut tar = open_tar(archive, format)?;
    let mut stats = ExtractStats::default();
    let entries = tar
        .entries()
        .map_err(|err| AlmaError::extraction(archive, err.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| AlmaError::extraction(archive, err.to_string()))?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).to_string();
        let Some(dest) = destination(archive, target_dir, &name, strip_prefix)? else {
            continue;
        };

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&dest).map_err(|err| AlmaError::Filesystem(err.to_string()))?;
                stats.dirs += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                let mode = entry.header().mode().ok();
                write_member(archive, &mut entry, &dest)?;
                set_mode(&dest, mode);
                stats.files += 1;
            }
            other => {
                debug!(member = %name, kind = ?other, "skipping non-regular tar member");
                stats.skipped += 1;
            }
        }
    }
    Ok(stats)
}

fn extract_zip(
    archive: &Path,
    target_dir: &Path,
    strip_prefix: &[String],
) -> Result<ExtractStats, AlmaError> {
    let mut zip = open_zip(archive)?;
    let mut stats = ExtractStats::default();
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|err| AlmaError::extraction(archive, err.to_string()))?;
        let name = entry.name().to_string();
        if entry.enclosed_name().is_none() {
            return Err(AlmaError::extraction(
                archive,
                format!("zip entry path traversal detected: {name}"),
            ));
        }
        let Some(dest) = destination(archive, target_dir, &name, strip_prefix)? else {
            continue;
        };

        if entry.is_dir() {
            fs::create_dir_all(&dest).map_err(|err| AlmaError::Filesystem(err.to_string()))?;
            stats.dirs += 1;
            continue;
        }
        if entry.is_symlink() {
            stats.skipped += 1;
            continue;
        }
        let mode = entry.unix_mode();
        write_member(archive, &mut entry, &dest)?;
        set_mode(&dest, mode);
        stats.files += 1;
    }
    Ok(stats)
}

fn destination(
    archive: &Path,
    target_dir: &Path,
    name: &str,
    strip_prefix: &[String],
) -> Result<Option<PathBuf>, AlmaError> {
    if name.starts_with('/') || name.contains('\\') {
        return Err(AlmaError::extraction(
            archive,
            format!("unsafe member path: {name}"),
        ));
    }
    let mut parts = member_parts(name);
    if !strip_prefix.is_empty()
        && parts.len() >= strip_prefix.len()
        && parts[..strip_prefix.len()] == *strip_prefix
    {
        parts.drain(..strip_prefix.len());
    }
    if parts.is_empty() {
        return Ok(None);
    }
    if parts.iter().any(|part| part == "..") {
        return Err(AlmaError::extraction(
            archive,
            format!("unsafe member path: {name}"),
        ));
    }
    let mut dest = target_dir.to_path_buf();
    dest.extend(parts);
    Ok(Some(dest))
}

fn write_member(archive: &Path, reader: &mut dyn Read, dest: &Path) -> Result<(), AlmaError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|err| AlmaError::Filesystem(err.to_string()))?;
    }
    let mut outfile = File::create(dest).map_err(|err| AlmaError::Filesystem(err.to_string()))?;
    io::copy(reader, &mut outfile).map_err(|err| AlmaError::extraction(archive, err.to_string()))?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        let _ = fs::set_permissions(path, fs::Permissions::from_mode((mode & 0o777) | 0o200));
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) {}

fn open_tar(archive: &Path, format: ArchiveFormat) -> Result<Archive<Box<dyn Read>>, AlmaError> {
    let file = File::open(archive)
        .map_err(|err| AlmaError::extraction(archive, format!("open: {err}")))?;
    let reader: Box<dyn Read> = match format {
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(file)),
        _ => Box::new(file),
    };
    Ok(Archive::new(reader))
}

fn open_zip(archive: &Path) -> Result<ZipArchive<File>, AlmaError> {
    let file = File::open(archive)
        .map_err(|err| AlmaError::extraction(archive, format!("open: {err}")))?;
    ZipArchive::new(file).map_err(|err| AlmaError::extraction(archive, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_formats() {
        assert_eq!(ArchiveFormat::detect(Path::new("a.TGZ")), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect(Path::new("a.tar.gz")), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect(Path::new("a.tar")), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::detect(Path::new("a.zip")), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::detect(Path::new("a.fits")), None);
    }

    #[test]
    fn destination_rejects_escape_and_strips_prefix() {
        let archive = Path::new("x.tar");
        let target = Path::new("/t");
        let prefix = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            destination(archive, target, "./a/b/c.txt", &prefix).unwrap(),
            Some(PathBuf::from("/t/c.txt"))
        );
        assert_eq!(destination(archive, target, "a/b/", &prefix).unwrap(), None);
        assert!(destination(archive, target, "../etc/passwd", &[]).is_err());
        assert!(destination(archive, target, "/etc/passwd", &[]).is_err());
    }
}
