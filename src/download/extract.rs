//! Archive extraction with safe-member filtering (no path traversal,
//! absolute paths, or symlink/device escapes).

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::DownloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarBz2,
    TarXz,
    Zip,
}

impl ArchiveFormat {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "tar.gz" | "tgz" => Some(Self::TarGz),
            "tar.bz2" | "tbz2" => Some(Self::TarBz2),
            "tar.xz" | "txz" => Some(Self::TarXz),
            "zip" => Some(Self::Zip),
            _ => None,
        }
    }
}

/// Extracts `archive_path` into `dest_dir`. Runs synchronously; callers
/// invoke this inside `spawn_blocking`.
pub fn extract(archive_path: &Path, dest_dir: &Path, format: ArchiveFormat) -> Result<(), DownloadError> {
    std::fs::create_dir_all(dest_dir).map_err(|e| io_err(dest_dir, e))?;
    match format {
        ArchiveFormat::TarGz => extract_tar(archive_path, dest_dir, |f| Box::new(flate2::read::GzDecoder::new(f))),
        ArchiveFormat::TarBz2 => extract_tar(archive_path, dest_dir, |f| Box::new(bzip2::read::BzDecoder::new(f))),
        ArchiveFormat::TarXz => extract_tar(archive_path, dest_dir, |f| Box::new(xz2::read::XzDecoder::new(f))),
        ArchiveFormat::Zip => extract_zip(archive_path, dest_dir),
    }
}

fn extract_tar(
    archive_path: &Path,
    dest_dir: &Path,
    decoder: impl FnOnce(File) -> Box<dyn std::io::Read>,
) -> Result<(), DownloadError> {
    let file = File::open(archive_path).map_err(|e| io_err(archive_path, e))?;
    let reader = decoder(file);
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(|e| archive_err(archive_path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| archive_err(archive_path, e))?;
        let entry_type = entry.header().entry_type();
        if !(entry_type.is_file() || entry_type.is_dir()) {
            let path = entry.path().map_err(|e| archive_err(archive_path, e))?.into_owned();
            return Err(DownloadError::Archive {
                path: archive_path.display().to_string(),
                message: format!("unsafe archive member type {entry_type:?} at {}", path.display()),
            });
        }
        let path = entry.path().map_err(|e| archive_err(archive_path, e))?.into_owned();
        let safe = safe_join(dest_dir, &path)
            .ok_or_else(|| DownloadError::Archive { path: archive_path.display().to_string(), message: format!("unsafe archive member: {}", path.display()) })?;
        if let Some(parent) = safe.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        entry.unpack(&safe).map_err(|e| archive_err(archive_path, e))?;
    }
    Ok(())
}

fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<(), DownloadError> {
    let file = File::open(archive_path).map_err(|e| io_err(archive_path, e))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| DownloadError::Archive { path: archive_path.display().to_string(), message: e.to_string() })?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| DownloadError::Archive { path: archive_path.display().to_string(), message: e.to_string() })?;
        let name = match entry.enclosed_name() {
            Some(p) => p.to_path_buf(),
            None => {
                return Err(DownloadError::Archive {
                    path: archive_path.display().to_string(),
                    message: format!("unsafe zip member: {}", entry.name()),
                })
            }
        };
        let safe = safe_join(dest_dir, &name)
            .ok_or_else(|| DownloadError::Archive { path: archive_path.display().to_string(), message: format!("unsafe zip member: {}", name.display()) })?;
        if entry.is_dir() {
            std::fs::create_dir_all(&safe).map_err(|e| io_err(&safe, e))?;
            continue;
        }
        if let Some(parent) = safe.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let mut out = File::create(&safe).map_err(|e| io_err(&safe, e))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| io_err(&safe, e))?;
    }
    Ok(())
}

/// Joins `dest_dir` with `member`, rejecting absolute paths and any
/// component that would escape `dest_dir` via `..`.
fn safe_join(dest_dir: &Path, member: &Path) -> Option<PathBuf> {
    if member.is_absolute() {
        return None;
    }
    let mut result = dest_dir.to_path_buf();
    for component in member.components() {
        match component {
            std::path::Component::Normal(part) => result.push(part),
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir | std::path::Component::RootDir | std::path::Component::Prefix(_) => return None,
        }
    }
    Some(result)
}

fn io_err(path: &Path, source: std::io::Error) -> DownloadError {
    DownloadError::Io { path: path.display().to_string(), source }
}

fn archive_err(path: &Path, source: std::io::Error) -> DownloadError {
    DownloadError::Archive { path: path.display().to_string(), message: source.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_absolute_member() {
        assert!(safe_join(Path::new("/tmp/x"), Path::new("/etc/passwd")).is_none());
    }

    #[test]
    fn rejects_parent_traversal() {
        assert!(safe_join(Path::new("/tmp/x"), Path::new("../../etc/passwd")).is_none());
    }

    #[test]
    fn accepts_normal_nested_member() {
        let joined = safe_join(Path::new("/tmp/x"), Path::new("a/b/c.txt")).unwrap();
        assert_eq!(joined, Path::new("/tmp/x/a/b/c.txt"));
    }

    #[test]
    fn parses_known_formats() {
        assert_eq!(ArchiveFormat::parse("tar.gz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::parse("zip"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::parse("rar"), None);
    }

    #[test]
    fn rejects_symlink_archive_member() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("evil.tar.gz");
        {
            let file = File::create(&archive_path).unwrap();
            let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(enc);
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_cksum();
            builder.append_link(&mut header, "link", "/etc/passwd").unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = dir.path().join("out");
        let result = extract(&archive_path, &dest, ArchiveFormat::TarGz);
        assert!(result.is_err());
    }
}
