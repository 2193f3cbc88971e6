//! Archive detection and extraction.
//!
//! Zip archives are read with `async_zip`; tarballs go through the `tar` crate
//! on a blocking thread, with the compression layer picked from the file's
//! magic bytes rather than its name.

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Component, Path, PathBuf};

use async_zip::tokio::read::seek::ZipFileReader;
use thiserror::Error;
use tokio::io::BufReader as AsyncBufReader;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info};

use super::guard::real_path;

/// Suffixes recognized as archives. `.7z` and `.rar` are detected but cannot
/// be extracted.
pub const ARCHIVE_EXTENSIONS: [&str; 8] = [
    ".zip", ".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tar.xz", ".7z", ".rar",
];

const TAR_EXTENSIONS: [&str; 5] = [".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tar.xz"];

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("File is not a supported archive")]
    NotAnArchive,

    #[error("Unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),
}

impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        ArchiveError::ExtractionFailed(err.to_string())
    }
}

impl From<async_zip::error::ZipError> for ArchiveError {
    fn from(err: async_zip::error::ZipError) -> Self {
        ArchiveError::ExtractionFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    /// Recognized, but no extractor is available
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TarCompression {
    None,
    Gzip,
    Bzip2,
    Xz,
}

fn lowercase(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

pub fn is_archive(path: &Path) -> bool {
    let name = lowercase(path);
    ARCHIVE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

pub fn archive_kind(path: &Path) -> Option<ArchiveKind> {
    let name = lowercase(path);
    if name.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else if TAR_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
        Some(ArchiveKind::Tar)
    } else if is_archive(path) {
        Some(ArchiveKind::Unsupported)
    } else {
        None
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// The archive path with its last extension removed, `a.tar.gz` -> `a.tar`
pub fn default_destination(path: &Path) -> PathBuf {
    path.with_extension("")
}

/// Extracts `archive` into `destination` (or [`default_destination`]) and
/// returns the directory the contents landed in.
#[tracing::instrument(skip_all, fields(archive = %archive.display()))]
pub async fn extract(archive: &Path, destination: Option<&Path>) -> Result<PathBuf> {
    let kind = archive_kind(archive).ok_or(ArchiveError::NotAnArchive)?;
    if kind == ArchiveKind::Unsupported {
        return Err(ArchiveError::UnsupportedFormat(extension_of(archive)));
    }

    let destination = destination
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_destination(archive));
    tokio::fs::create_dir_all(&destination).await?;

    if kind == ArchiveKind::Zip {
        let files = extract_zip_to_directory(archive, &destination).await?;
        info!(files = files.len(), destination = %destination.display(), "Zip extracted");
    } else {
        let archive = archive.to_path_buf();
        let target = destination.clone();
        tokio::task::spawn_blocking(move || extract_tar_to_directory(&archive, &target))
            .await
            .map_err(|e| ArchiveError::ExtractionFailed(e.to_string()))??;
        info!(destination = %destination.display(), "Tarball extracted");
    }

    Ok(destination)
}

/// Entry name joined under `destination`, or `None` if it is absolute or
/// climbs out with `..`.
fn enclosed_path(destination: &Path, entry_name: &str) -> Option<PathBuf> {
    let entry = Path::new(entry_name);
    let mut out = destination.to_path_buf();
    for component in entry.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Refuses `path` when an existing symlink on the way to it leads out of
/// `real_destination`, or when `path` is itself a link.
async fn ensure_enclosed(path: &Path, real_destination: &Path) -> Result<()> {
    let escapes = match real_path(path) {
        Ok(real) => !real.starts_with(real_destination),
        Err(_) => true,
    };
    let is_link = tokio::fs::symlink_metadata(path)
        .await
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false);
    if escapes || is_link {
        return Err(ArchiveError::ExtractionFailed(format!(
            "entry leads outside destination through a symlink: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Extracts a zip file into `destination`, returning the written file paths
pub async fn extract_zip_to_directory(zip_path: &Path, destination: &Path) -> Result<Vec<PathBuf>> {
    info!(archive = ?zip_path, destination = ?destination, "Extracting zip archive");
    let real_destination = tokio::fs::canonicalize(destination).await?;
    let file = AsyncBufReader::new(tokio::fs::File::open(zip_path).await?);
    let mut zip = ZipFileReader::with_tokio(file).await?;

    let mut extracted_files = Vec::new();
    let entry_count = zip.file().entries().len();
    debug!(entries = entry_count, "Scanning zip contents");

    for index in 0..entry_count {
        let (name, entry_is_dir) = {
            let entry = zip
                .file()
                .entries()
                .get(index)
                .ok_or_else(|| ArchiveError::ExtractionFailed(format!("missing entry {index}")))?;
            (entry.filename().as_str()?.to_string(), entry.dir()?)
        };

        let path = enclosed_path(destination, &name).ok_or_else(|| {
            ArchiveError::ExtractionFailed(format!("entry escapes destination: {name}"))
        })?;
        ensure_enclosed(&path, &real_destination).await?;

        if entry_is_dir {
            tokio::fs::create_dir_all(&path).await?;
            continue;
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let entry_reader = zip.reader_with_entry(index).await?;
        let mut output_file = tokio::fs::File::create(&path).await?;
        let bytes = tokio::io::copy(&mut entry_reader.compat(), &mut output_file).await?;
        debug!(bytes, path = %name, "Zip entry extracted");

        extracted_files.push(path);
    }

    Ok(extracted_files)
}

fn detect_compression(header: &[u8]) -> TarCompression {
    match header {
        [0x1F, 0x8B, ..] => TarCompression::Gzip,
        [b'B', b'Z', b'h', ..] => TarCompression::Bzip2,
        [0xFD, b'7', b'z', b'X', b'Z', 0x00, ..] => TarCompression::Xz,
        _ => TarCompression::None,
    }
}

fn extract_tar_to_directory(tar_path: &Path, destination: &Path) -> Result<()> {
    let mut file = File::open(tar_path)?;
    let mut header = [0u8; 6];
    let read = file.read(&mut header)?;
    file.rewind()?;

    let compression = detect_compression(&header[..read]);
    debug!(?compression, archive = ?tar_path, "Detected tar compression");

    let reader = BufReader::new(file);
    let decoded: Box<dyn Read> = match compression {
        TarCompression::None => Box::new(reader),
        TarCompression::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
        TarCompression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(reader)),
        TarCompression::Xz => Box::new(xz2::read::XzDecoder::new(reader)),
    };

    let mut archive = tar::Archive::new(decoded);
    archive.set_overwrite(true);
    // `unpack` refuses entries that would land outside `destination`
    archive.unpack(destination)?;
    Ok(())
}
