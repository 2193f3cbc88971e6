//! Directory listings and file operations inside the download root.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;

use super::archive::is_archive;
use super::guard::{PathGuard, SecurityError};
use crate::util::format_size;

#[derive(Error, Debug)]
pub enum FsError {
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("Path not found")]
    NotFound,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Metadata for a single file or directory, as returned to clients
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileEntry {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub size_formatted: String,
    pub modified: String,
    pub modified_formatted: String,
    pub is_directory: bool,
    pub mime_type: String,
    pub extension: String,
    pub can_extract: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub files: Vec<FileEntry>,
    pub current_path: PathBuf,
    pub parent_path: Option<PathBuf>,
    pub download_dir: PathBuf,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StorageSummary {
    pub total_files: usize,
    pub total_size: u64,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

/// Stats `path` and builds its entry. Never fails: an unreadable path comes
/// back zeroed with `error` set, and the caller decides what to do with it.
pub fn file_info(path: &Path) -> FileEntry {
    match std::fs::metadata(path) {
        Ok(meta) => {
            let modified: Option<DateTime<Local>> = meta
                .modified()
                .ok()
                .map(|time: SystemTime| DateTime::from(time));
            let is_directory = meta.is_dir();
            FileEntry {
                name: file_name(path),
                path: path.to_path_buf(),
                size: meta.len(),
                size_formatted: format_size(meta.len()),
                modified: modified
                    .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
                    .unwrap_or_default(),
                modified_formatted: modified
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "Unknown".to_string()),
                is_directory,
                mime_type: mime_guess::from_path(path)
                    .first()
                    .map(|mime| mime.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                extension: extension(path),
                can_extract: !is_directory && is_archive(path),
                error: None,
            }
        }
        Err(e) => {
            tracing::error!("Error getting file info for {}: {}", path.display(), e);
            FileEntry {
                name: file_name(path),
                path: path.to_path_buf(),
                size: 0,
                size_formatted: format_size(0),
                modified: String::new(),
                modified_formatted: "Unknown".to_string(),
                is_directory: false,
                mime_type: "unknown".to_string(),
                extension: String::new(),
                can_extract: false,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Directories first, then names compared case-insensitively
fn sort_entries(entries: &mut [FileEntry]) {
    entries.sort_by(|a, b| {
        b.is_directory
            .cmp(&a.is_directory)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}

/// File operations confined to one root directory
#[derive(Debug, Clone)]
pub struct FileCatalog {
    guard: PathGuard,
}

impl FileCatalog {
    pub fn new(guard: PathGuard) -> Self {
        Self { guard }
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    pub fn root(&self) -> &Path {
        self.guard.root()
    }

    /// Lists the immediate children of `path` (the root when `None`)
    #[tracing::instrument(skip(self))]
    pub async fn list(&self, path: Option<&str>) -> Result<Listing> {
        let current = self.guard.resolve(path)?;
        let dir = current.clone();
        let files = tokio::task::spawn_blocking(move || -> Result<Vec<FileEntry>> {
            if !dir.is_dir() {
                return Err(FsError::NotFound);
            }
            let mut files = std::fs::read_dir(&dir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| file_info(&entry.path()))
                .collect::<Vec<_>>();
            sort_entries(&mut files);
            Ok(files)
        })
        .await
        .map_err(|e| FsError::Io(io::Error::other(e)))??;

        tracing::debug!(count = files.len(), path = %current.display(), "Listed directory");
        Ok(Listing {
            count: files.len(),
            parent_path: self.guard.parent_of(&current),
            download_dir: self.root().to_path_buf(),
            current_path: current,
            files,
        })
    }

    /// Resolves a client supplied path that must already exist
    pub async fn existing(&self, path: &str) -> Result<PathBuf> {
        let resolved = self.guard.resolve(Some(path))?;
        match tokio::fs::symlink_metadata(&resolved).await {
            Ok(_) => Ok(resolved),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(FsError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes a file, or a directory and everything under it. The root
    /// itself is never deleted.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, path: &str) -> Result<PathBuf> {
        let resolved = self.existing(path).await?;
        if self.guard.is_root(&resolved) {
            tracing::warn!("Refusing to delete the download root");
            return Err(SecurityError::AccessDenied.into());
        }

        // symlink_metadata so that a link is removed, not its target
        let meta = tokio::fs::symlink_metadata(&resolved).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&resolved).await?;
        } else {
            tokio::fs::remove_file(&resolved).await?;
        }
        tracing::info!(path = %resolved.display(), "Deleted");
        Ok(resolved)
    }

    /// Opens a regular file given relative to the root, for streaming to a client
    pub async fn open_for_download(&self, relative: &str) -> Result<(PathBuf, tokio::fs::File)> {
        let resolved = self.guard.resolve_relative(relative)?;
        match tokio::fs::metadata(&resolved).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(FsError::NotFound),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(FsError::NotFound),
            Err(e) => return Err(e.into()),
        }
        let file = tokio::fs::File::open(&resolved).await?;
        Ok((resolved, file))
    }

    /// Count and total size of the regular files directly under the root.
    /// Unreadable roots report zero.
    pub async fn summary(&self) -> StorageSummary {
        let root = self.root().to_path_buf();
        tokio::task::spawn_blocking(move || {
            let Ok(entries) = std::fs::read_dir(&root) else {
                return StorageSummary::default();
            };
            entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.metadata().ok())
                .filter(|meta| meta.is_file())
                .fold(StorageSummary::default(), |acc, meta| StorageSummary {
                    total_files: acc.total_files + 1,
                    total_size: acc.total_size + meta.len(),
                })
        })
        .await
        .unwrap_or_default()
    }
}
