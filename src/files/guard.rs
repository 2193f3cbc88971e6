//! Confinement of user supplied paths to the download root.

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// Reported the same way whether or not the target exists
    #[error("Access denied")]
    AccessDenied,
}

/// Resolves paths against a fixed root and refuses anything outside it.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// Relative roots are anchored at the current working directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let absolute = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(root))
                .unwrap_or_else(|_| root.to_path_buf())
        };
        Self {
            root: normalize(&absolute),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute, normalized form of `candidate` (the root when `None`).
    ///
    /// Relative candidates are taken relative to the root. `..` segments are
    /// collapsed before the containment check, and the path is checked again
    /// with every symlink along its existing part resolved.
    pub fn resolve(&self, candidate: Option<&str>) -> Result<PathBuf, SecurityError> {
        let candidate = match candidate.map(str::trim) {
            None | Some("") => return Ok(self.root.clone()),
            Some(candidate) => Path::new(candidate),
        };

        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let resolved = normalize(&joined);

        if !resolved.starts_with(&self.root) {
            tracing::warn!(path = %resolved.display(), "Rejected path outside download root");
            return Err(SecurityError::AccessDenied);
        }

        let real_root = real_path(&self.root).unwrap_or_else(|_| self.root.clone());
        match real_path(&resolved) {
            Ok(real) if real.starts_with(&real_root) => {}
            Ok(real) => {
                tracing::warn!(
                    path = %resolved.display(),
                    target = %real.display(),
                    "Rejected symlink leaving download root"
                );
                return Err(SecurityError::AccessDenied);
            }
            Err(e) => {
                tracing::warn!(path = %resolved.display(), "Cannot resolve path: {}", e);
                return Err(SecurityError::AccessDenied);
            }
        }

        Ok(resolved)
    }

    /// Resolves a path given relative to the root, as in `/files/download/{*path}`.
    pub fn resolve_relative(&self, relative: &str) -> Result<PathBuf, SecurityError> {
        let relative = relative.trim_start_matches('/');
        self.resolve(Some(&self.root.join(relative).to_string_lossy()))
    }

    pub fn is_root(&self, path: &Path) -> bool {
        path == self.root
    }

    /// Parent directory of a resolved path, `None` at the root so that
    /// clients can never navigate above it.
    pub fn parent_of(&self, path: &Path) -> Option<PathBuf> {
        if self.is_root(path) {
            return None;
        }
        path.parent().map(Path::to_path_buf)
    }
}

/// `path` with symlinks resolved up to its deepest existing ancestor; the
/// components below that are appended as they are. A dangling link as the
/// last component resolves to itself.
pub fn real_path(path: &Path) -> io::Result<PathBuf> {
    let mut existing = path;
    let mut missing = Vec::new();
    while std::fs::symlink_metadata(existing).is_err() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                existing = parent;
            }
            _ => break,
        }
    }

    let mut real = match existing.canonicalize() {
        Ok(real) => real,
        Err(_) if missing.is_empty() && existing.is_symlink() => {
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => real_path(parent)?.join(name),
                _ => return Err(io::Error::from(io::ErrorKind::NotFound)),
            }
        }
        Err(e) => return Err(e),
    };
    real.extend(missing.iter().rev());
    Ok(real)
}

/// Lexical normalization: drops `.`, pops on `..`, never touches the disk.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
