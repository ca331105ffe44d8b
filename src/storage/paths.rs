use std::path::{Component, Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, RunpadError};
use crate::storage::{SandboxedStorage, StorageSession};

/// Resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

impl SandboxedStorage {
    /// Absolute sandboxed form of `path`, or `AccessDenied`.
    ///
    /// Relative paths are taken from the root. The check is component-wise, and
    /// the nearest existing ancestor is canonicalized so a symlink inside the
    /// root cannot point outside it.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let requested = path.as_ref();
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };
        let resolved = normalize(&joined);

        let denied = || {
            warn!(path = %requested.display(), "Sandbox escape rejected");
            RunpadError::AccessDenied {
                path: requested.display().to_string(),
            }
        };

        if !resolved.starts_with(&self.root) {
            return Err(denied());
        }

        let mut ancestor = Some(resolved.as_path());
        while let Some(candidate) = ancestor {
            if candidate.symlink_metadata().is_ok() {
                let real = candidate.canonicalize()?;
                if !real.starts_with(&self.root) {
                    return Err(denied());
                }
                break;
            }
            ancestor = candidate.parent();
        }

        Ok(resolved)
    }

    /// A sibling of the resolved `path` named `{stem}_{uuid}{.ext}`.
    pub fn unique_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let resolved = self.resolve(path)?;
        let directory = resolved
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let stem = resolved
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let name = match resolved.extension() {
            Some(ext) => format!("{}_{}.{}", stem, Uuid::new_v4(), ext.to_string_lossy()),
            None => format!("{}_{}", stem, Uuid::new_v4()),
        };
        Ok(directory.join(name))
    }
}

impl StorageSession {
    /// Absolute sandboxed form of `path`.
    pub fn full_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        self.storage.resolve(path)
    }
}

/// Join path segments; a rooted segment restarts the path.
pub fn combine<I, P>(parts: I) -> PathBuf
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut out = PathBuf::new();
    for part in parts {
        out.push(part);
    }
    out
}

pub fn parent(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

pub fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

pub fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().map(|n| n.to_string_lossy().into_owned())
}

/// Extension with its leading dot, empty when there is none.
pub fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}

/// Replace (or with `None`, strip) the extension. A leading dot is optional.
pub fn change_extension(path: &Path, extension: Option<&str>) -> PathBuf {
    match extension {
        Some(ext) => path.with_extension(ext.trim_start_matches('.')),
        None => path.with_extension(""),
    }
}

pub fn has_extension(path: &Path) -> bool {
    path.extension().is_some_and(|e| !e.is_empty())
}

pub fn is_rooted(path: &Path) -> bool {
    path.has_root()
}
