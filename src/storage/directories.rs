use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::{Result, RunpadError};
use crate::storage::StorageSession;

/// Which entries a listing returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Files,
    Directories,
    All,
}

/// Compile a `*`/`?` wildcard into an anchored regex.
fn wildcard(pattern: &str) -> Result<Regex> {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| RunpadError::Other(e.into()))
}

impl StorageSession {
    pub fn dir_exists(&self, path: impl AsRef<Path>) -> Result<bool> {
        Ok(self.storage.resolve(path)?.is_dir())
    }

    /// Create a directory and its parents; returns the absolute path.
    pub fn create_dir(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let resolved = self.storage.resolve(path)?;
        fs::create_dir_all(&resolved)?;
        Ok(resolved)
    }

    pub fn delete_dir(&self, path: impl AsRef<Path>, recursive: bool) -> Result<()> {
        let resolved = self.storage.resolve(path)?;
        if resolved == self.storage.root {
            return Err(RunpadError::AccessDenied {
                path: resolved.display().to_string(),
            });
        }
        if recursive {
            fs::remove_dir_all(resolved)?;
        } else {
            fs::remove_dir(resolved)?;
        }
        Ok(())
    }

    /// List entries of `path` whose names match `pattern`, sorted.
    ///
    /// Symlinked directories are never descended into.
    pub fn list(
        &self,
        path: impl AsRef<Path>,
        pattern: &str,
        kind: EntryKind,
        recursive: bool,
    ) -> Result<Vec<PathBuf>> {
        let matcher = wildcard(pattern)?;
        let mut pending = vec![self.storage.resolve(path)?];
        let mut found = Vec::new();

        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let file_type = entry.file_type()?;
                let entry_path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();

                let wanted = match kind {
                    EntryKind::Files => file_type.is_file(),
                    EntryKind::Directories => file_type.is_dir(),
                    EntryKind::All => true,
                };
                if wanted && matcher.is_match(&name) {
                    found.push(entry_path.clone());
                }
                if recursive && file_type.is_dir() {
                    pending.push(entry_path);
                }
            }
        }

        found.sort();
        Ok(found)
    }

    pub fn list_files(&self, path: impl AsRef<Path>, pattern: &str, recursive: bool) -> Result<Vec<PathBuf>> {
        self.list(path, pattern, EntryKind::Files, recursive)
    }

    pub fn list_dirs(&self, path: impl AsRef<Path>, pattern: &str, recursive: bool) -> Result<Vec<PathBuf>> {
        self.list(path, pattern, EntryKind::Directories, recursive)
    }

    pub fn list_entries(&self, path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        self.list(path, "*", EntryKind::All, false)
    }

    pub fn dir_created(&self, path: impl AsRef<Path>) -> Result<DateTime<Utc>> {
        Ok(fs::metadata(self.storage.resolve(path)?)?.created()?.into())
    }

    pub fn dir_accessed(&self, path: impl AsRef<Path>) -> Result<DateTime<Utc>> {
        Ok(fs::metadata(self.storage.resolve(path)?)?.accessed()?.into())
    }

    pub fn dir_modified(&self, path: impl AsRef<Path>) -> Result<DateTime<Utc>> {
        Ok(fs::metadata(self.storage.resolve(path)?)?.modified()?.into())
    }
}
