use std::fs::{self, FileTimes, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, RunpadError};
use crate::storage::StorageSession;

/// Metadata of a sandboxed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileAttributes {
    pub len: u64,
    pub is_file: bool,
    pub is_dir: bool,
    pub readonly: bool,
}

fn lines_to_bytes<I, S>(lines: I) -> Vec<u8>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Vec::new();
    for line in lines {
        out.extend_from_slice(line.as_ref().as_bytes());
        out.push(b'\n');
    }
    out
}

impl StorageSession {
    fn validate_size(&self, size: u64) -> Result<()> {
        let max = self.storage.max_file_size;
        if size > max {
            return Err(RunpadError::FileTooLarge { size, max });
        }
        Ok(())
    }

    fn validate_append_size(&self, path: &Path, appended: u64) -> Result<()> {
        let existing = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let max = self.storage.max_file_size;
        if existing + appended > max {
            return Err(RunpadError::AppendTooLarge {
                path: path.display().to_string(),
                appended,
                max,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read-only operations
    // ------------------------------------------------------------------

    pub fn exists(&self, path: impl AsRef<Path>) -> Result<bool> {
        Ok(self.storage.resolve(path)?.is_file())
    }

    pub fn read_bytes(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        Ok(fs::read(self.storage.resolve(path)?)?)
    }

    pub fn read_text(&self, path: impl AsRef<Path>) -> Result<String> {
        Ok(fs::read_to_string(self.storage.resolve(path)?)?)
    }

    pub fn read_lines(&self, path: impl AsRef<Path>) -> Result<Vec<String>> {
        Ok(self.read_text(path)?.lines().map(str::to_string).collect())
    }

    pub fn attributes(&self, path: impl AsRef<Path>) -> Result<FileAttributes> {
        let meta = fs::metadata(self.storage.resolve(path)?)?;
        Ok(FileAttributes {
            len: meta.len(),
            is_file: meta.is_file(),
            is_dir: meta.is_dir(),
            readonly: meta.permissions().readonly(),
        })
    }

    pub fn created(&self, path: impl AsRef<Path>) -> Result<DateTime<Utc>> {
        Ok(fs::metadata(self.storage.resolve(path)?)?.created()?.into())
    }

    pub fn accessed(&self, path: impl AsRef<Path>) -> Result<DateTime<Utc>> {
        Ok(fs::metadata(self.storage.resolve(path)?)?.accessed()?.into())
    }

    pub fn modified(&self, path: impl AsRef<Path>) -> Result<DateTime<Utc>> {
        Ok(fs::metadata(self.storage.resolve(path)?)?.modified()?.into())
    }

    // ------------------------------------------------------------------
    // Mutations without bookkeeping
    // ------------------------------------------------------------------

    pub fn delete(&self, path: impl AsRef<Path>) -> Result<()> {
        Ok(fs::remove_file(self.storage.resolve(path)?)?)
    }

    pub fn copy(
        &self,
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
        overwrite: bool,
    ) -> Result<()> {
        let source = self.storage.resolve(source)?;
        let destination = self.storage.resolve(destination)?;
        if !overwrite && destination.exists() {
            return Err(RunpadError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", destination.display()),
            )));
        }
        fs::copy(source, destination)?;
        Ok(())
    }

    pub fn rename(&self, source: impl AsRef<Path>, destination: impl AsRef<Path>) -> Result<()> {
        let source = self.storage.resolve(source)?;
        let destination = self.storage.resolve(destination)?;
        Ok(fs::rename(source, destination)?)
    }

    pub fn set_modified(&self, path: impl AsRef<Path>, time: DateTime<Utc>) -> Result<()> {
        self.set_times(path, FileTimes::new().set_modified(SystemTime::from(time)))
    }

    pub fn set_accessed(&self, path: impl AsRef<Path>, time: DateTime<Utc>) -> Result<()> {
        self.set_times(path, FileTimes::new().set_accessed(SystemTime::from(time)))
    }

    fn set_times(&self, path: impl AsRef<Path>, times: FileTimes) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(self.storage.resolve(path)?)?;
        file.set_times(times)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Writes: size check, unique name, artifact record
    // ------------------------------------------------------------------

    /// Write `bytes` to a fresh unique sibling of `path` and return where it landed.
    pub fn write_bytes(&self, path: impl AsRef<Path>, bytes: &[u8]) -> Result<PathBuf> {
        let size = bytes.len() as u64;
        self.validate_size(size)?;
        let target = self.storage.unique_path(path)?;
        fs::write(&target, bytes)?;
        self.record(&target, size);
        Ok(target)
    }

    pub fn write_text(&self, path: impl AsRef<Path>, contents: &str) -> Result<PathBuf> {
        self.write_bytes(path, contents.as_bytes())
    }

    pub fn write_lines<I, S>(&self, path: impl AsRef<Path>, lines: I) -> Result<PathBuf>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.write_bytes(path, &lines_to_bytes(lines))
    }

    /// Create an empty artifact.
    pub fn create(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        self.write_bytes(path, &[])
    }

    /// Append to `path` if it exists, otherwise to a fresh unique sibling.
    pub fn append_bytes(&self, path: impl AsRef<Path>, bytes: &[u8]) -> Result<PathBuf> {
        let resolved = self.storage.resolve(path)?;
        let target = if resolved.is_file() {
            resolved
        } else {
            self.storage.unique_path(&resolved)?
        };
        let appended = bytes.len() as u64;
        self.validate_append_size(&target, appended)?;

        let mut file = OpenOptions::new().create(true).append(true).open(&target)?;
        file.write_all(bytes)?;
        let size = file.metadata()?.len();
        self.record(&target, size);
        Ok(target)
    }

    pub fn append_text(&self, path: impl AsRef<Path>, contents: &str) -> Result<PathBuf> {
        self.append_bytes(path, contents.as_bytes())
    }

    pub fn append_lines<I, S>(&self, path: impl AsRef<Path>, lines: I) -> Result<PathBuf>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.append_bytes(path, &lines_to_bytes(lines))
    }

    /// Adopt a file something else wrote inside the sandbox, size-checked.
    pub fn record_existing(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let resolved = self.storage.resolve(path)?;
        let size = fs::metadata(&resolved)?.len();
        self.validate_size(size)?;
        self.record(&resolved, size);
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::test_support::Collected;
    use crate::storage::SandboxedStorage;

    fn session(max: u64) -> (tempfile::TempDir, StorageSession, Arc<Collected>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = SandboxedStorage::new(dir.path(), max).unwrap();
        let sink = Arc::new(Collected::default());
        let session = storage.session(sink.clone());
        (dir, session, sink)
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let (_dir, files, sink) = session(1024);
        let written = files.write_text("notes.txt", "hello sandbox").unwrap();
        assert_ne!(written, files.root().join("notes.txt"));
        assert_eq!(files.read_text(&written).unwrap(), "hello sandbox");

        let recorded = sink.0.lock().unwrap().clone();
        assert_eq!(recorded, vec![(written, 13)]);
    }

    #[test]
    fn test_write_over_quota_rejected() {
        let (_dir, files, sink) = session(4);
        let err = files.write_text("big.txt", "12345").unwrap_err();
        assert!(matches!(err, RunpadError::FileTooLarge { size: 5, max: 4 }));
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_append_to_existing_keeps_name() {
        let (_dir, files, sink) = session(1024);
        fs::write(files.root().join("log.txt"), "a\n").unwrap();
        let target = files.append_lines("log.txt", ["b", "c"]).unwrap();
        assert_eq!(target, files.root().join("log.txt"));
        assert_eq!(files.read_lines("log.txt").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(sink.0.lock().unwrap()[0].1, 6);
    }

    #[test]
    fn test_append_to_missing_uses_unique_name() {
        let (_dir, files, _sink) = session(1024);
        let target = files.append_text("new.log", "x").unwrap();
        assert_ne!(target, files.root().join("new.log"));
        assert!(target.file_name().unwrap().to_string_lossy().starts_with("new_"));
    }

    #[test]
    fn test_append_quota_counts_existing_size() {
        let (_dir, files, _sink) = session(4);
        fs::write(files.root().join("log.txt"), "abc").unwrap();
        let err = files.append_text("log.txt", "de").unwrap_err();
        assert!(matches!(err, RunpadError::AppendTooLarge { appended: 2, max: 4, .. }));
    }

    #[test]
    fn test_every_call_is_sandboxed() {
        let (_dir, files, _sink) = session(1024);
        assert!(files.read_text("../outside.txt").unwrap_err().is_access_denied());
        assert!(files.write_text("../outside.txt", "x").unwrap_err().is_access_denied());
        assert!(files.exists("/etc/hosts").unwrap_err().is_access_denied());
        assert!(files
            .copy("a.txt", "../b.txt", true)
            .unwrap_err()
            .is_access_denied());
    }

    #[test]
    fn test_copy_rename_delete() {
        let (_dir, files, _sink) = session(1024);
        fs::write(files.root().join("a.txt"), "data").unwrap();
        files.copy("a.txt", "b.txt", false).unwrap();
        assert!(files.copy("a.txt", "b.txt", false).is_err());
        files.rename("b.txt", "c.txt").unwrap();
        assert!(files.exists("c.txt").unwrap());
        assert!(!files.exists("b.txt").unwrap());
        files.delete("c.txt").unwrap();
        assert!(!files.exists("c.txt").unwrap());
    }

    #[test]
    fn test_attributes_and_times() {
        let (_dir, files, _sink) = session(1024);
        fs::write(files.root().join("a.txt"), "data").unwrap();
        let attrs = files.attributes("a.txt").unwrap();
        assert_eq!(attrs.len, 4);
        assert!(attrs.is_file);

        let when = DateTime::parse_from_rfc3339("2020-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        files.set_modified("a.txt", when).unwrap();
        assert_eq!(files.modified("a.txt").unwrap(), when);
    }

    #[test]
    fn test_record_existing_checks_size() {
        let (_dir, files, sink) = session(2);
        fs::write(files.root().join("ok.bin"), "ab").unwrap();
        fs::write(files.root().join("big.bin"), "abc").unwrap();
        files.record_existing("ok.bin").unwrap();
        assert!(files.record_existing("big.bin").is_err());
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }
}
