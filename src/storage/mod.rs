//! Sandboxed storage exposed to executing code.
//!
//! Every path-accepting call resolves its argument against one root folder and
//! fails with [`RunpadError::AccessDenied`](crate::error::RunpadError::AccessDenied)
//! when the result lies outside it. Write calls check the size quota, pick a
//! collision-free name and record the artifact with the current execution.

pub mod directories;
pub mod files;
pub mod paths;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;

pub use directories::EntryKind;
pub use files::FileAttributes;

/// Receives every artifact a write call produces.
///
/// Set once per execution before user code runs; never shared between executions.
pub trait ArtifactSink: Send + Sync {
    fn record(&self, path: &Path, size: u64);
}

/// The sandbox root and its quota. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SandboxedStorage {
    root: PathBuf,
    max_file_size: u64,
}

impl SandboxedStorage {
    /// Create the root folder if needed and pin its canonical form.
    pub fn new(root: impl AsRef<Path>, max_file_size: u64) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        debug!(root = %root.display(), max_file_size, "Sandboxed storage ready");
        Ok(Self {
            root,
            max_file_size,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Bind the storage to one execution's artifact sink.
    pub fn session(&self, sink: Arc<dyn ArtifactSink>) -> StorageSession {
        StorageSession {
            storage: self.clone(),
            sink: Some(sink),
        }
    }

    /// A session that records nothing, for tools and tests.
    pub fn detached(&self) -> StorageSession {
        StorageSession {
            storage: self.clone(),
            sink: None,
        }
    }
}

/// Storage as seen by one execution.
#[derive(Clone)]
pub struct StorageSession {
    storage: SandboxedStorage,
    sink: Option<Arc<dyn ArtifactSink>>,
}

impl std::fmt::Debug for StorageSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSession")
            .field("root", &self.storage.root)
            .field("recording", &self.sink.is_some())
            .finish()
    }
}

impl StorageSession {
    pub fn storage(&self) -> &SandboxedStorage {
        &self.storage
    }

    pub fn root(&self) -> &Path {
        self.storage.root()
    }

    fn record(&self, path: &Path, size: u64) {
        debug!(path = %path.display(), size, "Recorded artifact");
        if let Some(sink) = &self.sink {
            sink.record(path, size);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use super::ArtifactSink;

    /// Collects recorded artifacts in memory.
    #[derive(Default)]
    pub struct Collected(pub Mutex<Vec<(PathBuf, u64)>>);

    impl ArtifactSink for Collected {
        fn record(&self, path: &Path, size: u64) {
            self.0.lock().unwrap().push((path.to_path_buf(), size));
        }
    }
}
