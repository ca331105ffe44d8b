//! Package resolution: turns declared packages into reference files for the backend.

pub mod registry;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::PackageRef;

pub use registry::RegistryResolver;

/// Resolves packages, and their transitive dependencies, to reference paths.
#[async_trait]
pub trait PackageResolver: Send + Sync {
    /// Reference files for `packages` built for `runtime`, deduplicated by id and version.
    async fn resolve(&self, packages: &[PackageRef], runtime: &str) -> Result<Vec<PathBuf>>;
}

/// A resolver for deployments without packages; every request resolves to nothing.
pub struct NoPackages;

#[async_trait]
impl PackageResolver for NoPackages {
    async fn resolve(&self, _packages: &[PackageRef], _runtime: &str) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}
