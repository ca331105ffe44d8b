use std::collections::{HashSet, VecDeque};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::loader::get_cache_dir;
use crate::config::types::PackagesConfig;
use crate::error::{Result, RunpadError};
use crate::model::PackageRef;
use crate::packages::PackageResolver;

/// `1.2`, `1.2.3`, `1.2.3.4`, optionally with a `-prerelease` tag.
static VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(\.\d+){0,3}(-[0-9A-Za-z.-]+)?$").unwrap());

/// Dot-separated segments of letters, digits, `_` and `-`: `Newtonsoft.Json`.
static PACKAGE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_-]*(\.[A-Za-z0-9_-]+)*$").unwrap());

const MANIFEST: &str = "deps.json";
const DOWNLOAD_ATTEMPTS: u32 = 2;
const FALLBACK_FRAMEWORKS: &[&str] = &["netstandard2.1", "netstandard2.0"];

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    dependencies: Vec<PackageRef>,
}

pub fn is_valid_version(version: &str) -> bool {
    VERSION.is_match(version.trim())
}

pub fn is_valid_package_id(id: &str) -> bool {
    PACKAGE_ID.is_match(id.trim())
}

/// Folder name of a runtime tag: `.net8.0` -> `net8.0`.
fn framework_folder(runtime: &str) -> String {
    runtime.trim().trim_start_matches('.').to_lowercase()
}

/// Resolves packages from an on-disk cache, downloading `.tar.gz` archives from
/// a registry on a miss.
///
/// Cache layout: `<cache>/<id>/<version>/` holding `lib/<framework>/*.dll` and an
/// optional `deps.json` listing direct dependencies.
pub struct RegistryResolver {
    cache_dir: PathBuf,
    registry_url: Option<String>,
    offline: bool,
    #[cfg(feature = "registry")]
    client: reqwest::Client,
}

impl RegistryResolver {
    pub fn new(config: &PackagesConfig) -> Result<Self> {
        let cache_dir = config
            .cache_dir
            .clone()
            .unwrap_or_else(|| get_cache_dir().join("packages"));

        #[cfg(feature = "registry")]
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds.max(1)))
            .build()?;

        Ok(Self {
            cache_dir,
            registry_url: config.registry_url.clone(),
            offline: config.offline,
            #[cfg(feature = "registry")]
            client,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Cache folder of a package. Ids and versions that could name anything
    /// outside the cache are refused.
    pub fn package_dir(&self, package: &PackageRef) -> Result<PathBuf> {
        if !is_valid_package_id(&package.id) {
            return Err(RunpadError::InvalidPackageId {
                id: package.id.clone(),
            });
        }
        if !is_valid_version(&package.version) {
            return Err(RunpadError::InvalidPackageVersion {
                id: package.id.clone(),
                version: package.version.clone(),
            });
        }
        let dir = self
            .cache_dir
            .join(package.id.trim().to_lowercase())
            .join(package.version.trim().to_lowercase());
        let contained = dir
            .strip_prefix(&self.cache_dir)
            .map(|rest| rest.components().all(|c| matches!(c, Component::Normal(_))))
            .unwrap_or(false);
        if !contained {
            return Err(RunpadError::AccessDenied {
                path: dir.display().to_string(),
            });
        }
        Ok(dir)
    }

    async fn ensure_cached(&self, package: &PackageRef, dir: PathBuf) -> Result<PathBuf> {
        if dir.is_dir() {
            debug!(package = %package, "Using cached package");
            return Ok(dir);
        }
        if self.offline {
            return Err(RunpadError::PackageNotFound {
                id: package.id.clone(),
                version: package.version.clone(),
            });
        }
        let mut attempt = 1;
        loop {
            match self.download(package, &dir).await {
                Ok(()) => return Ok(dir),
                Err(e) if e.is_retryable() && attempt < DOWNLOAD_ATTEMPTS => {
                    warn!(package = %package, attempt, error = %e, "Retrying package download");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[cfg(feature = "registry")]
    async fn download(&self, package: &PackageRef, dir: &Path) -> Result<()> {
        let Some(base) = &self.registry_url else {
            return Err(RunpadError::PackageNotFound {
                id: package.id.clone(),
                version: package.version.clone(),
            });
        };
        let id = package.id.trim().to_lowercase();
        let version = package.version.trim().to_lowercase();
        let url = format!(
            "{}/{}/{}/{}.{}.tar.gz",
            base.trim_end_matches('/'),
            id,
            version,
            id,
            version
        );

        info!(package = %package, url = %url, "Downloading package");
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            warn!(status = %response.status(), url = %url, "Package download failed");
            return Err(RunpadError::PackageDownload { url });
        }
        let bytes = response.bytes().await?;

        // Unpack next to the final folder so a failed extraction never looks cached.
        let staging = PathBuf::from(format!("{}.partial", dir.display()));
        tokio::fs::create_dir_all(&staging).await?;
        let tar = flate2::read::GzDecoder::new(std::io::Cursor::new(bytes));
        let mut archive = tar::Archive::new(tar);
        if let Err(e) = archive.unpack(&staging) {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(RunpadError::Other(anyhow::anyhow!(
                "Failed to extract {}: {}",
                package,
                e
            )));
        }
        tokio::fs::rename(&staging, dir).await?;
        info!(package = %package, path = %dir.display(), "Cached package");
        Ok(())
    }

    #[cfg(not(feature = "registry"))]
    async fn download(&self, package: &PackageRef, _dir: &Path) -> Result<()> {
        Err(RunpadError::PackageNotFound {
            id: package.id.clone(),
            version: package.version.clone(),
        })
    }
}

/// Pick the `lib/<framework>` folder best matching `runtime`.
fn select_framework(package_dir: &Path, runtime: &str) -> Result<Option<PathBuf>> {
    let lib = package_dir.join("lib");
    if !lib.is_dir() {
        return Ok(None);
    }
    let mut folders: Vec<PathBuf> = std::fs::read_dir(&lib)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    folders.sort();

    let name_of = |path: &Path| {
        path.file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    };
    let wanted = framework_folder(runtime);
    let preferred = std::iter::once(wanted.as_str()).chain(FALLBACK_FRAMEWORKS.iter().copied());
    for candidate in preferred {
        if let Some(found) = folders.iter().find(|f| name_of(f.as_path()) == candidate) {
            return Ok(Some(found.clone()));
        }
    }
    Ok(folders.into_iter().next())
}

fn reference_files(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(folder)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .map(|ext| ext.eq_ignore_ascii_case("dll"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

fn read_manifest(package_dir: &Path) -> Result<Vec<PackageRef>> {
    let path = package_dir.join(MANIFEST);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let manifest: Manifest = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    Ok(manifest.dependencies)
}

#[async_trait]
impl PackageResolver for RegistryResolver {
    async fn resolve(&self, packages: &[PackageRef], runtime: &str) -> Result<Vec<PathBuf>> {
        let mut seen = HashSet::new();
        let mut references = Vec::new();
        let mut queue: VecDeque<PackageRef> = packages.iter().cloned().collect();

        while let Some(package) = queue.pop_front() {
            let dir = match self.package_dir(&package) {
                Ok(dir) => dir,
                Err(e) => {
                    warn!(package = %package, error = %e, "Skipping package");
                    continue;
                }
            };
            if !seen.insert(package.key()) {
                continue;
            }

            let dir = match self.ensure_cached(&package, dir).await {
                Ok(dir) => dir,
                Err(e) => {
                    warn!(package = %package, error = %e, "Could not resolve package");
                    continue;
                }
            };

            match select_framework(&dir, runtime)? {
                Some(folder) => references.extend(reference_files(&folder)?),
                None => debug!(package = %package, "Package has no assemblies"),
            }
            queue.extend(read_manifest(&dir)?);
        }

        info!(count = references.len(), "Resolved package references");
        Ok(references)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn resolver(cache: &Path) -> RegistryResolver {
        RegistryResolver::new(&PackagesConfig {
            cache_dir: Some(cache.to_path_buf()),
            offline: true,
            ..PackagesConfig::default()
        })
        .unwrap()
    }

    fn install(cache: &Path, id: &str, version: &str, framework: &str, deps: &str) {
        let dir = cache.join(id.to_lowercase()).join(version);
        fs::create_dir_all(dir.join("lib").join(framework)).unwrap();
        fs::write(dir.join("lib").join(framework).join(format!("{}.dll", id)), b"MZ").unwrap();
        if !deps.is_empty() {
            fs::write(dir.join(MANIFEST), deps).unwrap();
        }
    }

    #[test]
    fn test_version_validation() {
        assert!(is_valid_version("2.14.1"));
        assert!(is_valid_version("1.0.0-beta.2"));
        assert!(!is_valid_version("latest"));
        assert!(!is_valid_version(""));
    }

    #[test]
    fn test_package_id_validation() {
        assert!(is_valid_package_id("Newtonsoft.Json"));
        assert!(is_valid_package_id("Microsoft.Extensions.Logging.Abstractions"));
        assert!(is_valid_package_id("xunit.runner.visualstudio"));
        assert!(!is_valid_package_id("../outside"));
        assert!(!is_valid_package_id(".."));
        assert!(!is_valid_package_id("a/b"));
        assert!(!is_valid_package_id("a\\b"));
        assert!(!is_valid_package_id("Lib..Core"));
        assert!(!is_valid_package_id(""));
    }

    #[test]
    fn test_package_dir_stays_in_cache() {
        let cache = tempfile::tempdir().unwrap();
        let resolver = resolver(cache.path());

        let dir = resolver
            .package_dir(&PackageRef::new("Newtonsoft.Json", "13.0.3"))
            .unwrap();
        assert_eq!(dir, cache.path().join("newtonsoft.json").join("13.0.3"));

        let err = resolver
            .package_dir(&PackageRef::new("../outside", "1.0"))
            .unwrap_err();
        assert!(matches!(err, RunpadError::InvalidPackageId { .. }));
        let err = resolver
            .package_dir(&PackageRef::new("Lib", "latest"))
            .unwrap_err();
        assert!(matches!(err, RunpadError::InvalidPackageVersion { .. }));
    }

    #[tokio::test]
    async fn test_traversing_id_never_loads_outside_assemblies() {
        let root = tempfile::tempdir().unwrap();
        let cache = root.path().join("cache");
        fs::create_dir_all(&cache).unwrap();
        install(root.path(), "outside", "1.0", "net8.0", "");
        // A manifest inside the cache cannot smuggle the id in either.
        install(
            &cache,
            "App",
            "1.0",
            "net8.0",
            r#"{"dependencies":[{"id":"../outside","version":"1.0"}]}"#,
        );

        let refs = resolver(&cache)
            .resolve(
                &[PackageRef::new("../outside", "1.0"), PackageRef::new("App", "1.0")],
                ".net8.0",
            )
            .await
            .unwrap();
        assert_eq!(refs.len(), 1);
        assert!(refs[0].starts_with(&cache));
        assert!(refs[0].ends_with("App.dll"));
    }

    #[cfg(feature = "registry")]
    fn archive(framework: &str, file: &str) -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, format!("lib/{}/{}", framework, file), &b"MZ"[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[cfg(feature = "registry")]
    #[tokio::test]
    async fn test_download_retries_unavailable_registry() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        use axum::http::StatusCode;

        let hits = Arc::new(AtomicUsize::new(0));
        let body = archive("net8.0", "Remote.dll");
        let handler = {
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                let body = body.clone();
                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        (StatusCode::SERVICE_UNAVAILABLE, Vec::new())
                    } else {
                        (StatusCode::OK, body)
                    }
                }
            }
        };
        let app = axum::Router::new().route("/{*path}", axum::routing::get(handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let cache = tempfile::tempdir().unwrap();
        let resolver = RegistryResolver::new(&PackagesConfig {
            cache_dir: Some(cache.path().to_path_buf()),
            registry_url: Some(format!("http://{}", addr)),
            offline: false,
            ..PackagesConfig::default()
        })
        .unwrap();

        let refs = resolver
            .resolve(&[PackageRef::new("Remote", "1.0.0")], ".net8.0")
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(refs.len(), 1);
        assert!(refs[0].starts_with(cache.path().join("remote").join("1.0.0")));
    }

    #[tokio::test]
    async fn test_resolves_transitively_and_deduplicates() {
        let cache = tempfile::tempdir().unwrap();
        install(
            cache.path(),
            "App",
            "1.0.0",
            "net8.0",
            r#"{"dependencies":[{"id":"Core","version":"2.0.0"},{"id":"core","version":"2.0.0"}]}"#,
        );
        install(cache.path(), "Core", "2.0.0", "netstandard2.0", "");

        let refs = resolver(cache.path())
            .resolve(
                &[PackageRef::new("App", "1.0.0"), PackageRef::new("APP", "1.0.0")],
                ".net8.0",
            )
            .await
            .unwrap();
        let names: Vec<_> = refs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["App.dll", "Core.dll"]);
    }

    #[tokio::test]
    async fn test_skips_bad_versions_and_missing_packages() {
        let cache = tempfile::tempdir().unwrap();
        let refs = resolver(cache.path())
            .resolve(
                &[PackageRef::new("X", "not-a-version"), PackageRef::new("Missing", "1.0")],
                ".net8.0",
            )
            .await
            .unwrap();
        assert!(refs.is_empty());
    }

    #[test]
    fn test_framework_selection_prefers_exact_match() {
        let cache = tempfile::tempdir().unwrap();
        install(cache.path(), "Lib", "1.0", "net6.0", "");
        install(cache.path(), "Lib", "1.0", "net8.0", "");
        let dir = cache.path().join("lib").join("1.0");
        let chosen = select_framework(&dir, ".NET8.0").unwrap().unwrap();
        assert!(chosen.ends_with("net8.0"));
        let fallback = select_framework(&dir, ".net9.0").unwrap().unwrap();
        assert!(fallback.ends_with("net6.0"));
    }
}
