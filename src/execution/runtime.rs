use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

/// Language version used when the tag is blank or unknown.
pub const DEFAULT_LANGUAGE_VERSION: &str = "default";

const BUILT_IN: &[(&str, &str)] = &[
    ("netcoreapp3.1", "8"),
    (".net5.0", "9"),
    (".net6.0", "10"),
    (".net7.0", "11"),
    (".net8.0", "12"),
    (".net9.0", "latest"),
];

/// One row of the runtime listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeInfo {
    pub runtime: String,
    pub language_version: String,
}

/// Maps a target runtime tag to the language version the backend compiles with.
#[derive(Debug, Clone)]
pub struct RuntimeTable {
    versions: BTreeMap<String, String>,
}

impl Default for RuntimeTable {
    fn default() -> Self {
        Self::new(&BTreeMap::new())
    }
}

impl RuntimeTable {
    /// Built-in tags plus `extra`, which wins on conflicts.
    pub fn new(extra: &BTreeMap<String, String>) -> Self {
        let mut versions: BTreeMap<String, String> = BUILT_IN
            .iter()
            .map(|(tag, version)| (tag.to_string(), version.to_string()))
            .collect();
        for (tag, version) in extra {
            versions.insert(tag.trim().to_lowercase(), version.clone());
        }
        Self { versions }
    }

    pub fn language_version(&self, runtime: &str) -> String {
        let tag = runtime.trim().to_lowercase();
        if tag.is_empty() {
            debug!("No runtime specified, using default language version");
            return DEFAULT_LANGUAGE_VERSION.to_string();
        }
        match self.versions.get(&tag) {
            Some(version) => version.clone(),
            None => {
                warn!(runtime = %runtime, "Unrecognized runtime, using default language version");
                DEFAULT_LANGUAGE_VERSION.to_string()
            }
        }
    }

    pub fn list(&self) -> Vec<RuntimeInfo> {
        self.versions
            .iter()
            .map(|(runtime, language_version)| RuntimeInfo {
                runtime: runtime.clone(),
                language_version: language_version.clone(),
            })
            .collect()
    }
}
