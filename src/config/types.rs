use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::analysis::SafetyPolicy;
use crate::preprocess::PreprocessRules;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunpadConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub execution: ExecutionConfig,
    pub safety: SafetyConfig,
    pub preprocess: PreprocessRules,
    pub backend: BackendConfig,
    pub packages: PackagesConfig,
    /// Extra runtime tag -> language version mappings, merged over the built-in table.
    pub runtimes: BTreeMap<String, String>,
}

/// HTTP transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
    /// Interval of SSE keep-alive comments
    pub sse_keepalive_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5080,
            enable_cors: true,
            sse_keepalive_seconds: 30,
        }
    }
}

/// Sandboxed storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root folder all program file access is confined to (defaults to `<data dir>/sandbox`)
    pub root: Option<PathBuf>,
    /// Maximum size of a single written file, in bytes
    pub max_file_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            max_file_size: 1024 * 1024,
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Output ceiling of the batch writer, in bytes
    pub max_output_bytes: usize,
    /// Wall-clock limit of one execution (0 = unlimited)
    pub execution_timeout_seconds: u64,
    /// How long a blocking read waits for input (0 = until the session ends)
    pub input_timeout_seconds: u64,
    /// Executions allowed to run at the same time
    pub max_concurrent_executions: usize,
    /// How long a finished streaming result is replayed to late subscribers (0 = never)
    pub result_retention_seconds: u64,
    /// Run the safety analyzer on batch submissions too
    pub gate_batch: bool,
    /// Class name marking a wrapped program
    pub entry_class: String,
    /// Entry method of a wrapped program
    pub entry_method: String,
    /// References handed to the backend for every execution
    pub default_references: Vec<PathBuf>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 1024 * 1024,
            execution_timeout_seconds: 300,
            input_timeout_seconds: 0,
            max_concurrent_executions: 8,
            result_retention_seconds: 60,
            gate_batch: true,
            entry_class: "Program".to_string(),
            entry_method: "Main".to_string(),
            default_references: Vec::new(),
        }
    }
}

/// Safety analyzer policy, optionally extended from a separate policy file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// TOML file whose tables are merged over the inline policy
    pub policy_file: Option<PathBuf>,
    #[serde(flatten)]
    pub policy: SafetyPolicy,
}

/// External toolchain used by the process backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Executable that compiles and runs a submission
    pub program: String,
    /// Arguments for script submissions. Placeholders: {source}, {language_version}
    pub script_args: Vec<String>,
    /// Arguments for wrapped programs. Same placeholders
    pub program_args: Vec<String>,
    /// Flag placed before every reference path
    pub reference_arg: String,
    /// Optional compile-only command run before invocation, same placeholders
    pub check_args: Option<Vec<String>>,
    /// Extension of the generated source file
    pub source_extension: String,
    /// Regex with named groups line, col, severity, code, message
    pub diagnostic_pattern: String,
    /// Environment variables [(KEY, VALUE), ...]
    pub env_vars: Vec<(String, String)>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: "dotnet-script".to_string(),
            script_args: vec!["{source}".to_string()],
            program_args: vec!["{source}".to_string()],
            reference_arg: "-r".to_string(),
            check_args: None,
            source_extension: "csx".to_string(),
            diagnostic_pattern: DEFAULT_DIAGNOSTIC_PATTERN.to_string(),
            env_vars: Vec::new(),
        }
    }
}

/// MSBuild-style `file(line,col): error CODE: message`
pub const DEFAULT_DIAGNOSTIC_PATTERN: &str = r"(?m)^(?:.*?)\((?P<line>\d+),(?P<col>\d+)\):\s*(?P<severity>error|warning|info)\s*(?P<code>[A-Za-z]+\d+)?:\s*(?P<message>.*)$";

/// Package resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagesConfig {
    /// Local package cache (defaults to `<cache dir>/packages`)
    pub cache_dir: Option<PathBuf>,
    /// Base URL of the package archive registry
    pub registry_url: Option<String>,
    /// Never hit the network, only the local cache
    pub offline: bool,
    /// Download timeout in seconds
    pub timeout_seconds: u64,
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            registry_url: None,
            offline: false,
            timeout_seconds: 60,
        }
    }
}
