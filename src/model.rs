//! Wire and domain types shared by the orchestrator, the streaming channel and the server.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A package the submitted code depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageRef {
    pub id: String,
    pub version: String,
}

impl PackageRef {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }

    /// Deduplication key, case-insensitive on the id.
    pub fn key(&self) -> String {
        format!("{}:{}", self.id.to_lowercase(), self.version.to_lowercase())
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// A submission. Immutable once accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionRequest {
    pub code: String,
    /// Target runtime / language-version tag, e.g. `.net8.0`.
    #[serde(alias = "compiler_version")]
    pub runtime: String,
    pub packages: Vec<PackageRef>,
    pub session_id: Option<String>,
    pub interactive: bool,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, runtime: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            runtime: runtime.into(),
            ..Default::default()
        }
    }

    pub fn with_packages(mut self, packages: Vec<PackageRef>) -> Self {
        self.packages = packages;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>, interactive: bool) -> Self {
        self.session_id = Some(session_id.into());
        self.interactive = interactive;
        self
    }
}

/// Kind of an observable unit of program behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputKind {
    Text,
    StructuredData,
    Collection,
    CompileError,
    RuntimeError,
    ConsoleInputRequest,
    Markup,
    BinaryFile,
}

impl OutputKind {
    pub fn is_error(self) -> bool {
        matches!(self, Self::CompileError | Self::RuntimeError)
    }
}

/// Failure taxonomy carried in the `category` metadata of error outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    Validation,
    CompileError,
    RuntimeError,
    SafetyViolation,
    InteractiveRequired,
    QuotaExceeded,
    SandboxViolation,
    Cancelled,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::CompileError => "compile-error",
            Self::RuntimeError => "runtime-error",
            Self::SafetyViolation => "safety-violation",
            Self::InteractiveRequired => "interactive-required",
            Self::QuotaExceeded => "quota-exceeded",
            Self::SandboxViolation => "sandbox-violation",
            Self::Cancelled => "cancelled",
        }
    }
}

pub const META_CATEGORY: &str = "category";
pub const META_SIZE: &str = "size";
pub const META_CONTENT_TYPE: &str = "content_type";
pub const META_PATH: &str = "path";

/// A unit of observable behaviour. Append-only once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub kind: OutputKind,
    pub content: String,
    /// Set only by the per-character writer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub char_content: Option<char>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ExecutionOutput {
    pub fn new(kind: OutputKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            char_content: None,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(OutputKind::Text, content)
    }

    /// One character of program output, for lowest-latency echo.
    pub fn character(c: char) -> Self {
        let mut output = Self::new(OutputKind::Text, c.to_string());
        output.char_content = Some(c);
        output
    }

    pub fn input_request() -> Self {
        Self::new(OutputKind::ConsoleInputRequest, "")
    }

    /// An error output tagged with its failure category.
    pub fn failure(kind: OutputKind, category: ErrorCategory, content: impl Into<String>) -> Self {
        Self::new(kind, content).with_metadata(META_CATEGORY, category.as_str())
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn category(&self) -> Option<&str> {
        self.metadata.get(META_CATEGORY).map(String::as_str)
    }
}

/// Metrics captured regardless of outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub compile_duration_ms: u64,
    pub execution_duration_ms: u64,
    pub peak_memory_bytes: u64,
    pub output_count: usize,
}

/// The single result envelope of one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub outputs: Vec<ExecutionOutput>,
    /// Absolute sandboxed paths of artifacts produced by the program.
    pub files: Vec<String>,
    pub metrics: ExecutionMetrics,
    pub runtime: String,
}

impl ExecutionResult {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            ..Default::default()
        }
    }

    /// Outputs of the given kind, in order.
    pub fn outputs_of(&self, kind: OutputKind) -> impl Iterator<Item = &ExecutionOutput> {
        self.outputs.iter().filter(move |o| o.kind == kind)
    }
}

/// Severity of a compiler diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        };
        f.write_str(s)
    }
}

/// A compiler diagnostic with its source span (1-based lines and columns).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            code: None,
            start_line: line,
            start_column: column,
            end_line: line,
            end_column: column,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{}): {}",
            self.start_line, self.start_column, self.severity
        )?;
        if let Some(code) = &self.code {
            write!(f, " {}", code)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Result of a safety analysis. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub is_safe: bool,
    pub warnings: Vec<String>,
}

impl SafetyVerdict {
    pub fn from_warnings(warnings: Vec<String>) -> Self {
        Self {
            is_safe: warnings.is_empty(),
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_kind_wire_names() {
        let json = serde_json::to_string(&OutputKind::ConsoleInputRequest).unwrap();
        assert_eq!(json, "\"console-input-request\"");
        let kind: OutputKind = serde_json::from_str("\"structured-data\"").unwrap();
        assert_eq!(kind, OutputKind::StructuredData);
    }

    #[test]
    fn test_request_accepts_compiler_version_alias() {
        let request: ExecutionRequest = serde_json::from_str(
            r#"{"code":"1+1","compiler_version":".net8.0","packages":[{"id":"Humanizer","version":"2.14.1"}]}"#,
        )
        .unwrap();
        assert_eq!(request.runtime, ".net8.0");
        assert_eq!(request.packages[0].key(), "humanizer:2.14.1");
        assert!(!request.interactive);
    }

    #[test]
    fn test_diagnostic_display() {
        let mut diag = Diagnostic::error("; expected", 3, 14);
        diag.code = Some("CS1002".to_string());
        assert_eq!(diag.to_string(), "(3,14): error CS1002: ; expected");
    }

    #[test]
    fn test_verdict_safe_iff_no_warnings() {
        assert!(SafetyVerdict::from_warnings(vec![]).is_safe);
        assert!(!SafetyVerdict::from_warnings(vec!["x".to_string()]).is_safe);
    }
}
