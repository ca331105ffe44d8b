use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::RunpadError;
use crate::model::Diagnostic;
use crate::storage::StorageSession;
use crate::streaming::{ConsoleWriter, InputSource};

/// How a prepared submission is run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramKind {
    /// Top-level statements / expression evaluation.
    Script,
    /// A complete program whose entry point is looked up and invoked.
    WrappedProgram {
        entry_class: String,
        entry_method: String,
    },
}

/// Everything a backend needs to build a submission.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub source: String,
    pub kind: ProgramKind,
    pub references: Vec<PathBuf>,
    pub language_version: String,
}

/// A successfully compiled submission, ready to invoke.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub id: String,
    pub kind: ProgramKind,
    pub source: String,
    pub references: Vec<PathBuf>,
    pub language_version: String,
    /// Backend-specific location of the built form, if any.
    pub location: Option<PathBuf>,
}

impl Artifact {
    pub fn from_request(request: &CompileRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            kind: request.kind.clone(),
            source: request.source.clone(),
            references: request.references.clone(),
            language_version: request.language_version.clone(),
            location: None,
        }
    }
}

/// The console and storage a program sees for the length of one invocation.
pub struct ProgramIo {
    pub stdout: Arc<dyn ConsoleWriter>,
    pub stderr: Arc<dyn ConsoleWriter>,
    pub stdin: Arc<dyn InputSource>,
    pub storage: StorageSession,
    /// Tripped on explicit cancellation or timeout.
    pub cancel: CancellationToken,
}

/// What a finished invocation hands back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    /// Value of the final expression of a script, if it produced one.
    pub value: Option<serde_json::Value>,
}

impl ExecutionOutcome {
    pub fn with_value(value: serde_json::Value) -> Self {
        Self { value: Some(value) }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Compilation failed with {} diagnostic(s)", .0.len())]
    Compile(Vec<Diagnostic>),

    #[error("{0}")]
    Runtime(String),

    #[error("Interactive mode is required to read from console")]
    InteractiveRequired,

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Execution timed out")]
    Timeout,

    #[error(transparent)]
    Internal(RunpadError),
}

impl From<RunpadError> for BackendError {
    fn from(err: RunpadError) -> Self {
        match err {
            RunpadError::InteractiveModeRequired => Self::InteractiveRequired,
            RunpadError::InputCancelled { .. } => Self::Cancelled,
            RunpadError::InputTimeout { .. } | RunpadError::ExecutionTimeout { .. } => Self::Timeout,
            other => Self::Internal(other),
        }
    }
}

/// Compiles and runs prepared source against a reference set.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Backend name, e.g. "process"
    fn name(&self) -> &str;

    /// Build the submission; error diagnostics come back as [`BackendError::Compile`].
    async fn compile(&self, request: &CompileRequest) -> Result<Artifact, BackendError>;

    /// Run a compiled artifact with the given console and storage.
    async fn invoke(
        &self,
        artifact: &Artifact,
        io: &ProgramIo,
    ) -> Result<ExecutionOutcome, BackendError>;

    /// Check the backend can accept work.
    /// Default implementation reports healthy.
    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_errors_map_to_outcomes() {
        assert!(matches!(
            BackendError::from(RunpadError::InteractiveModeRequired),
            BackendError::InteractiveRequired
        ));
        assert!(matches!(
            BackendError::from(RunpadError::InputCancelled { id: "s".into() }),
            BackendError::Cancelled
        ));
        assert!(matches!(
            BackendError::from(RunpadError::AccessDenied { path: "..".into() }),
            BackendError::Internal(RunpadError::AccessDenied { .. })
        ));
    }

    #[test]
    fn test_compile_error_message() {
        let err = BackendError::Compile(vec![Diagnostic::error("x", 1, 1)]);
        assert_eq!(err.to_string(), "Compilation failed with 1 diagnostic(s)");
    }
}
