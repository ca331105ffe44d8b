use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunpadError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Sandboxed storage errors
    #[error("Access denied for path: {path}")]
    AccessDenied { path: String },

    #[error("File size {size} exceeds maximum allowed size of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Appending {appended} bytes to {path} would exceed maximum allowed size of {max} bytes")]
    AppendTooLarge {
        path: String,
        appended: u64,
        max: u64,
    },

    // Session errors
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Session already has an execution in flight: {id}")]
    SessionBusy { id: String },

    #[error("A session id is required for streaming execution")]
    SessionIdMissing,

    // Interactive I/O errors
    #[error("Interactive mode is required to read from console")]
    InteractiveModeRequired,

    #[error("Input wait cancelled for session {id}")]
    InputCancelled { id: String },

    #[error("No input received within {seconds} seconds")]
    InputTimeout { seconds: u64 },

    // Execution errors
    #[error("Execution timed out after {seconds} seconds")]
    ExecutionTimeout { seconds: u64 },

    #[error("Backend '{backend}' is not available: {reason}")]
    BackendNotAvailable { backend: String, reason: String },

    // Package errors
    #[error("Package not found: {id} {version}")]
    PackageNotFound { id: String, version: String },

    #[error("Failed to download package: {url}")]
    PackageDownload { url: String },

    #[error("Invalid package id '{id}'")]
    InvalidPackageId { id: String },

    #[error("Invalid package version '{version}' for {id}")]
    InvalidPackageVersion { id: String, version: String },

    // Server errors
    #[error("Server error: {0}")]
    Server(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // HTTP errors
    #[cfg(feature = "registry")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunpadError {
    pub fn is_retryable(&self) -> bool {
        #[cfg(feature = "registry")]
        if let Self::Http(e) = self {
            return e.is_timeout() || e.is_connect();
        }
        matches!(
            self,
            Self::ExecutionTimeout { .. } | Self::InputTimeout { .. } | Self::PackageDownload { .. }
        )
    }

    /// Whether this error is a sandbox escape attempt rather than an ordinary I/O failure.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied { .. })
    }
}

pub type Result<T> = std::result::Result<T, RunpadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(RunpadError::ExecutionTimeout { seconds: 5 }.is_retryable());
        assert!(RunpadError::PackageDownload {
            url: "https://example.invalid".to_string()
        }
        .is_retryable());
        assert!(!RunpadError::InteractiveModeRequired.is_retryable());
        assert!(!RunpadError::InvalidPackageId {
            id: "../x".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_access_denied_message() {
        let err = RunpadError::AccessDenied {
            path: "../etc/passwd".to_string(),
        };
        assert!(err.is_access_denied());
        assert_eq!(err.to_string(), "Access denied for path: ../etc/passwd");
    }
}
