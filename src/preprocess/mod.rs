//! Source-to-source rewrites applied before a submission reaches the backend.
//!
//! Both transforms are total: input that cannot be tokenized is returned as is.

pub mod rewriter;
pub mod wrapper;

use serde::{Deserialize, Serialize};

pub use rewriter::rewrite_unsupported;
pub use wrapper::{is_wrapped_program, strip_program_wrapper};

/// A call the sandbox cannot honour, e.g. `Console.Clear()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsupportedCall {
    pub receiver: String,
    pub method: String,
    /// Expression substituted when the call is used as a value
    pub replacement: String,
}

impl UnsupportedCall {
    pub fn new(
        receiver: impl Into<String>,
        method: impl Into<String>,
        replacement: impl Into<String>,
    ) -> Self {
        Self {
            receiver: receiver.into(),
            method: method.into(),
            replacement: replacement.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessRules {
    pub unsupported_calls: Vec<UnsupportedCall>,
    /// Imports dropped from the source, nested namespaces included
    pub removed_namespaces: Vec<String>,
}

impl Default for PreprocessRules {
    fn default() -> Self {
        Self {
            unsupported_calls: vec![
                UnsupportedCall::new("Console", "Clear", "null"),
                UnsupportedCall::new("Console", "ReadKey", "default(System.ConsoleKeyInfo)"),
            ],
            removed_namespaces: vec!["System.IO".to_string()],
        }
    }
}
