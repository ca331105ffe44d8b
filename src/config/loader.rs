use std::path::{Path, PathBuf};

use tracing::debug;

use crate::analysis::SafetyPolicy;
use crate::config::types::RunpadConfig;
use crate::error::{Result, RunpadError};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "runpad", "runpad") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        dirs_fallback().join(".runpad").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(config_path: Option<&Path>) -> Result<RunpadConfig> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        // An explicitly requested file must exist
        if config_path.is_some() {
            return Err(RunpadError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        return Ok(RunpadConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let mut config = parse_config(&content)?;

    if let Some(policy_file) = config.safety.policy_file.clone() {
        let policy_path = if policy_file.is_relative() {
            path.parent()
                .map(|dir| dir.join(&policy_file))
                .unwrap_or(policy_file)
        } else {
            policy_file
        };
        let extra = load_policy_file(&policy_path)?;
        config.safety.policy.merge(extra);
        debug!(path = %policy_path.display(), "Merged safety policy file");
    }

    Ok(config)
}

/// Parse and validate a configuration document
pub fn parse_config(content: &str) -> Result<RunpadConfig> {
    let config: RunpadConfig =
        toml::from_str(content).map_err(|e| RunpadError::TomlParse(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

/// Load a standalone safety policy table
pub fn load_policy_file(path: &Path) -> Result<SafetyPolicy> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| RunpadError::TomlParse(e.to_string()))
}

fn validate(config: &RunpadConfig) -> Result<()> {
    if config.execution.max_output_bytes == 0 {
        return Err(RunpadError::Config(
            "execution.max_output_bytes must be greater than zero".to_string(),
        ));
    }
    if config.execution.max_concurrent_executions == 0 {
        return Err(RunpadError::Config(
            "execution.max_concurrent_executions must be greater than zero".to_string(),
        ));
    }
    if config.execution.entry_class.trim().is_empty()
        || config.execution.entry_method.trim().is_empty()
    {
        return Err(RunpadError::Config(
            "execution.entry_class and execution.entry_method must not be empty".to_string(),
        ));
    }
    if let Err(e) = regex::Regex::new(&config.backend.diagnostic_pattern) {
        return Err(RunpadError::Config(format!(
            "backend.diagnostic_pattern is not a valid regex: {}",
            e
        )));
    }
    Ok(())
}

/// Get the cache directory (package downloads)
pub fn get_cache_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "runpad", "runpad") {
        proj_dirs.cache_dir().to_path_buf()
    } else {
        dirs_fallback().join(".cache").join("runpad")
    }
}

/// Get the data directory (default sandbox root)
pub fn get_data_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "runpad", "runpad") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        dirs_fallback().join(".local").join("share").join("runpad")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let defaults = RunpadConfig::default();
        assert_eq!(defaults.execution.max_output_bytes, 1024 * 1024);
        assert_eq!(defaults.storage.max_file_size, 1024 * 1024);
        assert!(defaults.execution.gate_batch);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let err = load_config(Some(Path::new("/nonexistent/runpad.toml"))).unwrap_err();
        assert!(matches!(err, RunpadError::Config(_)));
    }

    #[test]
    fn test_parse_partial_config() {
        let config = parse_config(
            r#"
            [execution]
            max_output_bytes = 2048
            gate_batch = false

            [safety]
            restricted_namespaces = ["System.Net"]

            [safety.dangerous_apis]
            "System.Console.Beep" = "Beeping is not allowed."
            "#,
        )
        .unwrap();
        assert_eq!(config.execution.max_output_bytes, 2048);
        assert!(!config.execution.gate_batch);
        assert_eq!(config.safety.policy.restricted_namespaces, vec!["System.Net"]);
        assert_eq!(
            config.safety.policy.dangerous_apis.get("System.Console.Beep").map(String::as_str),
            Some("Beeping is not allowed.")
        );
        assert_eq!(config.execution.entry_class, "Program");
    }

    #[test]
    fn test_rejects_zero_output_quota() {
        let err = parse_config("[execution]\nmax_output_bytes = 0\n").unwrap_err();
        assert!(matches!(err, RunpadError::Config(_)));
    }

    #[test]
    fn test_policy_file_is_merged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("policy.toml"),
            "restricted_namespaces = [\"Contoso.Secrets\"]\n",
        )
        .unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(&config_path, "[safety]\npolicy_file = \"policy.toml\"\n").unwrap();

        let config = load_config(Some(&config_path)).unwrap();
        let namespaces = &config.safety.policy.restricted_namespaces;
        assert!(namespaces.iter().any(|ns| ns == "Contoso.Secrets"));
        assert!(namespaces.iter().any(|ns| ns == "System.IO"));
    }
}
