//! Session Configuration
//!
//! Loaded from YAML, with environment overrides applied on top.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigurationError;

pub const ENV_TEST_ISOLATION: &str = "SESSION_TEST_ISOLATION";
pub const ENV_CLEAR_BETWEEN_TESTS: &str = "SESSION_CLEAR_BETWEEN_TESTS";
pub const ENV_MAX_QUEUE_STEPS: &str = "SESSION_MAX_QUEUE_STEPS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Clear applied browser state before each test.
    #[serde(default = "default_true")]
    pub clear_session_between_tests: bool,

    /// When off, state is never cleared between tests regardless of the flag above.
    #[serde(default = "default_true")]
    pub test_isolation: bool,

    /// Upper bound on queue ticks per `run_session` drive.
    #[serde(default = "default_max_queue_steps")]
    pub max_queue_steps: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_queue_steps() -> usize {
    10_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            clear_session_between_tests: true,
            test_isolation: true,
            max_queue_steps: default_max_queue_steps(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigurationError::Load(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string (for testing)
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigurationError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigurationError::Load(e.to_string()))
    }

    /// Apply `SESSION_*` environment overrides.
    pub fn apply_env(self) -> Result<Self, ConfigurationError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_TEST_ISOLATION) {
            self.test_isolation = parse_bool(ENV_TEST_ISOLATION, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CLEAR_BETWEEN_TESTS) {
            self.clear_session_between_tests = parse_bool(ENV_CLEAR_BETWEEN_TESTS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_QUEUE_STEPS) {
            self.max_queue_steps = raw.trim().parse().map_err(|_| {
                ConfigurationError::Load(format!("{ENV_MAX_QUEUE_STEPS} must be a number, got `{raw}`"))
            })?;
        }
        Ok(self)
    }

    /// Whether applied state is cleared before each test.
    pub fn clears_between_tests(&self) -> bool {
        self.test_isolation && self.clear_session_between_tests
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigurationError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(ConfigurationError::Load(format!(
            "{key} must be a boolean, got `{raw}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn missing_fields_take_defaults() {
        let config = SessionConfig::from_yaml("test_isolation: false\n").unwrap();
        assert!(!config.test_isolation);
        assert!(config.clear_session_between_tests);
        assert_eq!(config.max_queue_steps, 10_000);
        assert!(!config.clears_between_tests());
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "clear_session_between_tests: false").unwrap();
        writeln!(file, "max_queue_steps: 50").unwrap();

        let config = SessionConfig::load(file.path()).unwrap();
        assert!(!config.clear_session_between_tests);
        assert_eq!(config.max_queue_steps, 50);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = SessionConfig::load(dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigurationError::Load(_)));
    }

    #[test]
    fn overrides_replace_file_values() {
        let env: HashMap<&str, &str> = [(ENV_TEST_ISOLATION, "off"), (ENV_MAX_QUEUE_STEPS, "7")]
            .into_iter()
            .collect();
        let config = SessionConfig::default()
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert!(!config.test_isolation);
        assert_eq!(config.max_queue_steps, 7);

        let err = SessionConfig::default()
            .apply_overrides(|key| (key == ENV_CLEAR_BETWEEN_TESTS).then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_CLEAR_BETWEEN_TESTS));
    }
}
