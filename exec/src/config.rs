//! Supervisor configuration.

use crate::error::{Error, Result};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable a launched child reads its control descriptor from.
pub const DEFAULT_CTRL_FD_ENV: &str = "VESSEL_CTRL_FD";

/// Number of kernel events drained per scheduler turn.
pub const DEFAULT_MAX_EVENTS: usize = 16;

/// Exit code of a child whose setup or exec failed.
pub const DEFAULT_EXEC_FAILURE_CODE: i32 = 127;

/// Supervisor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Variable exporting the control descriptor to the child
    pub ctrl_fd_env: String,
    /// Kernel events drained per call to the multiplexer
    pub max_events_per_poll: usize,
    /// Host signals relayed to the application
    pub relay_signals: Vec<String>,
    /// Exit code used by a child that failed before exec succeeded
    pub exec_failure_code: i32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ctrl_fd_env: DEFAULT_CTRL_FD_ENV.to_string(),
            max_events_per_poll: DEFAULT_MAX_EVENTS,
            relay_signals: vec!["INT".to_string(), "TERM".to_string(), "HUP".to_string()],
            exec_failure_code: DEFAULT_EXEC_FAILURE_CODE,
        }
    }
}

impl SupervisorConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SupervisorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Save the configuration to a TOML file.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::ConfigError(e.to_string()))
    }

    /// Check that every field holds a usable value.
    pub fn validate(&self) -> Result<()> {
        if self.max_events_per_poll == 0 {
            return Err(Error::ConfigError(
                "max_events_per_poll must be at least 1".to_string(),
            ));
        }

        if self.ctrl_fd_env.is_empty() || self.ctrl_fd_env.contains('=') {
            return Err(Error::ConfigError(format!(
                "invalid control descriptor variable name: {:?}",
                self.ctrl_fd_env
            )));
        }

        if !(0..=255).contains(&self.exec_failure_code) {
            return Err(Error::ConfigError(format!(
                "exec_failure_code out of range: {}",
                self.exec_failure_code
            )));
        }

        self.signals().map(|_| ())
    }

    /// Resolve the configured relay signal names.
    pub fn signals(&self) -> Result<Vec<Signal>> {
        self.relay_signals
            .iter()
            .map(|name| parse_signal(name))
            .collect()
    }
}

/// Parse a signal name such as `INT`, `sigterm` or `SIGHUP`.
pub fn parse_signal(name: &str) -> Result<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };

    full.parse::<Signal>()
        .map_err(|_| Error::ConfigError(format!("unknown signal: {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();
        assert_eq!(config.ctrl_fd_env, "VESSEL_CTRL_FD");
        assert_eq!(config.max_events_per_poll, 16);
        assert_eq!(
            config.signals().unwrap(),
            vec![Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SupervisorConfig::from_toml_str(
            r#"
max_events_per_poll = 4
relay_signals = ["sigterm", "usr1"]
"#,
        )
        .unwrap();

        assert_eq!(config.max_events_per_poll, 4);
        assert_eq!(config.ctrl_fd_env, DEFAULT_CTRL_FD_ENV);
        assert_eq!(
            config.signals().unwrap(),
            vec![Signal::SIGTERM, Signal::SIGUSR1]
        );
    }

    #[test]
    fn test_rejects_zero_batch() {
        let result = SupervisorConfig::from_toml_str("max_events_per_poll = 0");
        assert_matches!(result, Err(Error::ConfigError(_)));
    }

    #[test]
    fn test_rejects_bad_env_name() {
        let config = SupervisorConfig {
            ctrl_fd_env: "A=B".to_string(),
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::ConfigError(_)));
    }

    #[test]
    fn test_rejects_unknown_signal() {
        assert_matches!(parse_signal("NOPE"), Err(Error::ConfigError(_)));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vessel.toml");

        let config = SupervisorConfig {
            max_events_per_poll: 32,
            ..Default::default()
        };
        config.to_file(&path).unwrap();

        let loaded = SupervisorConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
