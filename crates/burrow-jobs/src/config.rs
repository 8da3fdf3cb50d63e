//! Jobs configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{JobError, Result};

/// Environment variable prefix for overrides (`BURROW_JOBS_POLL_INTERVAL_MS=5`)
pub const ENV_PREFIX: &str = "BURROW_JOBS";

#[cfg(unix)]
const DEFAULT_APP_SHELL: &str = "/bin/sh";
#[cfg(windows)]
const DEFAULT_APP_SHELL: &str = "cmd";

#[cfg(unix)]
const DEFAULT_SHELL_FLAG: &str = "-c";
#[cfg(windows)]
const DEFAULT_SHELL_FLAG: &str = "/C";

/// Configuration of the background job subsystem
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobsConfig {
    /// Shell used for commands the application runs on its own behalf
    pub app_shell: String,
    /// Override for the user's shell (None = `$SHELL` or a fallback)
    pub user_shell: Option<String>,
    /// Flag that makes the shell run a command string
    pub shell_flag: String,
    /// Upper bound on how long a wait loop sleeps between checks
    pub poll_interval_ms: u64,
    /// Logging configuration
    pub log: LogConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Maximum level: trace, debug, info, warn or error
    pub level: String,
    /// Include targets, thread ids and source locations
    pub debug: bool,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            app_shell: DEFAULT_APP_SHELL.to_string(),
            user_shell: None,
            shell_flag: DEFAULT_SHELL_FLAG.to_string(),
            poll_interval_ms: 10,
            log: LogConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            debug: false,
        }
    }
}

impl JobsConfig {
    /// Load configuration from an optional TOML file layered with environment variables
    pub fn load(path: &Path) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::from(path.to_path_buf()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: JobsConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from [`JobsConfig::default_path`]
    pub fn load_default() -> Result<Self> {
        Self::load(&Self::default_path())
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("burrow")
            .join("jobs.toml")
    }

    /// Reject values the subsystem cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(JobError::InvalidConfig(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.app_shell.trim().is_empty() {
            return Err(JobError::InvalidConfig(
                "app_shell must not be empty".to_string(),
            ));
        }
        if matches!(&self.user_shell, Some(shell) if shell.trim().is_empty()) {
            return Err(JobError::InvalidConfig(
                "user_shell must not be empty when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Wait-loop granularity
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = JobsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = JobsConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(JobError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_empty_user_shell_rejected() {
        let config = JobsConfig {
            user_shell: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = JobsConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.app_shell, JobsConfig::default().app_shell);
    }

    #[test]
    #[serial]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "poll_interval_ms = 25").unwrap();
        writeln!(file, "user_shell = \"/bin/bash\"").unwrap();
        writeln!(file, "[log]").unwrap();
        writeln!(file, "level = \"debug\"").unwrap();
        drop(file);

        let config = JobsConfig::load(&path).unwrap();
        assert_eq!(config.poll_interval_ms, 25);
        assert_eq!(config.user_shell.as_deref(), Some("/bin/bash"));
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.shell_flag, JobsConfig::default().shell_flag);
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.toml");
        std::fs::write(&path, "poll_interval_ms = 25\n").unwrap();

        std::env::set_var("BURROW_JOBS_POLL_INTERVAL_MS", "40");
        std::env::set_var("BURROW_JOBS_LOG__LEVEL", "warn");
        let config = JobsConfig::load(&path);
        std::env::remove_var("BURROW_JOBS_POLL_INTERVAL_MS");
        std::env::remove_var("BURROW_JOBS_LOG__LEVEL");

        let config = config.unwrap();
        assert_eq!(config.poll_interval_ms, 40);
        assert_eq!(config.log.level, "warn");
    }

    #[test]
    #[serial]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.toml");
        std::fs::write(&path, "poll_interval_ms = 0\n").unwrap();

        assert!(JobsConfig::load(&path).is_err());
    }
}
