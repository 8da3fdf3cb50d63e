//! Tracing setup for binaries embedding the job subsystem

use tracing::Level;
use tracing_subscriber::fmt;

use crate::config::LogConfig;
use crate::error::{JobError, Result};

/// Parse a level name
pub fn parse_level(level: &str) -> Result<Level> {
    match level.trim().to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(JobError::InvalidConfig(format!("unknown log level: {other}"))),
    }
}

/// Install a stderr subscriber.
///
/// Returns `Ok(false)` when a global subscriber was already installed, which
/// happens when the host application sets up tracing itself.
pub fn init(config: &LogConfig) -> Result<bool> {
    let level = parse_level(&config.level)?;

    let installed = fmt()
        .with_max_level(level)
        .with_target(config.debug)
        .with_thread_ids(config.debug)
        .with_file(config.debug)
        .with_line_number(config.debug)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();

    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_level(" WARN ").unwrap(), Level::WARN);
        assert!(matches!(
            parse_level("loud"),
            Err(JobError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LogConfig::default();
        let first = init(&config).unwrap();
        let second = init(&config).unwrap();
        assert!(!(first && second));
    }

    #[test]
    fn test_init_rejects_bad_level() {
        let config = LogConfig {
            level: "verbose".to_string(),
            debug: true,
        };
        assert!(init(&config).is_err());
    }
}
