use std::path::Path;
use std::{fs, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("cannot read configuration file")]
    Read(#[from] io::Error),

    #[error("malformed configuration file")]
    Parse(#[from] toml::de::Error),
}

/// Tunables of a benchmark session, read from the `[udverbs]` table of a
/// TOML file. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    /// RDMA device name, matched exactly.
    pub device: String,

    /// Number of ring slots, which is also the number of requests kept
    /// outstanding.
    pub queue_depth: usize,

    /// Payload bytes per datagram.
    pub message_size: usize,

    /// Maximum completions drained per poll.
    pub poll_batch: usize,

    /// Idle backoff bounds, in microseconds.
    pub backoff_min_us: u64,
    pub backoff_max_us: u64,

    /// Interval between throughput reports, in milliseconds. Zero disables
    /// reporting.
    pub report_interval_ms: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            device: "mlx5_0".to_owned(),
            queue_depth: 20,
            message_size: 1024,
            poll_batch: 10,
            backoff_min_us: 1,
            backoff_max_us: 1000,
            report_interval_ms: 1000,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    udverbs: BenchConfig,
}

impl BenchConfig {
    /// Parse the `[udverbs]` table of a TOML document. A missing table
    /// yields the defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigFileError> {
        let file: ConfigFile = toml::from_str(s)?;
        Ok(file.udverbs)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let text = fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&text)?;
        log::debug!("loaded configuration from {}: {:?}", path.as_ref().display(), config);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BenchConfig::from_toml_str("").unwrap();
        assert_eq!(config, BenchConfig::default());
        assert_eq!(config.queue_depth, 20);
        assert_eq!(config.poll_batch, 10);
    }

    #[test]
    fn test_partial_override() {
        let config = BenchConfig::from_toml_str(
            r#"
            [udverbs]
            device = "rxe0"
            message_size = 4000
            "#,
        )
        .unwrap();
        assert_eq!(config.device, "rxe0");
        assert_eq!(config.message_size, 4000);
        assert_eq!(config.queue_depth, 20);
        assert_eq!(config.backoff_max_us, 1000);
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = BenchConfig::from_toml_str("[udverbs]\nqueue_dpeth = 3\n").unwrap_err();
        assert!(matches!(err, ConfigFileError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = BenchConfig::load("/nonexistent/udverbs.toml").unwrap_err();
        assert!(matches!(err, ConfigFileError::Read(_)));
    }
}
