//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration loading and validation
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file at {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Failed to serialize configuration back to TOML
    #[error("Failed to serialize TOML config: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Chain identifier is empty
    #[error("Invalid chain ID: chain_id must not be empty")]
    InvalidChainId,

    /// Trust period is zero
    #[error("Invalid trust period: trust_period_secs must be positive")]
    InvalidTrustPeriod,

    /// Checkpoint height is zero
    #[error("Invalid checkpoint height: heights start at 1")]
    InvalidCheckpointHeight,

    /// A hash field is not 32 bytes of hex
    #[error("Invalid {name}: expected 32-byte hex string, got {value:?}")]
    InvalidHash { name: &'static str, value: String },

    /// A peer identifier is empty
    #[error("Invalid peer: peer identifiers must not be empty")]
    EmptyPeerId,

    /// The primary is also listed as a witness
    #[error("Primary {0} must not be listed as a witness")]
    PrimaryIsWitness(String),

    /// The same witness is listed twice
    #[error("Duplicate witness: {0}")]
    DuplicateWitness(String),

    /// Fault threshold of zero would drop witnesses on their first miss
    #[error("Invalid witness fault threshold: must be at least 1")]
    InvalidFaultThreshold,

    /// Invalid timeout configuration
    #[error("Invalid timeout: {name} must be positive, got {value}ms")]
    InvalidTimeout { name: &'static str, value: u64 },

    /// A rotation key is not a positive integer height
    #[error("Invalid quorum rotation height: {0:?}")]
    InvalidRotationHeight(String),

    /// Invalid log level
    #[error("Invalid log level: {0} (must be trace, debug, info, warn, or error)")]
    InvalidLogLevel(String),

    /// Invalid log format
    #[error("Invalid log format: {0} (must be pretty, compact, or json)")]
    InvalidLogFormat(String),

    /// Global subscriber could not be installed
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
