//! Main configuration module for Lodestone
//!
//! Every setting the light client needs is defined in one `lodestone.toml`
//! file and consumed once when the client is constructed.

use crate::error::{ConfigError, ConfigResult};
use crate::Hash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration struct containing all Lodestone settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Chain identity configuration
    pub chain: ChainConfig,

    /// Trust root and trust window
    pub trust: TrustConfig,

    /// Primary and witness peers
    pub peers: PeersConfig,

    /// Verification strategy settings
    #[serde(default)]
    pub verification: VerificationConfig,

    /// Declared quorum rotations, keyed by activation height
    #[serde(default)]
    pub quorum_rotations: BTreeMap<String, String>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use lodestone_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::load(Path::new("lodestone.toml"))?;
    /// ```
    pub fn load(path: &Path) -> ConfigResult<Self> {
        info!("Loading configuration from {:?}", path);

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content)?;

        debug!("Configuration parsed successfully, validating...");
        config.validate()?;

        info!(
            "Configuration loaded: chain_id={}, checkpoint={}, witnesses={}",
            config.chain.chain_id,
            config.trust.checkpoint_height,
            config.peers.witnesses.len()
        );

        Ok(config)
    }

    /// Load configuration from a TOML string.
    ///
    /// Useful for testing or when configuration is provided as a string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        self.chain.validate()?;
        self.trust.validate()?;
        self.peers.validate()?;
        self.verification.validate()?;
        self.quorum_rotation_schedule()?;
        self.logging.validate()?;

        debug!("Configuration validation passed");
        Ok(())
    }

    /// Parse the declared rotation table into heights and hashes.
    pub fn quorum_rotation_schedule(&self) -> ConfigResult<BTreeMap<u64, Hash>> {
        let mut schedule = BTreeMap::new();
        for (height, quorum_hash) in &self.quorum_rotations {
            let parsed = height
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|h| *h > 0)
                .ok_or_else(|| ConfigError::InvalidRotationHeight(height.clone()))?;
            schedule.insert(parsed, parse_hash("quorum rotation hash", quorum_hash)?);
        }
        Ok(schedule)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }
}

/// Parse a 32-byte hex hash, with or without a `0x` prefix.
pub fn parse_hash(name: &'static str, value: &str) -> ConfigResult<Hash> {
    let stripped = value.trim().trim_start_matches("0x");
    let bytes = hex::decode(stripped).map_err(|_| ConfigError::InvalidHash {
        name,
        value: value.to_string(),
    })?;
    bytes.try_into().map_err(|_| ConfigError::InvalidHash {
        name,
        value: value.to_string(),
    })
}

// =============================================================================
// Chain Configuration
// =============================================================================

/// Chain identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain identifier every verified bundle must carry
    pub chain_id: String,
}

impl ChainConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.chain_id.trim().is_empty() {
            return Err(ConfigError::InvalidChainId);
        }
        Ok(())
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: "lodestone-local".to_string(),
        }
    }
}

// =============================================================================
// Trust Configuration
// =============================================================================

/// Trust window and the out-of-band root of trust.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Maximum age of a trusted bundle, in seconds
    pub trust_period_secs: u64,

    /// Tolerance for future-dated bundles, in seconds
    #[serde(default = "default_clock_drift")]
    pub max_clock_drift_secs: u64,

    /// Height of the trusted checkpoint
    pub checkpoint_height: u64,

    /// Block identifier of the trusted checkpoint (hex)
    pub checkpoint_hash: String,
}

fn default_clock_drift() -> u64 {
    10
}

impl TrustConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.trust_period_secs == 0 {
            return Err(ConfigError::InvalidTrustPeriod);
        }
        if self.checkpoint_height == 0 {
            return Err(ConfigError::InvalidCheckpointHeight);
        }
        self.checkpoint_hash()?;
        Ok(())
    }

    /// Trust period as a duration
    pub fn trust_period(&self) -> Duration {
        Duration::from_secs(self.trust_period_secs)
    }

    /// Allowed clock drift as a duration
    pub fn max_clock_drift(&self) -> Duration {
        Duration::from_secs(self.max_clock_drift_secs)
    }

    /// Decoded checkpoint hash
    pub fn checkpoint_hash(&self) -> ConfigResult<Hash> {
        parse_hash("checkpoint_hash", &self.checkpoint_hash)
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            trust_period_secs: 14 * 24 * 60 * 60, // two weeks
            max_clock_drift_secs: default_clock_drift(),
            checkpoint_height: 1,
            checkpoint_hash: hex::encode([0u8; 32]),
        }
    }
}

// =============================================================================
// Peers Configuration
// =============================================================================

/// Primary and witness peers, plus the per-call network budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersConfig {
    /// Peer that drives verification
    pub primary: String,

    /// Independent peers used for cross-checking
    #[serde(default)]
    pub witnesses: Vec<String>,

    /// Faults tolerated before a witness is dropped
    #[serde(default = "default_fault_threshold")]
    pub witness_fault_threshold: u32,

    /// Timeout for a single primary request (milliseconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Timeout for a single witness request (milliseconds)
    #[serde(default = "default_witness_timeout")]
    pub witness_timeout_ms: u64,

    /// Retries per primary request, after the first attempt, before failover
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between attempts (milliseconds)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_fault_threshold() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_witness_timeout() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    500
}

impl PeersConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.primary.trim().is_empty() {
            return Err(ConfigError::EmptyPeerId);
        }

        let mut seen = HashSet::new();
        for witness in &self.witnesses {
            if witness.trim().is_empty() {
                return Err(ConfigError::EmptyPeerId);
            }
            if *witness == self.primary {
                return Err(ConfigError::PrimaryIsWitness(witness.clone()));
            }
            if !seen.insert(witness.as_str()) {
                return Err(ConfigError::DuplicateWitness(witness.clone()));
            }
        }

        if self.witness_fault_threshold == 0 {
            return Err(ConfigError::InvalidFaultThreshold);
        }

        let timeouts = [
            ("request_timeout_ms", self.request_timeout_ms),
            ("witness_timeout_ms", self.witness_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::InvalidTimeout { name, value });
            }
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn witness_timeout(&self) -> Duration {
        Duration::from_millis(self.witness_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            primary: "primary".to_string(),
            witnesses: Vec::new(),
            witness_fault_threshold: default_fault_threshold(),
            request_timeout_ms: default_request_timeout(),
            witness_timeout_ms: default_witness_timeout(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

// =============================================================================
// Verification Configuration
// =============================================================================

/// How the client extends trust forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMode {
    /// Jump straight to the target and bisect on quorum discontinuity.
    ///
    /// Only the target and bisection pivots are fetched and checked; heights
    /// in between are never seen.
    #[default]
    Skipping,
    /// Verify every intermediate height
    Sequential,
}

/// Verification strategy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Forward verification mode
    #[serde(default)]
    pub mode: VerificationMode,

    /// Number of bundles kept in the trust store (0 = unlimited)
    #[serde(default = "default_pruning_size")]
    pub pruning_size: usize,

    /// Deadline for a whole verification call (milliseconds)
    #[serde(default)]
    pub max_operation_time_ms: Option<u64>,
}

fn default_pruning_size() -> usize {
    1000
}

impl VerificationConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(value) = self.max_operation_time_ms {
            if value == 0 {
                return Err(ConfigError::InvalidTimeout {
                    name: "max_operation_time_ms",
                    value,
                });
            }
        }
        Ok(())
    }

    pub fn max_operation_time(&self) -> Option<Duration> {
        self.max_operation_time_ms.map(Duration::from_millis)
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            mode: VerificationMode::default(),
            pruning_size: default_pruning_size(),
            max_operation_time_ms: None,
        }
    }
}

// =============================================================================
// Logging Configuration
// =============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, compact, json)
    pub format: String,
}

impl LoggingConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.level.clone()));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.format.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogFormat(self.format.clone()));
        }

        Ok(())
    }

    /// Default filter: the configured level globally and for this
    /// workspace's crates.
    pub fn filter_directive(&self) -> String {
        format!(
            "{level},lodestone_light_client={level},lodestone_config={level}",
            level = self.level
        )
    }

    /// Install the global tracing subscriber.
    ///
    /// `RUST_LOG` takes precedence over the configured level.
    pub fn init_tracing(&self) -> ConfigResult<()> {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};

        self.validate()?;

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.filter_directive()));

        let result = match self.format.to_lowercase().as_str() {
            "json" => tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(env_filter)
                .try_init(),
            "compact" => tracing_subscriber::registry()
                .with(fmt::layer().compact())
                .with(env_filter)
                .try_init(),
            _ => tracing_subscriber::registry()
                .with(fmt::layer().with_target(true))
                .with(env_filter)
                .try_init(),
        };

        result.map_err(|e| ConfigError::LoggingInit(e.to_string()))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
