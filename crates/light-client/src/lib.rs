//! # Lodestone Light Client
//!
//! The verification core of a light client for quorum-signed chains. Starting
//! from an out-of-band checkpoint it extends trust to arbitrary heights using
//! quorum threshold signatures, without downloading or executing full blocks.
//!
//! ## Security Model
//!
//! The light client trusts:
//! - An initial checkpoint (height + block identifier)
//! - The signing quorums, as attested by an external quorum oracle
//!
//! It does NOT trust:
//! - The primary peer driving verification
//! - Any individual witness
//!
//! ## Architecture
//!
//! ```text
//! +---------------------+
//! |    LightClient      |  verify_at_height / trusted_height
//! +---------------------+
//!     |            |
//!     v            v
//! +----------+  +---------------------+
//! | Verifier |  | FailoverController  |  primary + witnesses, fork detection
//! +----------+  +---------------------+
//!     |            |
//!     v            v
//! +----------------+  +-------------+  +------------+
//! | QuorumVerifier |  | BlockSource |  | TrustStore |
//! +----------------+  +-------------+  +------------+
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lodestone_light_client::{LightClient, LightClientOptions, PeerSet, QuorumVerifier};
//!
//! let peers = PeerSet::new(primary, witnesses);
//! let quorum = QuorumVerifier::new(oracle, rotation);
//! let client = LightClient::new(options, peers, quorum, store).await?;
//!
//! let bundle = client.verify_at_height(1000, now).await?;
//! assert_eq!(client.trusted_height()?, 1000);
//! ```
//!
//! ## Modules
//!
//! - [`bundle`] - The signed unit of trust and its identity
//! - [`quorum`] - Quorum oracle capability, rotation schedule and signature checks
//! - [`provider`] - Block source capability and retrying fetches
//! - [`store`] - Trust store capability and an in-memory implementation
//! - [`peers`] - Primary/witness bookkeeping, failover and fork detection
//! - [`verifier`] - Structural, temporal and quorum checks for a single step
//! - [`client`] - The verification engine
//! - [`mock`] - Deterministic in-memory chain, provider and oracle

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod bundle;
pub mod client;
pub mod mock;
pub mod peers;
pub mod provider;
pub mod quorum;
pub mod store;
pub mod verifier;

// Re-export main types at crate root
pub use bundle::{commit_request_id, Bundle, Checkpoint};
pub use client::{LightClient, LightClientOptions, LightClientStats, VerificationState};
pub use lodestone_config::VerificationMode;
pub use peers::{FailoverController, ForkEvidence, PeerSet, WitnessRecord};
pub use provider::{fetch_with_retry, BlockSource, ProviderError, RetryPolicy};
pub use quorum::{QuorumDescriptor, QuorumError, QuorumOracle, QuorumRotation, QuorumVerifier};
pub use store::{MemoryStore, StoreError, TrustStore};

use std::time::Duration;
use types::{Height, Timestamp};

/// Result type alias for light client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in light client operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The trusted bundle is too old to anchor the requested verification
    #[error(
        "trust expired: bundle at height {trusted_height} (time {trusted_time}) cannot anchor height {height} at time {at}, trust period {trust_period:?}"
    )]
    ExpiredTrust {
        /// Height of the anchoring bundle
        trusted_height: Height,
        /// Timestamp of the anchoring bundle
        trusted_time: Timestamp,
        /// Height being verified
        height: Height,
        /// Time the check was made against
        at: Timestamp,
        /// Configured trust period
        trust_period: Duration,
    },

    /// Candidate is dated too far in the future
    #[error("bundle at height {height} has time {timestamp}, beyond now {now} + drift {max_drift:?}")]
    ClockDrift {
        /// Candidate height
        height: Height,
        /// Candidate timestamp
        timestamp: Timestamp,
        /// Local clock
        now: Timestamp,
        /// Allowed drift
        max_drift: Duration,
    },

    /// Structural or linkage failure
    #[error("invalid header at height {height}: {reason}")]
    InvalidHeader {
        /// Offending height
        height: Height,
        /// What failed
        reason: String,
    },

    /// Quorum rotation could not be resolved across the attempted step
    #[error(
        "quorum mismatch verifying height {height} from {trusted_height}: quorum {quorum_hash} {reason}"
    )]
    QuorumMismatch {
        /// Height of the anchoring bundle
        trusted_height: Height,
        /// Candidate height
        height: Height,
        /// Candidate quorum hash
        quorum_hash: String,
        /// Why the rotation was not accepted
        reason: String,
    },

    /// The quorum oracle rejected the threshold signature
    #[error("invalid threshold signature at height {height} for quorum {quorum_hash}")]
    InvalidSignature {
        /// Candidate height
        height: Height,
        /// Quorum the signature claims
        quorum_hash: String,
    },

    /// A witness disagrees with the primary
    #[error(
        "fork detected at height {height}: primary {primary} has {primary_block_id}, witness {witness} has {witness_block_id}"
    )]
    ForkDetected {
        /// Height of the conflicting bundles
        height: Height,
        /// Primary peer (now marked faulty)
        primary: String,
        /// Witness peer that disagreed
        witness: String,
        /// Primary's block id
        primary_block_id: String,
        /// Witness' block id
        witness_block_id: String,
    },

    /// Not enough witnesses answered to corroborate the primary
    #[error("no witnesses available: {responded} of {queried} responded")]
    NoWitnesses {
        /// Witnesses queried
        queried: usize,
        /// Witnesses that responded
        responded: usize,
    },

    /// Bisection could not narrow any further
    #[error("bisection exhausted between height {trusted_height} and {target}")]
    BisectionExhausted {
        /// Last verified height
        trusted_height: Height,
        /// Height that could not be reached
        target: Height,
    },

    /// Primary unreachable after retries and no replacement was available
    #[error("provider {peer} unavailable at height {height}: {reason}")]
    ProviderUnavailable {
        /// Peer identifier
        peer: String,
        /// Requested height
        height: Height,
        /// Last transport error
        reason: String,
    },

    /// The peer does not have the requested height
    #[error("height {height} not available from {peer}")]
    HeightNotAvailable {
        /// Peer identifier
        peer: String,
        /// Requested height
        height: Height,
    },

    /// The quorum oracle could not determine validity
    #[error("quorum oracle unavailable: {0}")]
    OracleUnavailable(String),

    /// Height zero or otherwise unusable target
    #[error("invalid height: {0}")]
    InvalidHeight(Height),

    /// The configured root of trust could not be established
    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    /// Primary peer given at construction does not match configuration
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// The operation was cancelled by the caller
    #[error("verification cancelled")]
    Cancelled,

    /// The overall deadline elapsed
    #[error("verification deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// Trust store failure
    #[error("trust store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] lodestone_config::ConfigError),
}

impl Error {
    /// Definitive rejections: retrying the same request cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ExpiredTrust { .. }
                | Error::InvalidHeader { .. }
                | Error::InvalidSignature { .. }
                | Error::InvalidCheckpoint(_)
                | Error::InvalidHeight(_)
        )
    }

    /// Failures worth retrying, possibly against a different primary.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ForkDetected { .. }
                | Error::NoWitnesses { .. }
                | Error::ProviderUnavailable { .. }
                | Error::HeightNotAvailable { .. }
                | Error::OracleUnavailable(_)
                | Error::DeadlineExceeded(_)
                | Error::ClockDrift { .. }
        )
    }
}

/// Common type aliases used throughout the crate
pub mod types {
    /// 32-byte hash type
    pub type Hash = [u8; 32];

    /// Block height
    pub type Height = u64;

    /// Unix time in seconds
    pub type Timestamp = u64;

    /// Quorum type identifier (LLMQ type)
    pub type QuorumType = u8;

    /// Peer identifier
    pub type PeerId = String;
}

/// Constants used in the light client
pub mod constants {
    use std::time::Duration;

    /// Default trust period (two weeks)
    pub const DEFAULT_TRUST_PERIOD: Duration = Duration::from_secs(14 * 24 * 60 * 60);

    /// Default allowed clock drift
    pub const DEFAULT_MAX_CLOCK_DRIFT: Duration = Duration::from_secs(10);

    /// Default retries per primary request after the first attempt
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Default delay between attempts
    pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

    /// Default timeout for a single primary request
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default timeout for a single witness request
    pub const DEFAULT_WITNESS_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default timeout for a single quorum oracle call
    pub const DEFAULT_ORACLE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Faults tolerated before a witness is dropped
    pub const DEFAULT_WITNESS_FAULT_THRESHOLD: u32 = 3;

    /// Bundles retained in the trust store
    pub const DEFAULT_PRUNING_SIZE: usize = 1000;

    /// Domain prefix of the request id signed over a commit
    pub const COMMIT_REQUEST_DOMAIN: &[u8] = b"commit";
}
