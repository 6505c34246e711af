//! Quorum Verification
//!
//! Threshold signatures are validated by an external quorum oracle (for a
//! Dash-style chain, the core node's `quorum verify` / `quorum info` RPCs).
//! This module defines that capability as the [`QuorumOracle`] trait and wraps
//! it in a [`QuorumVerifier`] that adds per-call timeouts and decides quorum
//! continuity between two bundles.
//!
//! ## Continuity
//!
//! Consecutive bundles signed by the same quorum need only a signature check.
//! A different quorum hash is a *rotation*: the new quorum must be the one the
//! chain's declared [`QuorumRotation`] schedule activates at the candidate
//! height, the step must cross exactly one rotation boundary, and the oracle
//! must resolve it to the threshold key the candidate carries.

use crate::bundle::{hex_hash, Bundle};
use crate::constants::DEFAULT_ORACLE_TIMEOUT;
use crate::types::{Hash, Height, QuorumType};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Threshold key and membership of one quorum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumDescriptor {
    /// Quorum type
    pub quorum_type: QuorumType,
    /// Quorum hash
    pub quorum_hash: Hash,
    /// Threshold public key
    pub threshold_public_key: Vec<u8>,
    /// Member identifiers (informational only)
    pub members: Vec<String>,
}

/// Errors returned by the quorum oracle
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuorumError {
    /// Oracle unreachable or timed out
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    /// Oracle does not know the quorum
    #[error("quorum {quorum_hash} of type {quorum_type} not found")]
    NotFound {
        /// Requested quorum type
        quorum_type: QuorumType,
        /// Requested quorum hash
        quorum_hash: String,
    },

    /// Oracle answered with something that cannot be interpreted
    #[error("malformed oracle response: {0}")]
    Malformed(String),
}

/// External quorum signing and verification service
#[async_trait]
pub trait QuorumOracle: Send + Sync {
    /// Check a threshold signature.
    ///
    /// Returns `Ok(false)` for a well-formed but invalid signature and `Err`
    /// when validity could not be determined.
    async fn verify(
        &self,
        quorum_type: QuorumType,
        request_id: &Hash,
        message_hash: &Hash,
        signature: &[u8],
        quorum_hash: &Hash,
    ) -> std::result::Result<bool, QuorumError>;

    /// Resolve a quorum's threshold key and membership
    async fn info(
        &self,
        quorum_type: QuorumType,
        quorum_hash: &Hash,
    ) -> std::result::Result<QuorumDescriptor, QuorumError>;

    /// Health check
    async fn ping(&self) -> std::result::Result<(), QuorumError>;
}

/// The chain's declared quorum rotation schedule.
///
/// Maps activation height to quorum hash; the quorum active at `h` is the
/// entry with the greatest activation height `<= h`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumRotation {
    schedule: BTreeMap<Height, Hash>,
}

impl QuorumRotation {
    /// Create a schedule from activation heights
    pub fn new(schedule: BTreeMap<Height, Hash>) -> Self {
        Self { schedule }
    }

    /// Declare a rotation at `height`
    pub fn insert(&mut self, height: Height, quorum_hash: Hash) {
        self.schedule.insert(height, quorum_hash);
    }

    /// Quorum declared active at `height`
    pub fn active_at(&self, height: Height) -> Option<Hash> {
        self.schedule
            .range(..=height)
            .next_back()
            .map(|(_, hash)| *hash)
    }

    /// Number of rotations activating in `(from, to]`
    pub fn boundaries_between(&self, from: Height, to: Height) -> usize {
        if to <= from {
            return 0;
        }
        self.schedule.range(from + 1..=to).count()
    }

    /// Whether `quorum_hash` is the declared direct successor of the quorum
    /// trusted at `trusted_height`, as seen from `candidate_height`.
    pub fn is_valid_successor(
        &self,
        trusted_height: Height,
        candidate_height: Height,
        quorum_hash: &Hash,
    ) -> bool {
        self.active_at(candidate_height) == Some(*quorum_hash)
            && self.boundaries_between(trusted_height, candidate_height) == 1
    }

    /// Number of declared rotations
    pub fn len(&self) -> usize {
        self.schedule.len()
    }

    /// Whether no rotation is declared
    pub fn is_empty(&self) -> bool {
        self.schedule.is_empty()
    }
}

/// Signature and continuity checks on top of a [`QuorumOracle`]
pub struct QuorumVerifier {
    oracle: Arc<dyn QuorumOracle>,
    rotation: QuorumRotation,
    timeout: Duration,
}

impl QuorumVerifier {
    /// Create a verifier with the default oracle timeout
    pub fn new(oracle: Arc<dyn QuorumOracle>, rotation: QuorumRotation) -> Self {
        Self {
            oracle,
            rotation,
            timeout: DEFAULT_ORACLE_TIMEOUT,
        }
    }

    /// Override the per-call oracle timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The declared rotation schedule
    pub fn rotation(&self) -> &QuorumRotation {
        &self.rotation
    }

    /// Verify a threshold signature through the oracle.
    pub async fn verify(
        &self,
        quorum_type: QuorumType,
        request_id: &Hash,
        message_hash: &Hash,
        signature: &[u8],
        quorum_hash: &Hash,
    ) -> std::result::Result<bool, QuorumError> {
        let call = self
            .oracle
            .verify(quorum_type, request_id, message_hash, signature, quorum_hash);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(QuorumError::Unavailable(format!(
                "verify timed out after {:?}",
                self.timeout
            ))),
        }
    }

    /// Check the oracle answers within the timeout.
    pub async fn ping(&self) -> std::result::Result<(), QuorumError> {
        match tokio::time::timeout(self.timeout, self.oracle.ping()).await {
            Ok(result) => result,
            Err(_) => Err(QuorumError::Unavailable(format!(
                "ping timed out after {:?}",
                self.timeout
            ))),
        }
    }

    /// Verify the commit signature carried by `bundle`
    pub async fn verify_bundle(&self, bundle: &Bundle) -> std::result::Result<bool, QuorumError> {
        trace!("Verifying threshold signature at height {}", bundle.height);
        self.verify(
            bundle.quorum_type,
            &bundle.request_id(),
            &bundle.signed_content_hash,
            &bundle.signature,
            &bundle.quorum_hash,
        )
        .await
    }

    /// Resolve a quorum descriptor through the oracle.
    pub async fn info(
        &self,
        quorum_type: QuorumType,
        quorum_hash: &Hash,
    ) -> std::result::Result<QuorumDescriptor, QuorumError> {
        match tokio::time::timeout(self.timeout, self.oracle.info(quorum_type, quorum_hash)).await
        {
            Ok(result) => result,
            Err(_) => Err(QuorumError::Unavailable(format!(
                "info timed out after {:?}",
                self.timeout
            ))),
        }
    }

    /// Decide whether `candidate`'s quorum may follow `trusted`'s.
    ///
    /// Fails with [`Error::QuorumMismatch`] when a rotation cannot be
    /// resolved across this step (a narrower step may still succeed),
    /// [`Error::InvalidHeader`] when the candidate contradicts a known quorum,
    /// and [`Error::OracleUnavailable`] when the oracle cannot answer.
    pub async fn check_continuity(&self, trusted: &Bundle, candidate: &Bundle) -> Result<()> {
        if candidate.quorum_hash == trusted.quorum_hash {
            if candidate.quorum_type != trusted.quorum_type
                || candidate.threshold_public_key != trusted.threshold_public_key
            {
                return Err(Error::InvalidHeader {
                    height: candidate.height,
                    reason: "threshold key differs from trusted quorum".into(),
                });
            }
            return Ok(());
        }

        let mismatch = |reason: &str| Error::QuorumMismatch {
            trusted_height: trusted.height,
            height: candidate.height,
            quorum_hash: hex_hash(&candidate.quorum_hash),
            reason: reason.to_string(),
        };

        if !self
            .rotation
            .is_valid_successor(trusted.height, candidate.height, &candidate.quorum_hash)
        {
            debug!(
                "Quorum rotation {} -> {} not resolvable across {}..{} ({} boundaries)",
                hex_hash(&trusted.quorum_hash),
                hex_hash(&candidate.quorum_hash),
                trusted.height,
                candidate.height,
                self.rotation
                    .boundaries_between(trusted.height, candidate.height)
            );
            return Err(mismatch("is not the declared successor within this span"));
        }

        let descriptor = match self
            .info(candidate.quorum_type, &candidate.quorum_hash)
            .await
        {
            Ok(descriptor) => descriptor,
            Err(QuorumError::NotFound { .. }) => return Err(mismatch("is unknown to the oracle")),
            Err(e) => return Err(Error::OracleUnavailable(e.to_string())),
        };

        if descriptor.quorum_type != candidate.quorum_type
            || descriptor.threshold_public_key != candidate.threshold_public_key
        {
            return Err(Error::InvalidHeader {
                height: candidate.height,
                reason: format!(
                    "threshold key does not match quorum {}",
                    hex_hash(&candidate.quorum_hash)
                ),
            });
        }

        debug!(
            "Accepted quorum rotation at height {}: {} ({} members)",
            candidate.height,
            hex_hash(&candidate.quorum_hash),
            descriptor.members.len()
        );
        Ok(())
    }
}
