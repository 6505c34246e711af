//! Step Verification
//!
//! Checks that decide whether a candidate bundle may be trusted on the basis
//! of an already-trusted one. Checks run in a fixed order so that the most
//! fundamental failure is reported:
//!
//! 1. Structure: chain id, height order, signed content, parent link when adjacent
//! 2. Time: trust period and clock drift
//! 3. Quorum continuity (rotation)
//! 4. Threshold signature
//!
//! The backward walk uses [`verify_linkage`] alone: the chain below a trusted
//! bundle is anchored by hashes, not signatures.

use crate::bundle::{hex_hash, Bundle};
use crate::quorum::{QuorumError, QuorumVerifier};
use crate::types::{Height, Timestamp};
use crate::{Error, Result};
use std::time::Duration;
use tracing::trace;

/// Parameters shared by every step of one client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOptions {
    /// Chain every bundle must belong to
    pub chain_id: String,
    /// Maximum age of the anchoring bundle
    pub trust_period: Duration,
    /// Tolerance for future-dated candidates
    pub max_clock_drift: Duration,
}

fn expiry(trusted: &Bundle, trust_period: Duration) -> Timestamp {
    trusted.timestamp.saturating_add(trust_period.as_secs())
}

fn expired(trusted: &Bundle, height: Height, at: Timestamp, trust_period: Duration) -> Error {
    Error::ExpiredTrust {
        trusted_height: trusted.height,
        trusted_time: trusted.timestamp,
        height,
        at,
        trust_period,
    }
}

/// Fail if `trusted` can no longer anchor anything at `now`.
pub fn check_trust_not_expired(
    trusted: &Bundle,
    height: Height,
    now: Timestamp,
    trust_period: Duration,
) -> Result<()> {
    if now >= expiry(trusted, trust_period) {
        return Err(expired(trusted, height, now, trust_period));
    }
    Ok(())
}

/// Fail if a fetched bundle is not the one that was asked for.
pub fn check_requested_height(bundle: &Bundle, requested: Height) -> Result<()> {
    if bundle.height != requested {
        return Err(Error::InvalidHeader {
            height: requested,
            reason: format!("peer returned height {}", bundle.height),
        });
    }
    Ok(())
}

/// Structural checks of `candidate` against `trusted`.
pub fn verify_structure(trusted: &Bundle, candidate: &Bundle, chain_id: &str) -> Result<()> {
    let invalid = |reason: String| Error::InvalidHeader {
        height: candidate.height,
        reason,
    };

    if candidate.chain_id != chain_id {
        return Err(invalid(format!(
            "chain id {:?}, expected {:?}",
            candidate.chain_id, chain_id
        )));
    }
    if candidate.height <= trusted.height {
        return Err(invalid(format!(
            "height is not above trusted height {}",
            trusted.height
        )));
    }
    if !candidate.signs_own_block_id() {
        return Err(invalid(format!(
            "signed content {} does not match block id {}",
            hex_hash(&candidate.signed_content_hash),
            candidate.block_id_hex()
        )));
    }
    if candidate.is_adjacent_to(trusted) && candidate.previous_block_id != trusted.block_id() {
        return Err(invalid(format!(
            "previous block id {} does not link to trusted {}",
            hex_hash(&candidate.previous_block_id),
            trusted.block_id_hex()
        )));
    }
    if candidate.timestamp <= trusted.timestamp {
        return Err(invalid(format!(
            "time {} is not after trusted time {}",
            candidate.timestamp, trusted.timestamp
        )));
    }
    Ok(())
}

/// Trust period and clock drift checks.
pub fn verify_temporal(
    trusted: &Bundle,
    candidate: &Bundle,
    now: Timestamp,
    options: &VerificationOptions,
) -> Result<()> {
    check_trust_not_expired(trusted, candidate.height, now, options.trust_period)?;

    if candidate.timestamp >= expiry(trusted, options.trust_period) {
        return Err(expired(
            trusted,
            candidate.height,
            candidate.timestamp,
            options.trust_period,
        ));
    }

    if candidate.timestamp > now.saturating_add(options.max_clock_drift.as_secs()) {
        return Err(Error::ClockDrift {
            height: candidate.height,
            timestamp: candidate.timestamp,
            now,
            max_drift: options.max_clock_drift,
        });
    }
    Ok(())
}

/// Run every check for one forward step.
///
/// On success `candidate` may become the provisional trust root.
pub async fn verify_candidate(
    trusted: &Bundle,
    candidate: &Bundle,
    now: Timestamp,
    options: &VerificationOptions,
    quorum: &QuorumVerifier,
) -> Result<()> {
    trace!(
        "Verifying height {} from trusted height {}",
        candidate.height,
        trusted.height
    );

    verify_structure(trusted, candidate, &options.chain_id)?;
    verify_temporal(trusted, candidate, now, options)?;
    quorum.check_continuity(trusted, candidate).await?;
    verify_signature(candidate, quorum).await
}

/// Threshold signature check, separating rejection from oracle failure.
pub async fn verify_signature(bundle: &Bundle, quorum: &QuorumVerifier) -> Result<()> {
    match quorum.verify_bundle(bundle).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::InvalidSignature {
            height: bundle.height,
            quorum_hash: hex_hash(&bundle.quorum_hash),
        }),
        Err(QuorumError::NotFound { quorum_hash, .. }) => Err(Error::InvalidSignature {
            height: bundle.height,
            quorum_hash,
        }),
        Err(e) => Err(Error::OracleUnavailable(e.to_string())),
    }
}

/// Hash-chain check of `previous` against the already-trusted `frontier`.
pub fn verify_linkage(frontier: &Bundle, previous: &Bundle) -> Result<()> {
    let invalid = |reason: String| Error::InvalidHeader {
        height: previous.height,
        reason,
    };

    if previous.height + 1 != frontier.height {
        return Err(invalid(format!(
            "expected height {}",
            frontier.height.saturating_sub(1)
        )));
    }
    if previous.chain_id != frontier.chain_id {
        return Err(invalid(format!(
            "chain id {:?} differs from {:?}",
            previous.chain_id, frontier.chain_id
        )));
    }
    if previous.block_id() != frontier.previous_block_id {
        return Err(invalid(format!(
            "block id {} does not match previous block id {} recorded at height {}",
            previous.block_id_hex(),
            hex_hash(&frontier.previous_block_id),
            frontier.height
        )));
    }
    if previous.timestamp >= frontier.timestamp {
        return Err(invalid(format!(
            "time {} is not before time {} at height {}",
            previous.timestamp, frontier.timestamp, frontier.height
        )));
    }
    Ok(())
}
