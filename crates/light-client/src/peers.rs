//! Peer Failover
//!
//! Tracks which [`BlockSource`] is the primary and which are witnesses,
//! cross-checks provisional bundles against witnesses before they are
//! committed, and rebinds the primary when it is unavailable or caught on a
//! fork.
//!
//! ## Rules
//!
//! - The witness set never contains the primary.
//! - A witness disagreeing with the primary is fork evidence: the primary is
//!   dropped and the next witness promoted.
//! - Timeouts and transport errors add to a witness' fault count; a witness
//!   exceeding the fault threshold is removed.
//! - A cross-check passes only when a majority of queried witnesses answered.

use crate::bundle::{hex_hash, Bundle};
use crate::provider::{fetch_with_retry, BlockSource, ProviderError, RetryPolicy};
use crate::types::{Height, PeerId, Timestamp};
use crate::{Error, Result};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Bookkeeping for one witness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessRecord {
    /// Peer identifier
    pub peer_id: PeerId,
    /// Highest height the witness answered for
    pub last_responsive_height: Option<Height>,
    /// Consecutive faults
    pub fault_count: u32,
}

impl WitnessRecord {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            last_responsive_height: None,
            fault_count: 0,
        }
    }
}

/// Two conflicting bundles for the same height
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkEvidence {
    /// Height of the conflict
    pub height: Height,
    /// Primary at the time of detection
    pub primary: PeerId,
    /// Witness that disagreed
    pub witness: PeerId,
    /// Bundle served by the primary
    pub primary_bundle: Bundle,
    /// Bundle served by the witness
    pub witness_bundle: Bundle,
    /// Caller's clock at detection
    pub detected_at: Timestamp,
}

impl ForkEvidence {
    /// JSON encoding for submission or archival
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

struct Witness {
    source: Arc<dyn BlockSource>,
    record: WitnessRecord,
}

/// Primary binding plus the witness set
pub struct PeerSet {
    primary: Arc<dyn BlockSource>,
    primary_faults: u32,
    witnesses: Vec<Witness>,
    faulty: Vec<PeerId>,
    configured: usize,
}

impl PeerSet {
    /// Create a peer set. Witnesses sharing the primary's id, or each
    /// other's, are ignored.
    pub fn new(primary: Arc<dyn BlockSource>, witnesses: Vec<Arc<dyn BlockSource>>) -> Self {
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(primary.peer_id().to_string());

        let mut set = Vec::with_capacity(witnesses.len());
        for source in witnesses {
            let peer_id = source.peer_id().to_string();
            if !seen.insert(peer_id.clone()) {
                warn!("Ignoring duplicate witness {}", peer_id);
                continue;
            }
            set.push(Witness {
                source,
                record: WitnessRecord::new(peer_id),
            });
        }

        Self {
            primary,
            primary_faults: 0,
            configured: set.len(),
            witnesses: set,
            faulty: Vec::new(),
        }
    }

    /// Current primary
    pub fn primary(&self) -> Arc<dyn BlockSource> {
        Arc::clone(&self.primary)
    }

    /// Current primary's identifier
    pub fn primary_id(&self) -> PeerId {
        self.primary.peer_id().to_string()
    }

    /// Witness sources, in promotion order
    pub fn witness_sources(&self) -> Vec<Arc<dyn BlockSource>> {
        self.witnesses.iter().map(|w| Arc::clone(&w.source)).collect()
    }

    /// Witness identifiers, in promotion order
    pub fn witness_ids(&self) -> Vec<PeerId> {
        self.witnesses.iter().map(|w| w.record.peer_id.clone()).collect()
    }

    /// Snapshot of witness records
    pub fn witness_records(&self) -> Vec<WitnessRecord> {
        self.witnesses.iter().map(|w| w.record.clone()).collect()
    }

    /// Peers removed for serving a fork
    pub fn faulty(&self) -> &[PeerId] {
        &self.faulty
    }

    /// Number of witnesses given at construction
    pub fn configured_witnesses(&self) -> usize {
        self.configured
    }

    fn witness_mut(&mut self, peer_id: &str) -> Option<&mut Witness> {
        self.witnesses
            .iter_mut()
            .find(|w| w.record.peer_id == peer_id)
    }

    /// Record a witness answering for `height`
    pub fn record_response(&mut self, peer_id: &str, height: Height) {
        if let Some(witness) = self.witness_mut(peer_id) {
            witness.record.fault_count = 0;
            let last = witness.record.last_responsive_height.unwrap_or(0);
            witness.record.last_responsive_height = Some(last.max(height));
        }
    }

    /// Record a witness fault. Returns true if the witness was removed.
    pub fn record_fault(&mut self, peer_id: &str, threshold: u32) -> bool {
        let Some(witness) = self.witness_mut(peer_id) else {
            return false;
        };
        witness.record.fault_count += 1;
        if witness.record.fault_count <= threshold {
            return false;
        }

        self.witnesses.retain(|w| w.record.peer_id != peer_id);
        warn!(
            "Removed witness {} after exceeding {} faults",
            peer_id, threshold
        );
        true
    }

    /// Drop the primary as faulty and promote the first witness.
    ///
    /// Returns the new primary, or `None` if no witness was left (the faulty
    /// primary then stays bound but is recorded as faulty).
    pub fn replace_faulty_primary(&mut self) -> Option<PeerId> {
        let old = self.primary_id();
        if !self.faulty.contains(&old) {
            self.faulty.push(old);
        }
        if self.witnesses.is_empty() {
            return None;
        }

        let promoted = self.witnesses.remove(0);
        self.primary = promoted.source;
        self.primary_faults = 0;
        Some(promoted.record.peer_id)
    }

    /// Demote an unavailable primary to witness and promote the first witness.
    ///
    /// The old primary keeps its fault count and is dropped instead of
    /// demoted once it exceeds `threshold`.
    pub fn demote_primary(&mut self, threshold: u32) -> Option<PeerId> {
        if self.witnesses.is_empty() {
            self.primary_faults += 1;
            return None;
        }

        let promoted = self.witnesses.remove(0);
        let old_source = std::mem::replace(&mut self.primary, promoted.source);
        let old_faults = self.primary_faults + 1;
        self.primary_faults = promoted.record.fault_count;

        let old_id = old_source.peer_id().to_string();
        if old_faults <= threshold {
            self.witnesses.push(Witness {
                source: old_source,
                record: WitnessRecord {
                    peer_id: old_id,
                    last_responsive_height: None,
                    fault_count: old_faults,
                },
            });
        } else {
            warn!("Dropped primary {} after {} faults", old_id, old_faults);
        }

        Some(promoted.record.peer_id)
    }
}

/// Owns the [`PeerSet`] and applies the failover rules
pub struct FailoverController {
    peers: RwLock<PeerSet>,
    evidence: RwLock<Vec<ForkEvidence>>,
    fault_threshold: u32,
    witness_timeout: Duration,
}

impl FailoverController {
    /// Create a controller
    pub fn new(peers: PeerSet, fault_threshold: u32, witness_timeout: Duration) -> Self {
        Self {
            peers: RwLock::new(peers),
            evidence: RwLock::new(Vec::new()),
            fault_threshold,
            witness_timeout,
        }
    }

    /// Current primary's identifier
    pub fn primary_id(&self) -> PeerId {
        self.peers.read().primary_id()
    }

    /// Current primary
    pub fn primary(&self) -> Arc<dyn BlockSource> {
        self.peers.read().primary()
    }

    /// Current witness identifiers
    pub fn witness_ids(&self) -> Vec<PeerId> {
        self.peers.read().witness_ids()
    }

    /// Snapshot of witness records
    pub fn witness_records(&self) -> Vec<WitnessRecord> {
        self.peers.read().witness_records()
    }

    /// Peers removed for serving a fork
    pub fn faulty_peers(&self) -> Vec<PeerId> {
        self.peers.read().faulty().to_vec()
    }

    /// Fork evidence collected so far
    pub fn evidence(&self) -> Vec<ForkEvidence> {
        self.evidence.read().clone()
    }

    /// Fetch `height` from the primary, failing over to witnesses when the
    /// primary stays unavailable after retries.
    pub async fn fetch_from_primary(&self, height: Height, policy: &RetryPolicy) -> Result<Bundle> {
        let mut tried: HashSet<PeerId> = HashSet::new();

        loop {
            let primary = self.primary();
            let peer = primary.peer_id().to_string();
            tried.insert(peer.clone());

            let error = match fetch_with_retry(primary.as_ref(), height, policy).await {
                Ok(bundle) => return Ok(bundle),
                Err(ProviderError::HeightNotAvailable(_)) => {
                    return Err(Error::HeightNotAvailable { peer, height });
                }
                Err(e) => e,
            };

            warn!("Primary {} unavailable at height {}: {}", peer, height, error);
            let promoted = self.peers.write().demote_primary(self.fault_threshold);
            match promoted {
                Some(next) if !tried.contains(&next) => {
                    info!("Failing over from primary {} to {}", peer, next);
                }
                _ => {
                    return Err(Error::ProviderUnavailable {
                        peer,
                        height,
                        reason: error.to_string(),
                    });
                }
            }
        }
    }

    /// Cross-check a provisional bundle against every witness.
    ///
    /// Witnesses are queried concurrently, each bounded by the witness
    /// timeout. With no witnesses configured the check is skipped.
    pub async fn cross_check(&self, provisional: &Bundle, now: Timestamp) -> Result<()> {
        let (primary_id, witnesses, configured) = {
            let peers = self.peers.read();
            (
                peers.primary_id(),
                peers.witness_sources(),
                peers.configured_witnesses(),
            )
        };

        if witnesses.is_empty() {
            if configured == 0 {
                debug!("No witnesses configured, skipping cross-check");
                return Ok(());
            }
            return Err(Error::NoWitnesses {
                queried: 0,
                responded: 0,
            });
        }

        let height = provisional.height;
        let timeout = self.witness_timeout;
        let queries = witnesses.iter().map(|witness| {
            let witness = Arc::clone(witness);
            async move {
                let result = match tokio::time::timeout(timeout, witness.fetch(height)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(timeout)),
                };
                (witness.peer_id().to_string(), result)
            }
        });
        let responses = join_all(queries).await;

        let expected = provisional.block_id();
        let queried = responses.len();
        let mut responded = 0;
        let mut divergence: Option<(PeerId, Bundle)> = None;

        {
            let mut peers = self.peers.write();
            for (peer, result) in responses {
                match result {
                    Ok(bundle) => {
                        responded += 1;
                        if bundle.block_id() == expected {
                            peers.record_response(&peer, height);
                        } else if divergence.is_none() {
                            divergence = Some((peer, bundle));
                        }
                    }
                    Err(e) => {
                        warn!("Witness {} failed at height {}: {}", peer, height, e);
                        peers.record_fault(&peer, self.fault_threshold);
                    }
                }
            }
        }

        if let Some((witness, witness_bundle)) = divergence {
            let err = Error::ForkDetected {
                height,
                primary: primary_id.clone(),
                witness: witness.clone(),
                primary_block_id: hex_hash(&expected),
                witness_block_id: witness_bundle.block_id_hex(),
            };
            error!("{}", err);

            self.evidence.write().push(ForkEvidence {
                height,
                primary: primary_id,
                witness,
                primary_bundle: provisional.clone(),
                witness_bundle,
                detected_at: now,
            });

            match self.peers.write().replace_faulty_primary() {
                Some(next) => info!("Promoted witness {} to primary", next),
                None => warn!("No witness left to replace the faulty primary"),
            }
            return Err(err);
        }

        if responded == 0 || responded * 2 <= queried {
            return Err(Error::NoWitnesses { queried, responded });
        }

        debug!(
            "Cross-check passed at height {}: {}/{} witnesses agree",
            height, responded, queried
        );
        Ok(())
    }
}
