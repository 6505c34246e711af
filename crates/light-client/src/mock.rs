//! Deterministic in-memory chain, block source and quorum oracle.
//!
//! Used by tests and benchmarks. Threshold "signatures" are Keccak digests
//! keyed by the quorum's threshold key, so they are reproducible and any
//! change to the signed fields invalidates them.

use crate::bundle::{Bundle, Checkpoint};
use crate::provider::{BlockSource, ProviderError};
use crate::quorum::{QuorumDescriptor, QuorumError, QuorumOracle, QuorumRotation};
use crate::types::{Hash, Height, QuorumType, Timestamp};
use async_trait::async_trait;
use parking_lot::RwLock;
use sha3::{Digest, Keccak256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// Quorum type used by generated chains
pub const MOCK_QUORUM_TYPE: QuorumType = 100;

const SIGNATURE_DOMAIN: &[u8] = b"lodestone-mock-threshold-signature";
const SIGNATURE_LEN: usize = 96;

fn keccak(parts: &[&[u8]]) -> Hash {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Deterministic threshold signature of `message_hash` by `quorum`.
pub fn threshold_sign(quorum: &QuorumDescriptor, request_id: &Hash, message_hash: &Hash) -> Vec<u8> {
    let mut signature = Vec::with_capacity(SIGNATURE_LEN);
    for chunk in 0u8..3 {
        signature.extend_from_slice(&keccak(&[
            SIGNATURE_DOMAIN,
            &[chunk],
            &quorum.threshold_public_key,
            &quorum.quorum_hash,
            request_id,
            message_hash,
        ]));
    }
    signature
}

/// Descriptor of the `index`-th generated quorum
pub fn mock_quorum(index: u64) -> QuorumDescriptor {
    let quorum_hash = keccak(&[b"quorum", &index.to_be_bytes()]);
    let key = keccak(&[b"threshold-key", &quorum_hash]);
    let key_tail = keccak(&[b"threshold-key-tail", &quorum_hash]);

    let mut threshold_public_key = key.to_vec();
    threshold_public_key.extend_from_slice(&key_tail[..16]);

    QuorumDescriptor {
        quorum_type: MOCK_QUORUM_TYPE,
        quorum_hash,
        threshold_public_key,
        members: (0..4).map(|m| format!("quorum-{}-member-{}", index, m)).collect(),
    }
}

/// In-memory quorum oracle
#[derive(Debug, Default)]
pub struct MockQuorumOracle {
    quorums: RwLock<HashMap<Hash, QuorumDescriptor>>,
    unreachable: AtomicBool,
    delay: RwLock<Option<Duration>>,
    verify_calls: AtomicUsize,
    info_calls: AtomicUsize,
}

impl MockQuorumOracle {
    /// Create an oracle that knows no quorum
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a quorum known to the oracle
    pub fn register(&self, quorum: QuorumDescriptor) {
        self.quorums.write().insert(quorum.quorum_hash, quorum);
    }

    /// Toggle reachability
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Delay every `verify` and `info` answer
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write() = delay;
    }

    /// Total `verify` and `info` calls made
    pub fn call_count(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst) + self.info_calls.load(Ordering::SeqCst)
    }

    async fn lookup(
        &self,
        quorum_type: QuorumType,
        quorum_hash: &Hash,
    ) -> Result<QuorumDescriptor, QuorumError> {
        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(QuorumError::Unavailable("mock oracle unreachable".into()));
        }
        match self.quorums.read().get(quorum_hash) {
            Some(quorum) if quorum.quorum_type == quorum_type => Ok(quorum.clone()),
            _ => Err(QuorumError::NotFound {
                quorum_type,
                quorum_hash: crate::bundle::hex_hash(quorum_hash),
            }),
        }
    }
}

#[async_trait]
impl QuorumOracle for MockQuorumOracle {
    async fn verify(
        &self,
        quorum_type: QuorumType,
        request_id: &Hash,
        message_hash: &Hash,
        signature: &[u8],
        quorum_hash: &Hash,
    ) -> Result<bool, QuorumError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        let quorum = self.lookup(quorum_type, quorum_hash).await?;
        if signature.len() != SIGNATURE_LEN {
            return Ok(false);
        }
        Ok(signature == threshold_sign(&quorum, request_id, message_hash).as_slice())
    }

    async fn info(
        &self,
        quorum_type: QuorumType,
        quorum_hash: &Hash,
    ) -> Result<QuorumDescriptor, QuorumError> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup(quorum_type, quorum_hash).await
    }

    async fn ping(&self) -> Result<(), QuorumError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(QuorumError::Unavailable("mock oracle unreachable".into()));
        }
        Ok(())
    }
}

/// In-memory block source
#[derive(Debug)]
pub struct MockProvider {
    peer_id: String,
    bundles: RwLock<BTreeMap<Height, Bundle>>,
    fetches: AtomicUsize,
    unreachable: AtomicBool,
    failures: AtomicU32,
    delay: RwLock<Option<Duration>>,
}

impl MockProvider {
    /// Create a provider serving nothing
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            bundles: RwLock::new(BTreeMap::new()),
            fetches: AtomicUsize::new(0),
            unreachable: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            delay: RwLock::new(None),
        }
    }

    /// Serve `bundle` at its height, replacing what was there
    pub fn insert(&self, bundle: Bundle) {
        self.bundles.write().insert(bundle.height, bundle);
    }

    /// Fail every request as unreachable
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay every response
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write() = delay;
    }

    /// Fail the next `count` fetches as unreachable
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Fetches made so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    async fn respond(&self) -> Result<(), ProviderError> {
        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ProviderError::Unreachable(format!("{} is down", self.peer_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl BlockSource for MockProvider {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn fetch(&self, height: Height) -> Result<Bundle, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.respond().await?;

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProviderError::Unreachable(format!(
                "{} dropped the request",
                self.peer_id
            )));
        }

        self.bundles
            .read()
            .get(&height)
            .cloned()
            .ok_or(ProviderError::HeightNotAvailable(height))
    }

    async fn latest_height(&self) -> Result<Height, ProviderError> {
        self.respond().await?;
        self.bundles
            .read()
            .keys()
            .next_back()
            .copied()
            .ok_or(ProviderError::HeightNotAvailable(0))
    }
}

/// A generated chain of correctly linked and signed bundles
#[derive(Debug, Clone)]
pub struct MockChain {
    bundles: BTreeMap<Height, Bundle>,
    quorums: Vec<QuorumDescriptor>,
    rotation: QuorumRotation,
}

impl MockChain {
    /// Generate heights `1..=length`.
    ///
    /// Quorum `i` signs heights `1 + i * rotation_interval ..`; bundle `h` is
    /// timestamped `genesis_time + (h - 1) * block_interval_secs`.
    pub fn generate(
        chain_id: &str,
        length: Height,
        rotation_interval: Height,
        genesis_time: Timestamp,
        block_interval_secs: u64,
    ) -> Self {
        let rotation_interval = rotation_interval.max(1);
        let mut chain = Self {
            bundles: BTreeMap::new(),
            quorums: Vec::new(),
            rotation: QuorumRotation::default(),
        };

        let mut previous_block_id = [0u8; 32];
        for height in 1..=length {
            let index = (height - 1) / rotation_interval;
            if (height - 1) % rotation_interval == 0 {
                let quorum = mock_quorum(index);
                chain.rotation.insert(height, quorum.quorum_hash);
                chain.quorums.push(quorum);
            }
            let quorum = &chain.quorums[index as usize];

            let mut bundle = Bundle {
                height,
                timestamp: genesis_time + (height - 1) * block_interval_secs,
                chain_id: chain_id.to_string(),
                previous_block_id,
                quorum_type: quorum.quorum_type,
                quorum_hash: quorum.quorum_hash,
                threshold_public_key: quorum.threshold_public_key.clone(),
                signature: Vec::new(),
                signed_content_hash: [0u8; 32],
            };
            seal(&mut bundle, quorum);
            previous_block_id = bundle.block_id();
            chain.bundles.insert(height, bundle);
        }

        chain
    }

    /// Bundle at `height`
    pub fn bundle(&self, height: Height) -> Option<&Bundle> {
        self.bundles.get(&height)
    }

    /// Checkpoint naming the bundle at `height`
    pub fn checkpoint(&self, height: Height) -> Option<Checkpoint> {
        self.bundle(height)
            .map(|b| Checkpoint::new(height, b.block_id()))
    }

    /// The declared rotation schedule
    pub fn rotation(&self) -> QuorumRotation {
        self.rotation.clone()
    }

    /// Oracle knowing every quorum of this chain
    pub fn oracle(&self) -> MockQuorumOracle {
        let oracle = MockQuorumOracle::new();
        for quorum in &self.quorums {
            oracle.register(quorum.clone());
        }
        oracle
    }

    /// Provider serving every bundle of this chain
    pub fn provider(&self, peer_id: &str) -> MockProvider {
        let provider = MockProvider::new(peer_id);
        for bundle in self.bundles.values() {
            provider.insert(bundle.clone());
        }
        provider
    }

    /// A validly signed chain diverging from this one at `height`.
    pub fn fork_at(&self, height: Height) -> Self {
        let mut fork = self.clone();
        if let Some(bundle) = fork.bundles.get_mut(&height) {
            bundle.timestamp += 1;
        }
        fork.reseal_from(height);
        fork
    }

    /// Replace the signature at `height` with garbage.
    pub fn corrupt_signature(&mut self, height: Height) {
        if let Some(bundle) = self.bundles.get_mut(&height) {
            for byte in bundle.signature.iter_mut() {
                *byte ^= 0xa5;
            }
        }
    }

    /// Point `height` at a wrong parent. The bundle itself stays validly
    /// signed; its children keep their original link.
    pub fn break_link(&mut self, height: Height) {
        let quorum = self
            .bundles
            .get(&height)
            .and_then(|b| self.quorum_for(&b.quorum_hash));
        if let (Some(bundle), Some(quorum)) = (self.bundles.get_mut(&height), quorum) {
            bundle.previous_block_id = keccak(&[b"broken-link", &height.to_be_bytes()]);
            seal(bundle, &quorum);
        }
    }

    fn quorum_for(&self, quorum_hash: &Hash) -> Option<QuorumDescriptor> {
        self.quorums
            .iter()
            .find(|q| &q.quorum_hash == quorum_hash)
            .cloned()
    }

    fn reseal_from(&mut self, height: Height) {
        let mut previous_block_id = self
            .bundles
            .get(&height.saturating_sub(1))
            .map(|b| b.block_id())
            .unwrap_or([0u8; 32]);

        let heights: Vec<Height> = self.bundles.range(height..).map(|(h, _)| *h).collect();
        for h in heights {
            let quorum = self
                .bundles
                .get(&h)
                .and_then(|b| self.quorum_for(&b.quorum_hash));
            if let (Some(bundle), Some(quorum)) = (self.bundles.get_mut(&h), quorum) {
                bundle.previous_block_id = previous_block_id;
                seal(bundle, &quorum);
                previous_block_id = bundle.block_id();
            }
        }
    }
}

fn seal(bundle: &mut Bundle, quorum: &QuorumDescriptor) {
    bundle.signed_content_hash = bundle.block_id();
    bundle.signature = threshold_sign(quorum, &bundle.request_id(), &bundle.signed_content_hash);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_chain_links() {
        let chain = MockChain::generate("mock", 10, 3, 1_000, 60);
        for h in 2..=10 {
            let (parent, child) = (chain.bundle(h - 1).unwrap(), chain.bundle(h).unwrap());
            assert_eq!(child.previous_block_id, parent.block_id());
            assert!(child.signs_own_block_id());
        }
        assert_eq!(chain.rotation().len(), 4);
        assert_eq!(chain.bundle(4).unwrap().quorum_hash, mock_quorum(1).quorum_hash);
    }

    #[test]
    fn fork_diverges_from_height() {
        let chain = MockChain::generate("mock", 10, 5, 1_000, 60);
        let fork = chain.fork_at(6);
        assert_eq!(chain.bundle(5), fork.bundle(5));
        assert_ne!(chain.bundle(6).unwrap().block_id(), fork.bundle(6).unwrap().block_id());
        assert_eq!(fork.bundle(7).unwrap().previous_block_id, fork.bundle(6).unwrap().block_id());
    }

    #[tokio::test]
    async fn oracle_checks_signatures() {
        let mut chain = MockChain::generate("mock", 3, 10, 1_000, 60);
        let oracle = chain.oracle();
        let b = chain.bundle(2).unwrap().clone();
        let valid = oracle
            .verify(b.quorum_type, &b.request_id(), &b.signed_content_hash, &b.signature, &b.quorum_hash)
            .await
            .unwrap();
        assert!(valid);

        chain.corrupt_signature(2);
        let b = chain.bundle(2).unwrap();
        let valid = oracle
            .verify(b.quorum_type, &b.request_id(), &b.signed_content_hash, &b.signature, &b.quorum_hash)
            .await
            .unwrap();
        assert!(!valid);

        oracle.set_reachable(false);
        assert!(oracle.ping().await.is_err());
    }
}
