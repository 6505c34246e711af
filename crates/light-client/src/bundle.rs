//! Bundles: the signed unit of trust.
//!
//! A [`Bundle`] carries a block header, the quorum that signed it and the
//! aggregated threshold signature. Its identity is `(chain_id, height,
//! block_id)`, where the block id is the Keccak-256 digest of the header
//! fields.

use crate::constants::COMMIT_REQUEST_DOMAIN;
use crate::types::{Hash, Height, QuorumType, Timestamp};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// Header, quorum reference and commit signature for one height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// Block height (starts at 1)
    pub height: Height,
    /// Block time, unix seconds
    pub timestamp: Timestamp,
    /// Chain identifier
    pub chain_id: String,
    /// Block id of the parent
    pub previous_block_id: Hash,
    /// Type of the signing quorum
    pub quorum_type: QuorumType,
    /// Hash identifying the signing quorum
    pub quorum_hash: Hash,
    /// Threshold public key of the signing quorum
    pub threshold_public_key: Vec<u8>,
    /// Aggregated threshold signature over `signed_content_hash`
    pub signature: Vec<u8>,
    /// Hash the quorum claims to have signed
    pub signed_content_hash: Hash,
}

impl Bundle {
    /// Compute the block identifier from the header fields.
    ///
    /// The signature and the signed content hash are commit data and are
    /// not part of the identifier.
    pub fn block_id(&self) -> Hash {
        let mut hasher = Keccak256::new();
        hasher.update((self.chain_id.len() as u64).to_be_bytes());
        hasher.update(self.chain_id.as_bytes());
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(self.previous_block_id);
        hasher.update([self.quorum_type]);
        hasher.update(self.quorum_hash);
        hasher.update((self.threshold_public_key.len() as u64).to_be_bytes());
        hasher.update(&self.threshold_public_key);
        hasher.finalize().into()
    }

    /// Block identifier as a hex string
    pub fn block_id_hex(&self) -> String {
        hex_hash(&self.block_id())
    }

    /// Whether the commit signs this block's identifier
    pub fn signs_own_block_id(&self) -> bool {
        self.signed_content_hash == self.block_id()
    }

    /// Request id the quorum signed for this height
    pub fn request_id(&self) -> Hash {
        commit_request_id(self.height)
    }

    /// Whether `self` directly follows `parent`
    pub fn is_adjacent_to(&self, parent: &Bundle) -> bool {
        self.height == parent.height + 1
    }
}

/// Request id of the commit at `height`.
pub fn commit_request_id(height: Height) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(COMMIT_REQUEST_DOMAIN);
    hasher.update(height.to_be_bytes());
    hasher.finalize().into()
}

/// Format a hash as `0x`-prefixed hex
pub fn hex_hash(hash: &Hash) -> String {
    format!("0x{}", hex::encode(hash))
}

/// Root of trust supplied out of band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Trusted height
    pub height: Height,
    /// Block id expected at that height
    pub block_id: Hash,
}

impl Checkpoint {
    /// Create a new checkpoint
    pub fn new(height: Height, block_id: Hash) -> Self {
        Self { height, block_id }
    }

    /// Whether `bundle` is the block this checkpoint names
    pub fn matches(&self, bundle: &Bundle) -> bool {
        bundle.height == self.height && bundle.block_id() == self.block_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Bundle {
        let mut bundle = Bundle {
            height: 7,
            timestamp: 1_700_000_000,
            chain_id: "test-chain".into(),
            previous_block_id: [3u8; 32],
            quorum_type: 100,
            quorum_hash: [9u8; 32],
            threshold_public_key: vec![1u8; 48],
            signature: vec![2u8; 96],
            signed_content_hash: [0u8; 32],
        };
        bundle.signed_content_hash = bundle.block_id();
        bundle
    }

    #[test]
    fn block_id_ignores_commit_fields() {
        let bundle = sample();
        let mut resigned = bundle.clone();
        resigned.signature = vec![5u8; 96];
        assert_eq!(bundle.block_id(), resigned.block_id());
        assert!(resigned.signs_own_block_id());
    }

    #[test]
    fn block_id_covers_header_fields() {
        let bundle = sample();
        let mut moved = bundle.clone();
        moved.timestamp += 1;
        assert_ne!(bundle.block_id(), moved.block_id());
        assert!(!moved.signs_own_block_id());
    }

    #[test]
    fn request_id_depends_on_height() {
        assert_ne!(commit_request_id(1), commit_request_id(2));
        assert_eq!(sample().request_id(), commit_request_id(7));
    }

    #[test]
    fn checkpoint_matches() {
        let bundle = sample();
        let checkpoint = Checkpoint::new(7, bundle.block_id());
        assert!(checkpoint.matches(&bundle));
        assert!(!Checkpoint::new(8, bundle.block_id()).matches(&bundle));
    }
}
