//! Trust Store
//!
//! Persists the current trust root and verified historical bundles. The
//! engine is the only writer of the root; [`TrustStore::commit`] must replace
//! it atomically.

use crate::bundle::{hex_hash, Bundle};
use crate::types::Height;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Errors that can occur in trust store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A different bundle is already stored at this height
    #[error("conflicting bundle at height {height}: stored {stored}, new {new}")]
    Conflict {
        /// Height of the conflict
        height: Height,
        /// Block id already stored
        stored: String,
        /// Block id offered
        new: String,
    },
}

/// Storage for the trust root and verified bundles
pub trait TrustStore: Send + Sync {
    /// Current trust root, if one has been committed
    fn load(&self) -> Result<Option<Bundle>, StoreError>;

    /// Replace the trust root with `bundle` and store it by height
    fn commit(&self, bundle: Bundle) -> Result<(), StoreError>;

    /// Bundle stored at `height`
    fn load_at(&self, height: Height) -> Result<Option<Bundle>, StoreError>;

    /// Store a verified bundle without moving the trust root
    fn save(&self, bundle: Bundle) -> Result<(), StoreError>;

    /// Stored heights in ascending order
    fn heights(&self) -> Result<Vec<Height>, StoreError>;

    /// Keep at most `keep` bundles, never dropping the root. Returns the
    /// number removed.
    fn prune(&self, keep: usize) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    bundles: BTreeMap<Height, Bundle>,
    root: Option<Height>,
}

impl MemoryStoreInner {
    fn insert(&mut self, bundle: Bundle) -> Result<(), StoreError> {
        if let Some(existing) = self.bundles.get(&bundle.height) {
            let (stored, new) = (existing.block_id(), bundle.block_id());
            if stored != new {
                return Err(StoreError::Conflict {
                    height: bundle.height,
                    stored: hex_hash(&stored),
                    new: hex_hash(&new),
                });
            }
            return Ok(());
        }
        self.bundles.insert(bundle.height, bundle);
        Ok(())
    }
}

/// In-memory trust store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored bundles
    pub fn len(&self) -> usize {
        self.inner.read().bundles.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.inner.read().bundles.is_empty()
    }
}

impl TrustStore for MemoryStore {
    fn load(&self) -> Result<Option<Bundle>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.root.and_then(|h| inner.bundles.get(&h).cloned()))
    }

    fn commit(&self, bundle: Bundle) -> Result<(), StoreError> {
        let height = bundle.height;
        let mut inner = self.inner.write();
        inner.insert(bundle)?;
        inner.root = Some(height);
        debug!("Committed trust root at height {}", height);
        Ok(())
    }

    fn load_at(&self, height: Height) -> Result<Option<Bundle>, StoreError> {
        Ok(self.inner.read().bundles.get(&height).cloned())
    }

    fn save(&self, bundle: Bundle) -> Result<(), StoreError> {
        let height = bundle.height;
        self.inner.write().insert(bundle)?;
        trace!("Saved bundle at height {}", height);
        Ok(())
    }

    fn heights(&self) -> Result<Vec<Height>, StoreError> {
        Ok(self.inner.read().bundles.keys().copied().collect())
    }

    fn prune(&self, keep: usize) -> Result<usize, StoreError> {
        let mut inner = self.inner.write();
        let keep = keep.max(1);
        if inner.bundles.len() <= keep {
            return Ok(0);
        }

        let root = inner.root;
        let excess = inner.bundles.len() - keep;
        let doomed: Vec<Height> = inner
            .bundles
            .keys()
            .copied()
            .filter(|h| Some(*h) != root)
            .take(excess)
            .collect();

        for height in &doomed {
            inner.bundles.remove(height);
        }

        debug!("Pruned {} bundles", doomed.len());
        Ok(doomed.len())
    }
}
