//! Light Client Implementation
//!
//! The verification engine. Given a target height it produces a new trusted
//! bundle or a typed rejection, leaving the trust store untouched on failure.
//!
//! ## Strategy
//!
//! - `target == trusted`: return the stored root, no remote calls.
//! - `target > trusted`: forward verification. In [`VerificationMode::Skipping`]
//!   the engine jumps straight to the target and bisects whenever a quorum
//!   rotation cannot be resolved across the step; in
//!   [`VerificationMode::Sequential`] it verifies every height.
//! - `target < trusted`: backward hash-chain walk.
//!
//! Before a forward result is committed it is cross-checked against the
//! witnesses (see [`crate::peers`]).
//!
//! ## Concurrency
//!
//! Operations that may advance the root are serialized by a gate. Every call
//! carries a [`CancellationToken`]; cancelling it, or reaching the overall
//! deadline, drops all in-flight fetches and leaves the store untouched.

use crate::bundle::{hex_hash, Bundle, Checkpoint};
use crate::constants::{
    DEFAULT_MAX_CLOCK_DRIFT, DEFAULT_MAX_RETRIES, DEFAULT_PRUNING_SIZE, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_RETRY_DELAY, DEFAULT_TRUST_PERIOD, DEFAULT_WITNESS_FAULT_THRESHOLD,
    DEFAULT_WITNESS_TIMEOUT,
};
use crate::peers::{FailoverController, ForkEvidence, PeerSet, WitnessRecord};
use crate::provider::{BlockSource, RetryPolicy};
use crate::quorum::{QuorumOracle, QuorumRotation, QuorumVerifier};
use crate::store::TrustStore;
use crate::types::{Height, PeerId, Timestamp};
use crate::verifier::{self, VerificationOptions};
use crate::{Error, Result, VerificationMode};
use lodestone_config::Config;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Construction-time options of a light client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightClientOptions {
    /// Chain every bundle must belong to
    pub chain_id: String,
    /// Maximum age of a trusted bundle
    pub trust_period: Duration,
    /// Tolerance for future-dated bundles
    pub max_clock_drift: Duration,
    /// Out-of-band root of trust
    pub checkpoint: Checkpoint,
    /// Forward verification mode
    pub mode: VerificationMode,
    /// Faults tolerated before a witness is dropped
    pub witness_fault_threshold: u32,
    /// Timeout of a single primary request
    pub request_timeout: Duration,
    /// Timeout of a single witness request
    pub witness_timeout: Duration,
    /// Retries per primary request after the first attempt
    pub max_retries: u32,
    /// Delay between attempts
    pub retry_delay: Duration,
    /// Bundles kept in the store (0 = unlimited)
    pub pruning_size: usize,
    /// Deadline for a whole verification call
    pub max_operation_time: Option<Duration>,
}

impl LightClientOptions {
    /// Options with defaults for everything but the chain and checkpoint
    pub fn new(chain_id: impl Into<String>, checkpoint: Checkpoint) -> Self {
        Self {
            chain_id: chain_id.into(),
            trust_period: DEFAULT_TRUST_PERIOD,
            max_clock_drift: DEFAULT_MAX_CLOCK_DRIFT,
            checkpoint,
            mode: VerificationMode::default(),
            witness_fault_threshold: DEFAULT_WITNESS_FAULT_THRESHOLD,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            witness_timeout: DEFAULT_WITNESS_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            pruning_size: DEFAULT_PRUNING_SIZE,
            max_operation_time: None,
        }
    }

    /// Check the options are usable
    pub fn validate(&self) -> Result<()> {
        if self.chain_id.is_empty() {
            return Err(Error::InvalidCheckpoint("chain id is empty".into()));
        }
        if self.checkpoint.height == 0 {
            return Err(Error::InvalidHeight(0));
        }
        if self.trust_period.is_zero() {
            return Err(Error::InvalidCheckpoint("trust period is zero".into()));
        }
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            request_timeout: self.request_timeout,
        }
    }

    fn verification(&self) -> VerificationOptions {
        VerificationOptions {
            chain_id: self.chain_id.clone(),
            trust_period: self.trust_period,
            max_clock_drift: self.max_clock_drift,
        }
    }
}

impl TryFrom<&Config> for LightClientOptions {
    type Error = Error;

    fn try_from(config: &Config) -> Result<Self> {
        config.validate()?;
        let checkpoint = Checkpoint::new(
            config.trust.checkpoint_height,
            config.trust.checkpoint_hash()?,
        );

        Ok(Self {
            chain_id: config.chain.chain_id.clone(),
            trust_period: config.trust.trust_period(),
            max_clock_drift: config.trust.max_clock_drift(),
            checkpoint,
            mode: config.verification.mode,
            witness_fault_threshold: config.peers.witness_fault_threshold,
            request_timeout: config.peers.request_timeout(),
            witness_timeout: config.peers.witness_timeout(),
            max_retries: config.peers.max_retries,
            retry_delay: config.peers.retry_delay(),
            pruning_size: config.verification.pruning_size,
            max_operation_time: config.verification.max_operation_time(),
        })
    }
}

/// State of the verification engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationState {
    /// Waiting for, or starting, a request
    Idle,
    /// Fetching a bundle from the primary
    FetchingCandidate,
    /// Checking a candidate against the trusted bundle
    ValidatingCandidate,
    /// Narrowing the step after an unresolved rotation
    Bisecting,
    /// Comparing the provisional bundle with witnesses
    CrossChecking,
    /// Last request committed a bundle
    Committed,
    /// Last request was rejected
    Rejected,
}

impl std::fmt::Display for VerificationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationState::Idle => write!(f, "Idle"),
            VerificationState::FetchingCandidate => write!(f, "Fetching Candidate"),
            VerificationState::ValidatingCandidate => write!(f, "Validating Candidate"),
            VerificationState::Bisecting => write!(f, "Bisecting"),
            VerificationState::CrossChecking => write!(f, "Cross-Checking"),
            VerificationState::Committed => write!(f, "Committed"),
            VerificationState::Rejected => write!(f, "Rejected"),
        }
    }
}

/// Statistics about the light client state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightClientStats {
    /// Height of the trust root
    pub trusted_height: Height,
    /// Bundles held by the store
    pub bundles_stored: usize,
    /// Current primary
    pub primary: PeerId,
    /// Current witnesses
    pub witnesses: usize,
    /// Fork evidence collected
    pub evidence: usize,
    /// Engine state
    pub state: VerificationState,
}

/// `ceil(log2(n))` for `n >= 1`
fn ceil_log2(n: u64) -> u32 {
    if n <= 1 {
        0
    } else {
        u64::BITS - (n - 1).leading_zeros()
    }
}

/// Main light client struct
pub struct LightClient {
    options: LightClientOptions,
    store: Arc<dyn TrustStore>,
    quorum: QuorumVerifier,
    failover: FailoverController,
    gate: tokio::sync::Mutex<()>,
    state: RwLock<VerificationState>,
}

impl LightClient {
    /// Create a light client and establish the root of trust.
    ///
    /// If the store already holds a root it is reused. Otherwise the
    /// checkpoint bundle is fetched from the primary, matched against the
    /// configured block id, its signature verified, cross-checked with the
    /// witnesses and committed.
    pub async fn new(
        options: LightClientOptions,
        peers: PeerSet,
        quorum: QuorumVerifier,
        store: Arc<dyn TrustStore>,
    ) -> Result<Self> {
        options.validate()?;

        let failover = FailoverController::new(
            peers,
            options.witness_fault_threshold,
            options.witness_timeout,
        );

        let client = Self {
            options,
            store,
            quorum,
            failover,
            gate: tokio::sync::Mutex::new(()),
            state: RwLock::new(VerificationState::Idle),
        };

        match client.store.load()? {
            Some(root) if root.chain_id == client.options.chain_id => {
                info!(
                    "Light client resumed at height {} ({})",
                    root.height,
                    root.block_id_hex()
                );
            }
            Some(root) => {
                return Err(Error::InvalidCheckpoint(format!(
                    "stored root belongs to chain {:?}",
                    root.chain_id
                )));
            }
            None => {
                client
                    .quorum
                    .ping()
                    .await
                    .map_err(|e| Error::OracleUnavailable(e.to_string()))?;
                client.initialize_from_checkpoint().await?
            }
        }

        Ok(client)
    }

    /// Build a client from a parsed configuration.
    ///
    /// `primary` must carry the configured primary id; witnesses not named
    /// in the configuration are ignored.
    pub async fn from_config(
        config: &Config,
        primary: Arc<dyn BlockSource>,
        witnesses: Vec<Arc<dyn BlockSource>>,
        oracle: Arc<dyn QuorumOracle>,
        store: Arc<dyn TrustStore>,
    ) -> Result<Self> {
        let options = LightClientOptions::try_from(config)?;

        if primary.peer_id() != config.peers.primary {
            return Err(Error::UnknownPeer(primary.peer_id().to_string()));
        }
        let witnesses = witnesses
            .into_iter()
            .filter(|w| config.peers.witnesses.iter().any(|id| id == w.peer_id()))
            .collect();

        let rotation = QuorumRotation::new(config.quorum_rotation_schedule()?);
        let quorum = QuorumVerifier::new(oracle, rotation);

        Self::new(options, PeerSet::new(primary, witnesses), quorum, store).await
    }

    async fn initialize_from_checkpoint(&self) -> Result<()> {
        let checkpoint = self.options.checkpoint;
        info!(
            "Initializing from checkpoint at height {} ({})",
            checkpoint.height,
            hex_hash(&checkpoint.block_id)
        );

        let bundle = self.fetch_candidate(checkpoint.height).await?;
        if !checkpoint.matches(&bundle) {
            return Err(Error::InvalidCheckpoint(format!(
                "primary {} returned block {} at height {}",
                self.failover.primary_id(),
                bundle.block_id_hex(),
                checkpoint.height
            )));
        }
        if bundle.chain_id != self.options.chain_id {
            return Err(Error::InvalidCheckpoint(format!(
                "checkpoint belongs to chain {:?}",
                bundle.chain_id
            )));
        }
        if !bundle.signs_own_block_id() {
            return Err(Error::InvalidCheckpoint(
                "checkpoint commit does not sign its block id".into(),
            ));
        }
        verifier::verify_signature(&bundle, &self.quorum).await?;
        self.failover.cross_check(&bundle, bundle.timestamp).await?;

        self.store.commit(bundle)?;
        info!("Light client initialized at height {}", checkpoint.height);
        Ok(())
    }

    /// Height of the committed trust root
    pub fn trusted_height(&self) -> Result<Height> {
        Ok(self.trusted_bundle()?.height)
    }

    /// The committed trust root
    pub fn trusted_bundle(&self) -> Result<Bundle> {
        self.store
            .load()?
            .ok_or_else(|| Error::InvalidCheckpoint("trust store has no root".into()))
    }

    /// A verified bundle held by the store
    pub fn bundle_at(&self, height: Height) -> Result<Option<Bundle>> {
        Ok(self.store.load_at(height)?)
    }

    /// Construction options
    pub fn options(&self) -> &LightClientOptions {
        &self.options
    }

    /// Current engine state
    pub fn state(&self) -> VerificationState {
        *self.state.read()
    }

    /// Current primary
    pub fn primary(&self) -> PeerId {
        self.failover.primary_id()
    }

    /// Current witnesses
    pub fn witnesses(&self) -> Vec<PeerId> {
        self.failover.witness_ids()
    }

    /// Witness bookkeeping
    pub fn witness_records(&self) -> Vec<WitnessRecord> {
        self.failover.witness_records()
    }

    /// Peers dropped for serving a fork
    pub fn faulty_peers(&self) -> Vec<PeerId> {
        self.failover.faulty_peers()
    }

    /// Fork evidence collected so far
    pub fn evidence(&self) -> Vec<ForkEvidence> {
        self.failover.evidence()
    }

    /// Statistics about the light client state
    pub fn stats(&self) -> Result<LightClientStats> {
        Ok(LightClientStats {
            trusted_height: self.trusted_height()?,
            bundles_stored: self.store.heights()?.len(),
            primary: self.primary(),
            witnesses: self.witnesses().len(),
            evidence: self.evidence().len(),
            state: self.state(),
        })
    }

    fn set_state(&self, state: VerificationState) {
        let mut current = self.state.write();
        if *current != state {
            trace!("Verification state: {} -> {}", *current, state);
            *current = state;
        }
    }

    /// Verify the primary's latest height.
    pub async fn update(&self, now: Timestamp) -> Result<Bundle> {
        let primary = self.failover.primary();
        let latest = match tokio::time::timeout(
            self.options.request_timeout,
            primary.latest_height(),
        )
        .await
        {
            Ok(Ok(height)) => height,
            Ok(Err(e)) => {
                return Err(Error::ProviderUnavailable {
                    peer: primary.peer_id().to_string(),
                    height: 0,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(Error::ProviderUnavailable {
                    peer: primary.peer_id().to_string(),
                    height: 0,
                    reason: format!(
                        "latest height timed out after {:?}",
                        self.options.request_timeout
                    ),
                })
            }
        };

        let trusted = self.trusted_bundle()?;
        if latest <= trusted.height {
            debug!("Already trusted up to {} (primary at {})", trusted.height, latest);
            return Ok(trusted);
        }
        self.verify_at_height(latest, now).await
    }

    /// Verify the bundle at `target` as seen at time `now`.
    pub async fn verify_at_height(&self, target: Height, now: Timestamp) -> Result<Bundle> {
        self.verify_at_height_with_cancel(target, now, &CancellationToken::new())
            .await
    }

    /// Verify the bundle at `target`, aborting when `cancel` fires.
    ///
    /// Cancellation never commits a partial result.
    pub async fn verify_at_height_with_cancel(
        &self,
        target: Height,
        now: Timestamp,
        cancel: &CancellationToken,
    ) -> Result<Bundle> {
        if target == 0 {
            return Err(Error::InvalidHeight(0));
        }

        // Cache hit: no gate, no remote calls
        if let Some(root) = self.store.load()? {
            if root.height == target {
                trace!("Height {} is the trust root", target);
                return Ok(root);
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let work = async {
            let _gate = self.gate.lock().await;
            self.set_state(VerificationState::Idle);

            let result = self.verify_locked(target, now).await;
            match &result {
                Ok(bundle) => {
                    self.set_state(VerificationState::Committed);
                    debug!("Verified height {} ({})", target, bundle.block_id_hex());
                }
                Err(e) => {
                    self.set_state(VerificationState::Rejected);
                    warn!("Verification of height {} rejected: {}", target, e);
                }
            }
            result
        };

        let bounded = async {
            match self.options.max_operation_time {
                Some(deadline) => match tokio::time::timeout(deadline, work).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::DeadlineExceeded(deadline)),
                },
                None => work.await,
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = bounded => result,
        };

        if matches!(result, Err(Error::Cancelled | Error::DeadlineExceeded(_))) {
            self.set_state(VerificationState::Rejected);
            warn!("Verification of height {} aborted", target);
        }
        result
    }

    async fn verify_locked(&self, target: Height, now: Timestamp) -> Result<Bundle> {
        let trusted = self.trusted_bundle()?;

        match target.cmp(&trusted.height) {
            std::cmp::Ordering::Equal => Ok(trusted),
            std::cmp::Ordering::Greater => self.verify_forward(trusted, target, now).await,
            std::cmp::Ordering::Less => self.verify_backward(trusted, target).await,
        }
    }

    async fn verify_forward(
        &self,
        trusted: Bundle,
        target: Height,
        now: Timestamp,
    ) -> Result<Bundle> {
        verifier::check_trust_not_expired(&trusted, target, now, self.options.trust_period)?;

        info!(
            "Verifying height {} from trusted height {} ({:?})",
            target, trusted.height, self.options.mode
        );

        let mut path = match self.options.mode {
            VerificationMode::Skipping => self.bisect(trusted, target, now).await?,
            VerificationMode::Sequential => self.verify_sequential(trusted, target, now).await?,
        };
        let provisional = path.pop().ok_or(Error::BisectionExhausted {
            trusted_height: target,
            target,
        })?;

        self.set_state(VerificationState::CrossChecking);
        self.failover.cross_check(&provisional, now).await?;

        self.commit(provisional.clone(), path)?;
        Ok(provisional)
    }

    async fn fetch_candidate(&self, height: Height) -> Result<Bundle> {
        self.set_state(VerificationState::FetchingCandidate);
        let bundle = self
            .failover
            .fetch_from_primary(height, &self.options.retry_policy())
            .await?;
        verifier::check_requested_height(&bundle, height)?;
        Ok(bundle)
    }

    /// One forward step from `trusted` to an already-fetched `candidate`.
    async fn verify_adjacent(
        &self,
        trusted: &Bundle,
        candidate: &Bundle,
        now: Timestamp,
    ) -> Result<()> {
        self.set_state(VerificationState::ValidatingCandidate);
        let result = verifier::verify_candidate(
            trusted,
            candidate,
            now,
            &self.options.verification(),
            &self.quorum,
        )
        .await;

        if let Err(Error::InvalidSignature { height, .. }) = &result {
            warn!(
                "Primary {} served an invalid signature at height {}",
                self.failover.primary_id(),
                height
            );
        }
        result
    }

    /// Verify every height in `(trusted, target]`.
    async fn verify_sequential(
        &self,
        trusted: Bundle,
        target: Height,
        now: Timestamp,
    ) -> Result<Vec<Bundle>> {
        let mut trusted = trusted;
        let mut path = Vec::new();

        for height in trusted.height + 1..=target {
            let candidate = self.fetch_candidate(height).await?;
            self.verify_adjacent(&trusted, &candidate, now).await?;
            path.push(candidate.clone());
            trusted = candidate;
        }

        Ok(path)
    }

    /// Skipping verification with bisection on unresolved rotations.
    ///
    /// `pending` is a work-list of fetched, not yet verified bundles; its top
    /// is the next candidate. Each pivot halves the gap between the trusted
    /// height and the top, so the list never exceeds
    /// `ceil(log2(target - trusted)) + 1` entries.
    async fn bisect(&self, trusted: Bundle, target: Height, now: Timestamp) -> Result<Vec<Bundle>> {
        let max_pending = ceil_log2(target - trusted.height) as usize + 1;
        let mut trusted = trusted;
        let mut path = Vec::new();
        let mut pending = vec![self.fetch_candidate(target).await?];

        while let Some(candidate) = pending.last() {
            let outcome = self.verify_adjacent(&trusted, candidate, now).await;
            let candidate_height = candidate.height;

            match outcome {
                Ok(()) => {
                    if let Some(verified) = pending.pop() {
                        trace!("Trusted height advanced to {}", verified.height);
                        trusted = verified.clone();
                        path.push(verified);
                    }
                }
                Err(Error::QuorumMismatch { .. }) if candidate_height > trusted.height + 1 => {
                    self.set_state(VerificationState::Bisecting);
                    if pending.len() >= max_pending {
                        return Err(Error::BisectionExhausted {
                            trusted_height: trusted.height,
                            target: candidate_height,
                        });
                    }

                    let pivot = trusted.height + (candidate_height - trusted.height) / 2;
                    debug!(
                        "Bisecting between {} and {}: pivot {}",
                        trusted.height, candidate_height, pivot
                    );
                    pending.push(self.fetch_candidate(pivot).await?);
                }
                Err(Error::QuorumMismatch { .. }) => {
                    return Err(Error::BisectionExhausted {
                        trusted_height: trusted.height,
                        target: candidate_height,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(path)
    }

    /// Walk back from `trusted` to `target` by hash linkage.
    async fn verify_backward(&self, trusted: Bundle, target: Height) -> Result<Bundle> {
        if let Some(stored) = self.store.load_at(target)? {
            trace!("Height {} already verified", target);
            return Ok(stored);
        }

        info!(
            "Walking back from trusted height {} to {}",
            trusted.height, target
        );

        let mut frontier = trusted;
        let mut verified = Vec::new();

        while frontier.height > target {
            let height = frontier.height - 1;
            let previous = match self.store.load_at(height)? {
                Some(stored) => stored,
                None => self.fetch_candidate(height).await?,
            };

            self.set_state(VerificationState::ValidatingCandidate);
            verifier::verify_linkage(&frontier, &previous)?;
            verified.push(previous.clone());
            frontier = previous;
        }

        for bundle in verified {
            self.store.save(bundle)?;
        }
        Ok(frontier)
    }

    /// Persist the intermediate bundles, then move the root.
    fn commit(&self, root: Bundle, path: Vec<Bundle>) -> Result<()> {
        for bundle in path {
            self.store.save(bundle)?;
        }

        let height = root.height;
        let block_id = root.block_id_hex();
        self.store.commit(root)?;

        if self.options.pruning_size > 0 {
            if let Err(e) = self.store.prune(self.options.pruning_size) {
                warn!("Failed to prune trust store: {}", e);
            }
        }

        info!("Committed trust root at height {} ({})", height, block_id);
        Ok(())
    }
}
