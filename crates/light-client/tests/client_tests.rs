//! Tests for the verification engine

use lodestone_config::Config;
use lodestone_light_client::{
    mock::{MockChain, MockProvider, MockQuorumOracle},
    BlockSource, Error, LightClient, LightClientOptions, MemoryStore, PeerSet, QuorumVerifier,
    TrustStore, VerificationMode, VerificationState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CHAIN_ID: &str = "lodestone-test";
const GENESIS_TIME: u64 = 1_700_000_000;
const BLOCK_INTERVAL: u64 = 60;
const YEAR: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Unix time `minutes` after the first block
fn minutes(minutes: u64) -> u64 {
    GENESIS_TIME + minutes * 60
}

struct Harness {
    chain: MockChain,
    primary: Arc<MockProvider>,
    witnesses: Vec<Arc<MockProvider>>,
    oracle: Arc<MockQuorumOracle>,
    oracle_timeout: Option<Duration>,
    store: Arc<MemoryStore>,
}

impl Harness {
    fn new(chain: MockChain) -> Self {
        Self {
            primary: Arc::new(chain.provider("primary")),
            oracle: Arc::new(chain.oracle()),
            oracle_timeout: None,
            store: Arc::new(MemoryStore::new()),
            witnesses: Vec::new(),
            chain,
        }
    }

    fn with_witness(mut self, witness: MockProvider) -> Self {
        self.witnesses.push(Arc::new(witness));
        self
    }

    fn with_oracle_timeout(mut self, timeout: Duration) -> Self {
        self.oracle_timeout = Some(timeout);
        self
    }

    fn options(&self, checkpoint_height: u64, mode: VerificationMode) -> LightClientOptions {
        let checkpoint = self.chain.checkpoint(checkpoint_height).unwrap();
        let mut options = LightClientOptions::new(CHAIN_ID, checkpoint);
        options.trust_period = YEAR;
        options.mode = mode;
        options.retry_delay = Duration::from_millis(10);
        options
    }

    async fn try_client(&self, options: LightClientOptions) -> Result<LightClient, Error> {
        let witnesses = self
            .witnesses
            .iter()
            .map(|w| w.clone() as Arc<dyn BlockSource>)
            .collect();
        let peers = PeerSet::new(self.primary.clone(), witnesses);
        let mut quorum = QuorumVerifier::new(self.oracle.clone(), self.chain.rotation());
        if let Some(timeout) = self.oracle_timeout {
            quorum = quorum.with_timeout(timeout);
        }
        LightClient::new(options, peers, quorum, self.store.clone()).await
    }

    async fn client(&self, checkpoint_height: u64, mode: VerificationMode) -> LightClient {
        let options = self.options(checkpoint_height, mode);
        match self.try_client(options).await {
            Ok(client) => client,
            Err(e) => panic!("client construction failed: {}", e),
        }
    }
}

fn chain(length: u64, rotation_interval: u64) -> MockChain {
    MockChain::generate(CHAIN_ID, length, rotation_interval, GENESIS_TIME, BLOCK_INTERVAL)
}

#[tokio::test]
async fn test_initializes_from_checkpoint() {
    let harness = Harness::new(chain(10, 100));
    let client = harness.client(1, VerificationMode::Skipping).await;

    assert_eq!(client.trusted_height().unwrap(), 1);
    assert_eq!(&client.trusted_bundle().unwrap(), harness.chain.bundle(1).unwrap());
    assert_eq!(client.state(), VerificationState::Idle);
}

#[tokio::test]
async fn test_checkpoint_mismatch_rejected() {
    let harness = Harness::new(chain(10, 100));
    let mut options = harness.options(1, VerificationMode::Skipping);
    options.checkpoint.block_id = [0xee; 32];

    let result = harness.try_client(options).await;
    assert!(matches!(result, Err(Error::InvalidCheckpoint(_))));
    assert!(harness.store.load().unwrap().is_none());
}

#[tokio::test]
async fn test_cache_hit_makes_no_remote_calls() {
    let harness = Harness::new(chain(600, 100));
    let client = harness.client(1, VerificationMode::Skipping).await;

    let fetches = harness.primary.fetch_count();
    let oracle_calls = harness.oracle.call_count();
    let bundle = client.verify_at_height(1, minutes(10)).await.unwrap();
    assert_eq!(&bundle, harness.chain.bundle(1).unwrap());
    assert_eq!(harness.primary.fetch_count(), fetches);
    assert_eq!(harness.oracle.call_count(), oracle_calls);

    client.verify_at_height(500, minutes(600)).await.unwrap();
    let fetches = harness.primary.fetch_count();
    let oracle_calls = harness.oracle.call_count();
    let again = client.verify_at_height(500, minutes(600)).await.unwrap();
    assert_eq!(&again, harness.chain.bundle(500).unwrap());
    assert_eq!(harness.primary.fetch_count(), fetches);
    assert_eq!(harness.oracle.call_count(), oracle_calls);
}

#[tokio::test]
async fn test_bisection_matches_sequential() {
    let skipping = Harness::new(chain(200, 50));
    let sequential = Harness::new(chain(200, 50));

    let skip_client = skipping.client(1, VerificationMode::Skipping).await;
    let seq_client = sequential.client(1, VerificationMode::Sequential).await;

    let now = minutes(200);
    let a = skip_client.verify_at_height(200, now).await.unwrap();
    let b = seq_client.verify_at_height(200, now).await.unwrap();

    assert_eq!(a, b);
    assert_eq!(a.block_id(), skipping.chain.bundle(200).unwrap().block_id());
    assert_eq!(skip_client.trusted_height().unwrap(), 200);
    assert_eq!(seq_client.trusted_height().unwrap(), 200);
    // Skipping should not need every height
    assert!(skipping.primary.fetch_count() < sequential.primary.fetch_count());
}

#[tokio::test]
async fn test_sequential_rejects_single_bad_link() {
    let mut bad = chain(100, 10);
    bad.corrupt_signature(50);
    let harness = Harness::new(bad);
    let client = harness.client(1, VerificationMode::Sequential).await;

    let result = client.verify_at_height(100, minutes(100)).await;
    assert!(matches!(result, Err(Error::InvalidSignature { height: 50, .. })));
    assert_eq!(client.trusted_height().unwrap(), 1);
    assert!(client.bundle_at(49).unwrap().is_none());
    assert_eq!(client.state(), VerificationState::Rejected);
}

#[tokio::test]
async fn test_bisection_rejects_bad_bundle_on_verified_path() {
    // Rotations every 100 heights: 1 -> 1000 bisects through 500 and 250
    // before height 125 resolves the first rotation.
    let mut bad = chain(1000, 100);
    bad.corrupt_signature(125);
    let harness = Harness::new(bad);
    let client = harness.client(1, VerificationMode::Skipping).await;

    let result = client.verify_at_height(1000, minutes(1000)).await;
    assert!(matches!(result, Err(Error::InvalidSignature { height: 125, .. })));
    assert_eq!(client.trusted_height().unwrap(), 1);
}

#[tokio::test]
async fn test_bisection_visits_every_height_when_quorum_rotates_each_block() {
    let mut bad = chain(64, 1);
    bad.corrupt_signature(40);
    let harness = Harness::new(bad);
    let client = harness.client(1, VerificationMode::Skipping).await;

    let result = client.verify_at_height(64, minutes(64)).await;
    assert!(matches!(result, Err(Error::InvalidSignature { height: 40, .. })));
    assert_eq!(client.trusted_height().unwrap(), 1);
}

#[tokio::test]
async fn test_skipping_does_not_check_bundles_off_its_path() {
    // One quorum signs the whole chain, so 1 -> 100 is a single step and
    // height 50 is never fetched.
    let mut bad = chain(100, 1000);
    bad.corrupt_signature(50);

    let skipping = Harness::new(bad.clone());
    let client = skipping.client(1, VerificationMode::Skipping).await;
    let bundle = client.verify_at_height(100, minutes(100)).await.unwrap();
    assert_eq!(&bundle, skipping.chain.bundle(100).unwrap());
    assert_eq!(client.trusted_height().unwrap(), 100);
    assert!(client.bundle_at(50).unwrap().is_none());

    let sequential = Harness::new(bad);
    let client = sequential.client(1, VerificationMode::Sequential).await;
    let result = client.verify_at_height(100, minutes(100)).await;
    assert!(matches!(result, Err(Error::InvalidSignature { height: 50, .. })));
    assert_eq!(client.trusted_height().unwrap(), 1);
}

#[tokio::test]
async fn test_bisection_through_every_rotation() {
    let harness = Harness::new(chain(64, 1));
    let client = harness.client(1, VerificationMode::Skipping).await;

    let bundle = client.verify_at_height(64, minutes(64)).await.unwrap();
    assert_eq!(&bundle, harness.chain.bundle(64).unwrap());
    // Every intermediate height had to be verified and is kept
    assert!(client.bundle_at(33).unwrap().is_some());
}

#[tokio::test]
async fn test_rotation_across_one_boundary_in_one_step() {
    let harness = Harness::new(chain(200, 100));
    let client = harness.client(1, VerificationMode::Skipping).await;

    let fetches = harness.primary.fetch_count();
    let bundle = client.verify_at_height(150, minutes(150)).await.unwrap();
    assert_eq!(&bundle, harness.chain.bundle(150).unwrap());
    assert_ne!(bundle.quorum_hash, harness.chain.bundle(1).unwrap().quorum_hash);
    assert_eq!(harness.primary.fetch_count(), fetches + 1);
}

#[tokio::test]
async fn test_unknown_rotation_exhausts_bisection() {
    // The schedule declares no rotation, so adjacent steps cannot resolve it
    let chain = chain(20, 10);
    let harness = Harness::new(chain);
    let witnesses = Vec::new();
    let peers = PeerSet::new(harness.primary.clone(), witnesses);
    let quorum = QuorumVerifier::new(harness.oracle.clone(), Default::default());
    let client = LightClient::new(
        harness.options(1, VerificationMode::Skipping),
        peers,
        quorum,
        harness.store.clone(),
    )
    .await
    .map_err(|e| e.to_string())
    .unwrap();

    let result = client.verify_at_height(20, minutes(20)).await;
    assert!(matches!(
        result,
        Err(Error::BisectionExhausted {
            trusted_height: 10,
            target: 11
        })
    ));
    assert_eq!(client.trusted_height().unwrap(), 1);
}

#[tokio::test]
async fn test_expiry_dominates_signature_validity() {
    let harness = Harness::new(chain(100, 1000));
    let mut options = harness.options(1, VerificationMode::Skipping);
    options.trust_period = Duration::from_secs(30 * 60);
    options.max_clock_drift = Duration::from_secs(60 * 60);
    let client = harness.try_client(options).await.unwrap_or_else(|e| panic!("{}", e));

    // Root still fresh at `now`, candidate dated past the trust window
    let candidate_time = harness.chain.bundle(40).unwrap().timestamp;
    let result = client.verify_at_height(40, minutes(20)).await;
    match result {
        Err(e @ Error::ExpiredTrust { .. }) => {
            assert!(e.is_fatal());
            if let Error::ExpiredTrust { at, .. } = e {
                assert_eq!(at, candidate_time);
            }
        }
        other => panic!("expected ExpiredTrust, got {:?}", other),
    }

    // Root itself expired
    let result = client.verify_at_height(10, minutes(100)).await;
    assert!(matches!(result, Err(Error::ExpiredTrust { .. })));
    assert_eq!(client.trusted_height().unwrap(), 1);
}

#[tokio::test]
async fn test_clock_drift_rejected() {
    let harness = Harness::new(chain(100, 1000));
    let client = harness.client(1, VerificationMode::Skipping).await;

    // Height 50 is stamped 49 minutes in; the local clock says 10
    let result = client.verify_at_height(50, minutes(10)).await;
    match result {
        Err(e @ Error::ClockDrift { .. }) => assert!(e.is_retryable()),
        other => panic!("expected ClockDrift, got {:?}", other),
    }
}

#[tokio::test]
async fn test_scenario_1_to_1000() {
    let harness = Harness::new(chain(1000, 100));
    let client = harness.client(1, VerificationMode::Skipping).await;

    let bundle = client.verify_at_height(1000, minutes(1000)).await.unwrap();
    assert_eq!(bundle.height, 1000);
    assert_eq!(client.trusted_height().unwrap(), 1000);
    assert_eq!(client.state(), VerificationState::Committed);
}

#[tokio::test]
async fn test_scenario_1_to_1000_expired() {
    let harness = Harness::new(chain(1000, 100));
    let client = harness.client(1, VerificationMode::Skipping).await;

    let result = client.verify_at_height(1000, minutes(1_000_000)).await;
    assert!(matches!(result, Err(Error::ExpiredTrust { .. })));
    assert_eq!(client.trusted_height().unwrap(), 1);
}

#[tokio::test]
async fn test_backward_walk() {
    let harness = Harness::new(chain(1000, 100));
    let client = harness.client(1000, VerificationMode::Skipping).await;

    let bundle = client.verify_at_height(1, minutes(1000)).await.unwrap();
    assert_eq!(&bundle, harness.chain.bundle(1).unwrap());
    // The root does not move backwards
    assert_eq!(client.trusted_height().unwrap(), 1000);
    assert!(client.bundle_at(500).unwrap().is_some());

    // Second walk is served from the store
    let fetches = harness.primary.fetch_count();
    let oracle_calls = harness.oracle.call_count();
    client.verify_at_height(250, minutes(1000)).await.unwrap();
    assert_eq!(harness.primary.fetch_count(), fetches);
    assert_eq!(harness.oracle.call_count(), oracle_calls);
}

#[tokio::test]
async fn test_backward_walk_rejects_broken_link() {
    let mut broken = chain(1000, 100);
    broken.break_link(500);
    let harness = Harness::new(broken);
    let client = harness.client(1000, VerificationMode::Skipping).await;

    let result = client.verify_at_height(1, minutes(1000)).await;
    assert!(matches!(result, Err(Error::InvalidHeader { height: 500, .. })));
    assert_eq!(client.trusted_height().unwrap(), 1000);
    assert!(client.bundle_at(700).unwrap().is_none());
}

#[tokio::test]
async fn test_fork_halts_commit() {
    let main = chain(100, 1000);
    let fork = main.fork_at(50);
    let harness = Harness::new(main).with_witness(fork.provider("witness-a"));
    let client = harness.client(1, VerificationMode::Skipping).await;

    let result = client.verify_at_height(100, minutes(100)).await;
    match result {
        Err(e @ Error::ForkDetected { .. }) => assert!(e.is_retryable()),
        other => panic!("expected ForkDetected, got {:?}", other),
    }

    assert_eq!(client.trusted_height().unwrap(), 1);
    assert!(client.bundle_at(100).unwrap().is_none());

    let evidence = client.evidence();
    assert_eq!(evidence.len(), 1);
    assert_eq!(evidence[0].height, 100);
    assert_eq!(evidence[0].witness, "witness-a");
    assert_ne!(evidence[0].primary_bundle, evidence[0].witness_bundle);

    // The disagreeing witness replaced the primary
    assert_eq!(client.primary(), "witness-a");
    assert_eq!(client.faulty_peers(), vec!["primary".to_string()]);
}

#[tokio::test]
async fn test_witness_agreement_commits() {
    let main = chain(100, 50);
    let harness = Harness::new(main.clone())
        .with_witness(main.provider("witness-a"))
        .with_witness(main.provider("witness-b"));
    let client = harness.client(1, VerificationMode::Skipping).await;

    client.verify_at_height(100, minutes(100)).await.unwrap();
    let records = client.witness_records();
    assert_eq!(records.len(), 2);
    assert!(records
        .iter()
        .all(|r| r.last_responsive_height == Some(100) && r.fault_count == 0));
}

#[tokio::test]
async fn test_oracle_unavailable_is_retryable() {
    let harness = Harness::new(chain(100, 1000));
    let client = harness.client(1, VerificationMode::Skipping).await;
    harness.oracle.set_reachable(false);

    let result = client.verify_at_height(100, minutes(100)).await;
    match result {
        Err(e @ Error::OracleUnavailable(_)) => assert!(e.is_retryable()),
        other => panic!("expected OracleUnavailable, got {:?}", other),
    }
    assert_eq!(client.trusted_height().unwrap(), 1);

    harness.oracle.set_reachable(true);
    client.verify_at_height(100, minutes(100)).await.unwrap();
}

#[tokio::test]
async fn test_unreachable_oracle_fails_construction() {
    let harness = Harness::new(chain(10, 100));
    harness.oracle.set_reachable(false);

    let result = harness
        .try_client(harness.options(1, VerificationMode::Skipping))
        .await;
    assert!(matches!(result, Err(Error::OracleUnavailable(_))));
    assert!(harness.store.load().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_slow_oracle_times_out() {
    let harness = Harness::new(chain(300, 100)).with_oracle_timeout(Duration::from_secs(1));
    let client = harness.client(1, VerificationMode::Skipping).await;
    harness.oracle.set_delay(Some(Duration::from_secs(10)));

    let result = client.verify_at_height(150, minutes(150)).await;
    match result {
        Err(e @ Error::OracleUnavailable(_)) => assert!(e.is_retryable()),
        other => panic!("expected OracleUnavailable, got {:?}", other),
    }
    assert_eq!(client.trusted_height().unwrap(), 1);

    harness.oracle.set_delay(None);
    client.verify_at_height(150, minutes(150)).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_requests_on_one_client() {
    let harness = Harness::new(chain(600, 100));
    let client = harness.client(1, VerificationMode::Skipping).await;

    let (high, low) = tokio::join!(
        client.verify_at_height(500, minutes(600)),
        client.verify_at_height(300, minutes(600))
    );

    assert_eq!(&high.unwrap(), harness.chain.bundle(500).unwrap());
    assert_eq!(&low.unwrap(), harness.chain.bundle(300).unwrap());
    assert_eq!(client.trusted_height().unwrap(), 500);
    assert_eq!(harness.store.load().unwrap().unwrap().height, 500);
}

#[tokio::test]
async fn test_height_not_available() {
    let harness = Harness::new(chain(100, 1000));
    let client = harness.client(1, VerificationMode::Skipping).await;

    let result = client.verify_at_height(500, minutes(500)).await;
    assert!(matches!(
        result,
        Err(Error::HeightNotAvailable { height: 500, .. })
    ));
    // Not a reason to abandon the primary
    assert_eq!(client.primary(), "primary");
}

#[tokio::test]
async fn test_height_beyond_chain_tip() {
    let harness = Harness::new(chain(10, 100));
    let client = harness.client(1, VerificationMode::Sequential).await;

    let result = client.verify_at_height(u64::MAX, minutes(10)).await;
    assert!(matches!(
        result,
        Err(Error::HeightNotAvailable { height: 11, .. })
    ));
    assert_eq!(client.trusted_height().unwrap(), 1);

    let harness = Harness::new(chain(10, 100));
    let client = harness.client(1, VerificationMode::Skipping).await;
    let result = client.verify_at_height(u64::MAX, minutes(10)).await;
    assert!(matches!(result, Err(Error::HeightNotAvailable { .. })));
    assert_eq!(client.trusted_height().unwrap(), 1);
}

#[tokio::test]
async fn test_zero_height_rejected() {
    let harness = Harness::new(chain(10, 100));
    let client = harness.client(1, VerificationMode::Skipping).await;

    let result = client.verify_at_height(0, minutes(10)).await;
    assert!(matches!(result, Err(Error::InvalidHeight(0))));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_leaves_state_untouched() {
    let harness = Harness::new(chain(100, 1000));
    let client = harness.client(1, VerificationMode::Sequential).await;
    harness.primary.set_delay(Some(Duration::from_millis(100)));

    let token = CancellationToken::new();
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        token.cancel();
    };
    let (result, ()) = tokio::join!(
        client.verify_at_height_with_cancel(100, minutes(100), &token),
        cancel
    );

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(client.trusted_height().unwrap(), 1);
    assert_eq!(harness.store.len(), 1);
    assert_eq!(client.state(), VerificationState::Rejected);

    // An already-cancelled token fails fast
    let fetches = harness.primary.fetch_count();
    let result = client
        .verify_at_height_with_cancel(100, minutes(100), &token)
        .await;
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(harness.primary.fetch_count(), fetches);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_exceeded() {
    let harness = Harness::new(chain(100, 1000));
    let mut options = harness.options(1, VerificationMode::Sequential);
    options.max_operation_time = Some(Duration::from_secs(1));
    let client = harness.try_client(options).await.unwrap_or_else(|e| panic!("{}", e));
    harness.primary.set_delay(Some(Duration::from_millis(100)));

    let result = client.verify_at_height(100, minutes(100)).await;
    match result {
        Err(e @ Error::DeadlineExceeded(_)) => assert!(e.is_retryable()),
        other => panic!("expected DeadlineExceeded, got {:?}", other),
    }
    assert_eq!(client.trusted_height().unwrap(), 1);
}

#[tokio::test]
async fn test_update_follows_primary() {
    let harness = Harness::new(chain(300, 100));
    let client = harness.client(1, VerificationMode::Skipping).await;

    let bundle = client.update(minutes(300)).await.unwrap();
    assert_eq!(bundle.height, 300);

    // Nothing new: returns the root
    let again = client.update(minutes(300)).await.unwrap();
    assert_eq!(again, bundle);
}

#[tokio::test]
async fn test_resumes_from_store() {
    let harness = Harness::new(chain(300, 100));
    let client = harness.client(1, VerificationMode::Skipping).await;
    client.verify_at_height(300, minutes(300)).await.unwrap();
    drop(client);

    let resumed = harness.client(1, VerificationMode::Skipping).await;
    assert_eq!(resumed.trusted_height().unwrap(), 300);
}

#[tokio::test]
async fn test_pruning_keeps_root() {
    let harness = Harness::new(chain(64, 1));
    let mut options = harness.options(1, VerificationMode::Sequential);
    options.pruning_size = 10;
    let client = harness.try_client(options).await.unwrap_or_else(|e| panic!("{}", e));

    client.verify_at_height(64, minutes(64)).await.unwrap();
    assert_eq!(harness.store.len(), 10);
    assert_eq!(client.trusted_height().unwrap(), 64);
    assert!(client.bundle_at(1).unwrap().is_none());

    let stats = client.stats().unwrap();
    assert_eq!(stats.trusted_height, 64);
    assert_eq!(stats.bundles_stored, 10);
}

#[tokio::test]
async fn test_from_config() {
    let chain = chain(300, 100);
    let mut config = Config::default();
    config.chain.chain_id = CHAIN_ID.to_string();
    config.trust.trust_period_secs = YEAR.as_secs();
    config.trust.checkpoint_height = 1;
    config.trust.checkpoint_hash = hex::encode(chain.checkpoint(1).unwrap().block_id);
    config.peers.primary = "primary".to_string();
    config.peers.witnesses = vec!["witness-a".to_string()];
    for h in [1u64, 101, 201] {
        let quorum_hash = chain.bundle(h).unwrap().quorum_hash;
        config
            .quorum_rotations
            .insert(h.to_string(), hex::encode(quorum_hash));
    }

    let options = LightClientOptions::try_from(&config).unwrap();
    assert_eq!(options.trust_period, YEAR);
    assert_eq!(options.checkpoint, chain.checkpoint(1).unwrap());

    let primary: Arc<dyn BlockSource> = Arc::new(chain.provider("primary"));
    let witnesses: Vec<Arc<dyn BlockSource>> = vec![
        Arc::new(chain.provider("witness-a")),
        Arc::new(chain.provider("stranger")),
    ];
    let client = LightClient::from_config(
        &config,
        primary,
        witnesses,
        Arc::new(chain.oracle()),
        Arc::new(MemoryStore::new()),
    )
    .await
    .unwrap_or_else(|e| panic!("{}", e));

    assert_eq!(client.witnesses(), vec!["witness-a".to_string()]);
    client.verify_at_height(300, minutes(300)).await.unwrap();

    // Wrong primary
    let result = LightClient::from_config(
        &config,
        Arc::new(chain.provider("someone-else")),
        Vec::new(),
        Arc::new(chain.oracle()),
        Arc::new(MemoryStore::new()),
    )
    .await;
    assert!(matches!(result, Err(Error::UnknownPeer(_))));
}
