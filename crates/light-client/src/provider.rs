//! Block Sources
//!
//! A [`BlockSource`] fetches the bundle for a height from one named peer. The
//! same capability backs both roles: the *primary*, which drives
//! verification, and *witnesses*, which only corroborate it.

use crate::bundle::Bundle;
use crate::constants::{DEFAULT_MAX_RETRIES, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRY_DELAY};
use crate::types::Height;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Errors returned by a block source
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The peer does not have this height (pruned or not produced yet)
    #[error("height {0} not available")]
    HeightNotAvailable(Height),

    /// The peer could not be reached
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// The request timed out
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The peer answered with data that could not be decoded
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Transport failures that may succeed on another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Unreachable(_) | ProviderError::Timeout(_))
    }
}

/// Source of bundles from one peer
///
/// Implementations must be safe to call concurrently.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Identifier of the peer behind this source
    fn peer_id(&self) -> &str;

    /// Fetch the bundle at `height`
    async fn fetch(&self, height: Height) -> Result<Bundle, ProviderError>;

    /// Latest height the peer can serve
    async fn latest_height(&self) -> Result<Height, ProviderError>;
}

/// Bounded retry for fetches from a single peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Fixed delay between attempts
    pub retry_delay: Duration,
    /// Timeout of each attempt
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Fetch `height` from `source`, retrying transient failures.
///
/// Non-transient errors are returned immediately; after the last attempt the
/// most recent transient error is returned.
pub async fn fetch_with_retry(
    source: &dyn BlockSource,
    height: Height,
    policy: &RetryPolicy,
) -> Result<Bundle, ProviderError> {
    let attempts = policy.max_retries.saturating_add(1);
    let mut last_error = ProviderError::Unreachable("no attempt made".into());

    for attempt in 0..attempts {
        let result = match tokio::time::timeout(policy.request_timeout, source.fetch(height)).await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(policy.request_timeout)),
        };

        match result {
            Ok(bundle) => return Ok(bundle),
            Err(e) if e.is_transient() => {
                warn!(
                    "Fetch of height {} from {} failed (attempt {}/{}): {}",
                    height,
                    source.peer_id(),
                    attempt + 1,
                    attempts,
                    e
                );
                last_error = e;
            }
            Err(e) => {
                debug!("Fetch of height {} from {} rejected: {}", height, source.peer_id(), e);
                return Err(e);
            }
        }

        if attempt + 1 < attempts {
            tokio::time::sleep(policy.retry_delay).await;
        }
    }

    Err(last_error)
}
