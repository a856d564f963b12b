//! Simulated fetch transport with fault injection.
//!
//! Every fetch sleeps on the virtual clock for a seeded latency and then
//! succeeds or fails according to the profile. Latency and failure draws
//! depend only on the master seed, the key and the attempt number, so task
//! scheduling order never changes a run.

use async_trait::async_trait;
use foresight_env::{CancellationToken, FetchError, FetchExecutor, ForesightContext, ResourceKey};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

use crate::context::SimContext;

/// RNG stream reserved for network draws
const NETWORK_STREAM: u64 = 0x6e65_7477_6f72_6b00;

/// Status returned by injected failures
const INJECTED_STATUS: u16 = 503;

/// Latency and reliability of the simulated origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkProfile {
    /// Minimum latency per fetch (ms)
    pub base_latency_ms: u64,

    /// Uniform extra latency in `[0, jitter_ms]`
    pub jitter_ms: u64,

    /// Probability that a fetch fails once its latency has elapsed
    pub failure_rate: f64,
}

impl Default for NetworkProfile {
    fn default() -> Self {
        Self {
            base_latency_ms: 40,
            jitter_ms: 30,
            failure_rate: 0.0,
        }
    }
}

impl NetworkProfile {
    fn failure_probability(&self) -> f64 {
        if self.failure_rate.is_finite() {
            self.failure_rate.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Counters kept by the simulated transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub attempts: u64,
    pub delivered: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// `FetchExecutor` that runs entirely on the virtual clock.
pub struct SimFetcher {
    ctx: Arc<SimContext>,
    profile: NetworkProfile,

    attempts: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,

    /// Attempts so far per key
    per_key: Mutex<HashMap<ResourceKey, u64>>,

    /// Keys delivered successfully, in completion order
    delivered_keys: Mutex<Vec<ResourceKey>>,
}

impl SimFetcher {
    pub fn new(ctx: Arc<SimContext>, profile: NetworkProfile) -> Self {
        Self {
            ctx,
            profile,
            attempts: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            per_key: Mutex::new(HashMap::new()),
            delivered_keys: Mutex::new(Vec::new()),
        }
    }

    pub fn profile(&self) -> &NetworkProfile {
        &self.profile
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            attempts: self.attempts.load(Ordering::SeqCst),
            delivered: self.delivered.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
        }
    }

    /// Number of fetches started for `key`.
    pub fn attempts_for(&self, key: &ResourceKey) -> u64 {
        lock(&self.per_key).get(key).copied().unwrap_or(0)
    }

    /// Highest attempt count over all keys.
    pub fn max_attempts_per_key(&self) -> u64 {
        lock(&self.per_key).values().copied().max().unwrap_or(0)
    }

    pub fn delivered_keys(&self) -> Vec<ResourceKey> {
        lock(&self.delivered_keys).clone()
    }

    fn next_attempt(&self, key: &ResourceKey) -> u64 {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut per_key = lock(&self.per_key);
        let count = per_key.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }
}

#[async_trait]
impl FetchExecutor for SimFetcher {
    async fn fetch(&self, key: &ResourceKey, cancel: CancellationToken) -> Result<(), FetchError> {
        let attempt = self.next_attempt(key);
        let mut rng = self.ctx.derive_rng(NETWORK_STREAM ^ key_hash(key) ^ attempt);

        let latency = self.profile.base_latency_ms + rng.gen_range(0..=self.profile.jitter_ms);
        let fails = rng.gen_bool(self.profile.failure_probability());

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                trace!(key = %key, "Simulated fetch cancelled");
                Err(FetchError::Cancelled)
            }

            _ = self.ctx.sleep(Duration::from_millis(latency)) => {
                if fails {
                    self.failed.fetch_add(1, Ordering::SeqCst);
                    trace!(key = %key, latency, "Simulated fetch failed");
                    Err(FetchError::Status {
                        key: key.to_string(),
                        status: INJECTED_STATUS,
                    })
                } else {
                    self.delivered.fetch_add(1, Ordering::SeqCst);
                    lock(&self.delivered_keys).push(key.clone());
                    trace!(key = %key, latency, "Simulated fetch delivered");
                    Ok(())
                }
            }
        }
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the key bytes. Stable across toolchains, so a seed replays
/// the same network on any build.
fn key_hash(key: &ResourceKey) -> u64 {
    key.as_str().bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(profile: NetworkProfile) -> (Arc<SimContext>, Arc<SimFetcher>) {
        let ctx = SimContext::shared(42);
        let fetcher = Arc::new(SimFetcher::new(Arc::clone(&ctx), profile));
        (ctx, fetcher)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_fetch_completes_after_latency() {
        let (ctx, fetcher) = fetcher(NetworkProfile {
            base_latency_ms: 50,
            jitter_ms: 0,
            failure_rate: 0.0,
        });

        let task = {
            let fetcher = Arc::clone(&fetcher);
            tokio::spawn(async move { fetcher.fetch(&ResourceKey::new("/a"), CancellationToken::new()).await })
        };

        tokio::task::yield_now().await;
        ctx.advance_time(Duration::from_millis(49));
        tokio::task::yield_now().await;
        assert_eq!(fetcher.stats().delivered, 0);

        ctx.advance_time(Duration::from_millis(1));
        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(fetcher.stats().delivered, 1);
        assert_eq!(fetcher.delivered_keys(), vec![ResourceKey::new("/a")]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_cancel_wins_over_latency() {
        let (_ctx, fetcher) = fetcher(NetworkProfile::default());
        let token = CancellationToken::new();
        token.cancel();

        let result = fetcher.fetch(&ResourceKey::new("/a"), token).await;
        assert_eq!(result, Err(FetchError::Cancelled));
        assert_eq!(fetcher.stats().cancelled, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_certain_failure_reports_status() {
        let (ctx, fetcher) = fetcher(NetworkProfile {
            base_latency_ms: 10,
            jitter_ms: 0,
            failure_rate: 1.0,
        });

        let task = {
            let fetcher = Arc::clone(&fetcher);
            tokio::spawn(async move { fetcher.fetch(&ResourceKey::new("/b"), CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;
        ctx.advance_time(Duration::from_millis(10));

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 503, .. }));
        assert_eq!(fetcher.stats().failed, 1);
        assert_eq!(fetcher.attempts_for(&ResourceKey::new("/b")), 1);
        assert_eq!(fetcher.max_attempts_per_key(), 1);
    }

    #[test]
    fn test_key_hash_is_fnv1a() {
        // Published FNV-1a 64-bit test vectors
        assert_eq!(key_hash(&ResourceKey::new("")), 0xcbf2_9ce4_8422_2325);
        assert_eq!(key_hash(&ResourceKey::new("a")), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(key_hash(&ResourceKey::new("foobar")), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn test_failure_probability_sanitized() {
        let wild = NetworkProfile {
            failure_rate: f64::NAN,
            ..NetworkProfile::default()
        };
        assert_eq!(wild.failure_probability(), 0.0);

        let high = NetworkProfile {
            failure_rate: 3.0,
            ..NetworkProfile::default()
        };
        assert_eq!(high.failure_probability(), 1.0);
    }
}
