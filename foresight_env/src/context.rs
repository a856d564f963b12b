//! Core environment context trait for Foresight engines.

use async_trait::async_trait;
use rand_chacha::ChaCha8Rng;
use std::future::Future;
use std::time::Duration;

/// The central interface for environment interaction.
///
/// This trait abstracts the "real world" so that the prediction engine and
/// prefetch scheduler run in both production (tokio) and the deterministic
/// simulation harness.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, OS entropy
/// - **Simulation**: `SimContext` - virtual clock, `ChaCha8Rng(seed)`
///
/// # Determinism
///
/// Every method that would normally introduce non-determinism (time,
/// randomness) is controlled by the implementation.
#[async_trait]
pub trait ForesightContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for evaluation throttling and cache entry ages.
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    ///
    /// Fetch operations and the cache maintenance timer run through this.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Derives an independent random stream.
    ///
    /// The implementation combines its master seed with `stream` so that
    /// separate consumers (particle filter, jitter injection, ...) get
    /// reproducible but uncorrelated sequences.
    fn derive_rng(&self, stream: u64) -> ChaCha8Rng;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
