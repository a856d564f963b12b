//! Foresight Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" boundary that lets the Foresight engines
//! run unchanged in **Production** (tokio + real network) and in the
//! **Simulation** harness (virtual clock + scripted transport).
//!
//! # What crosses the boundary
//!
//! - Time (`now()`, `sleep()`)
//! - Task spawning (`spawn()`)
//! - Randomness (`derive_rng()`), so a single 64-bit seed reproduces a run
//! - Resource fetching (`FetchExecutor::fetch()`), always cancellable
//!
//! # Example
//!
//! ```ignore
//! use foresight_env::{ForesightContext, FetchExecutor, ResourceKey};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn warm<Ctx: ForesightContext, F: FetchExecutor>(ctx: &Ctx, fetcher: &F) {
//!     let token = CancellationToken::new();
//!     let key = ResourceKey::new("/articles/42");
//!     if let Err(e) = fetcher.fetch(&key, token).await {
//!         if !e.is_cancelled() {
//!             tracing::warn!(error = %e, "prefetch failed");
//!         }
//!     }
//!     ctx.sleep(std::time::Duration::from_millis(100)).await;
//! }
//! ```

mod context;
mod error;
mod fetch;
mod tokio_impl;
mod types;

pub use context::ForesightContext;
pub use error::FetchError;
pub use fetch::FetchExecutor;
#[cfg(feature = "http")]
pub use fetch::HttpFetcher;
pub use tokio_impl::TokioContext;
pub use types::ResourceKey;

// Re-exported so downstream crates agree on the token and RNG types.
pub use rand_chacha::ChaCha8Rng;
pub use tokio_util::sync::CancellationToken;
