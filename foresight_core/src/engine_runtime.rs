//! Engine Runtime - Drives the prediction pipeline with an environment context.
//!
//! This module wires the pure engines (motion, space, hit, prefetch) to the
//! environment abstraction (`ForesightContext`) and exposes the read-only
//! snapshot and control surface.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      ForesightEngine                         │
//! │                                                              │
//! │  Sample ──► MOTION ──(current, predicted)──► SPACE query     │
//! │            (particle      │                     │            │
//! │             filter)       │                     ▼            │
//! │                           └──────────────►  HIT scoring      │
//! │                                                 │            │
//! │                                                 ▼            │
//! │                                  PREFETCH (top-K, cache)     │
//! │                                    │        ▲                │
//! │                           ctx.spawn│        │completions     │
//! │                                    ▼        │                │
//! │                                FetchExecutor tasks           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use foresight_core::engine_runtime::{EngineConfig, ForesightEngine};
//! use foresight_env::{HttpFetcher, TokioContext};
//!
//! let engine = Arc::new(ForesightEngine::new(
//!     TokioContext::shared(),
//!     Arc::new(HttpFetcher::new()),
//!     EngineConfig::default(),
//! )?);
//! engine.start_maintenance();
//! engine.set_regions(viewport, &regions)?;
//! engine.on_sample(Sample::new(x, y, t));
//! let snapshot = engine.snapshot();
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use foresight_env::{CancellationToken, FetchExecutor, ForesightContext, ResourceKey};
use geo::Rect;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::foresight_hit::Candidate;
use crate::foresight_motion::{FilterConfig, FilterStats, NoiseParameters, Particle, ParticleFilter, UpdateOutcome};
use crate::foresight_prefetch::{CacheEntry, CacheStatus, EvaluationOutcome, PrefetchConfig, PrefetchScheduler, PrefetchStats};
use crate::foresight_space::{viewport, QuadtreeConfig, QuadtreeStats, Region, SpatialIndex};
use crate::sample_buffer::Sample;

/// RNG stream the particle filter draws from when no fixed seed is set
const FILTER_RNG_STREAM: u64 = 1;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for a ForesightEngine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rate the sample source is expected to deliver at, in Hz (default: 60)
    pub sampling_rate_hz: f64,

    /// How far ahead to predict, in ms (default: 300)
    pub prediction_horizon_ms: f64,

    pub filter: FilterConfig,
    pub quadtree: QuadtreeConfig,
    pub prefetch: PrefetchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sampling_rate_hz: 60.0,
            prediction_horizon_ms: 300.0,
            filter: FilterConfig::default(),
            quadtree: QuadtreeConfig::default(),
            prefetch: PrefetchConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::require_positive("sampling_rate_hz", self.sampling_rate_hz)?;
        ConfigError::require_positive("prediction_horizon_ms", self.prediction_horizon_ms)?;
        self.filter.validate()?;
        self.quadtree.validate()?;
        self.prefetch.validate()
    }

    /// Spacing between samples at the configured rate.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.sampling_rate_hz)
    }
}

// ============================================================================
// BOUNDARY TRAITS
// ============================================================================

/// Pull interface over the pointer sampling front end.
#[async_trait]
pub trait PointerSampleSource: Send {
    /// Next sample, or `None` once the source is exhausted.
    async fn next_sample(&mut self) -> Option<Sample>;
}

/// Observable collection of candidate regions.
pub trait RegionProvider: Send + Sync {
    /// Changes whenever regions are added, removed, moved or the viewport
    /// is resized.
    fn revision(&self) -> u64;

    fn viewport(&self) -> Rect<f64>;

    fn regions(&self) -> Vec<Region>;
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Read-only view of the engine after the latest sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub current_position: Option<Point2<f64>>,
    pub predicted_position: Option<Point2<f64>>,
    pub candidates: Vec<Candidate>,
    pub cache_entries: Vec<CacheEntry>,
    pub noise: NoiseParameters,
    pub filter_stats: FilterStats,
    pub prefetch_stats: PrefetchStats,
    pub index_stats: QuadtreeStats,
}

/// What one call to `on_sample` did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleStep {
    pub update: UpdateOutcome,
    pub evaluation: EvaluationOutcome,
    pub current: Point2<f64>,
    pub predicted: Point2<f64>,
}

#[derive(Debug, Default)]
struct Outputs {
    current: Option<Point2<f64>>,
    predicted: Option<Point2<f64>>,
}

#[derive(Debug, Default)]
struct IndexState {
    fingerprint: Option<u64>,
    stats: QuadtreeStats,
}

// ============================================================================
// ENGINE
// ============================================================================

/// A self-contained prediction and prefetch engine.
///
/// Generic over the context so the same code runs under tokio or in the
/// deterministic simulator. All methods take `&self`; share it in an `Arc`.
pub struct ForesightEngine<Ctx: ForesightContext> {
    ctx: Arc<Ctx>,
    config: EngineConfig,

    filter: Mutex<ParticleFilter>,
    scheduler: Mutex<PrefetchScheduler<Ctx>>,
    index: SpatialIndex,
    index_state: Mutex<IndexState>,
    outputs: Mutex<Outputs>,

    shutdown: CancellationToken,
}

impl<Ctx: ForesightContext> ForesightEngine<Ctx> {
    /// Creates an engine, rejecting invalid configuration.
    ///
    /// The filter uses `config.filter.seed` when set, otherwise a stream
    /// derived from the context.
    pub fn new(ctx: Arc<Ctx>, fetcher: Arc<dyn FetchExecutor>, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let filter = match config.filter.seed {
            Some(_) => ParticleFilter::new(config.filter.clone())?,
            None => ParticleFilter::with_rng(config.filter.clone(), ctx.derive_rng(FILTER_RNG_STREAM))?,
        };
        let scheduler = PrefetchScheduler::new(Arc::clone(&ctx), fetcher, config.prefetch.clone())?;
        // Placeholder bounds until the first `set_regions`
        let index = SpatialIndex::new(viewport(0.0, 0.0, 1.0, 1.0)?, config.quadtree.clone());

        info!(
            particles = config.filter.particle_count,
            horizon_ms = config.prediction_horizon_ms,
            max_concurrent = config.prefetch.max_concurrent,
            seed = ctx.seed(),
            "Foresight engine created"
        );

        Ok(Self {
            ctx,
            config,
            filter: Mutex::new(filter),
            scheduler: Mutex::new(scheduler),
            index,
            index_state: Mutex::new(IndexState::default()),
            outputs: Mutex::new(Outputs::default()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Feeds one sample through the whole pipeline.
    ///
    /// Returns `None` once the engine has been shut down; no state changes
    /// and no fetch is started.
    pub fn on_sample(&self, sample: Sample) -> Option<SampleStep> {
        if self.shutdown.is_cancelled() {
            debug!("Ignoring sample after shutdown");
            return None;
        }

        let horizon = self.config.prediction_horizon_ms;
        let (update, current, predicted) = {
            let mut filter = lock(&self.filter);
            let update = filter.update(sample);
            (update, filter.state().position(), filter.predict(horizon))
        };

        {
            let mut outputs = lock(&self.outputs);
            outputs.current = Some(current);
            outputs.predicted = Some(predicted);
        }

        let tree = self.index.snapshot();
        let evaluation = lock(&self.scheduler).evaluate(&tree, &current, &predicted, horizon);

        Some(SampleStep {
            update,
            evaluation,
            current,
            predicted,
        })
    }

    /// Replaces the indexed region set.
    ///
    /// Rebuilds the spatial index only when the viewport or the regions
    /// actually changed; returns whether a rebuild happened.
    pub fn set_regions(&self, viewport: Rect<f64>, regions: &[Region]) -> Result<bool, ConfigError> {
        if !(viewport.width() > 0.0 && viewport.height() > 0.0) {
            return Err(ConfigError::EmptyViewport {
                width: viewport.width(),
                height: viewport.height(),
            });
        }

        let fingerprint = fingerprint(&viewport, regions);
        let mut state = lock(&self.index_state);
        if state.fingerprint == Some(fingerprint) {
            return Ok(false);
        }

        state.stats = self.index.rebuild(viewport, regions);
        state.fingerprint = Some(fingerprint);
        Ok(true)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let (current_position, predicted_position) = {
            let outputs = lock(&self.outputs);
            (outputs.current, outputs.predicted)
        };
        let (noise, filter_stats) = {
            let filter = lock(&self.filter);
            (filter.noise_parameters(), filter.stats())
        };
        let (candidates, cache_entries, prefetch_stats) = {
            let mut scheduler = lock(&self.scheduler);
            scheduler.apply_completions();
            (scheduler.candidates().to_vec(), scheduler.entries(), scheduler.stats())
        };

        EngineSnapshot {
            current_position,
            predicted_position,
            candidates,
            cache_entries,
            noise,
            filter_stats,
            prefetch_stats,
            index_stats: lock(&self.index_state).stats,
        }
    }

    /// Current particle population, for visualization.
    pub fn particles(&self) -> Vec<Particle> {
        lock(&self.filter).particles().to_vec()
    }

    /// Cache status of `key`, after folding in finished fetches.
    pub fn cache_status(&self, key: &ResourceKey) -> Option<CacheStatus> {
        let mut scheduler = lock(&self.scheduler);
        scheduler.apply_completions();
        scheduler.status(key)
    }

    /// Cancels every in-flight fetch and empties the cache.
    pub fn clear_cache(&self) {
        lock(&self.scheduler).clear_cache();
    }

    /// Runs cache maintenance once.
    pub fn maintain(&self) -> usize {
        lock(&self.scheduler).maintain()
    }

    /// Spawns the periodic maintenance task.
    ///
    /// The task holds only a weak handle, so it stops on `shutdown` or once
    /// the last `Arc` to the engine is dropped.
    pub fn start_maintenance(self: &Arc<Self>) {
        let engine: Weak<Self> = Arc::downgrade(self);
        let ctx = Arc::clone(&self.ctx);
        let interval = self.config.prefetch.maintenance_interval();
        let shutdown = self.shutdown.clone();

        self.ctx.spawn("cache-maintenance", async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,

                    _ = ctx.sleep(interval) => {
                        let Some(engine) = engine.upgrade() else { break };
                        engine.maintain();
                    }
                }
            }
            debug!("Cache maintenance stopped");
        });
    }

    /// Pulls samples from `source` until it is exhausted or the engine is
    /// shut down, rebuilding the index whenever `provider` reports a new
    /// revision. Returns the number of samples processed.
    pub async fn run<S, P>(&self, source: &mut S, provider: &P) -> u64
    where
        S: PointerSampleSource,
        P: RegionProvider,
    {
        let mut revision = None;
        let mut processed = 0;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                next = source.next_sample() => {
                    let Some(sample) = next else { break };

                    let current_revision = provider.revision();
                    if revision != Some(current_revision) {
                        match self.set_regions(provider.viewport(), &provider.regions()) {
                            Ok(_) => revision = Some(current_revision),
                            Err(e) => warn!(error = %e, "Ignoring region update"),
                        }
                    }

                    self.on_sample(sample);
                    processed += 1;
                }
            }
        }

        info!(processed, "Engine run loop stopped");
        processed
    }

    /// Cancels all in-flight work and background tasks.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        lock(&self.scheduler).clear_cache();
        info!("Foresight engine shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.ctx
    }
}

impl<Ctx: ForesightContext> Drop for ForesightEngine<Ctx> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Locks `mutex`, recovering the data if another holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hash of everything that affects the tree's shape.
fn fingerprint(viewport: &Rect<f64>, regions: &[Region]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hash_rect(viewport, &mut hasher);
    regions.len().hash(&mut hasher);
    for region in regions {
        region.id.hash(&mut hasher);
        region.key.hash(&mut hasher);
        region.priority.hash(&mut hasher);
        hash_rect(&region.bounds, &mut hasher);
    }
    hasher.finish()
}

fn hash_rect(rect: &Rect<f64>, hasher: &mut DefaultHasher) {
    for v in [rect.min().x, rect.min().y, rect.max().x, rect.max().y] {
        v.to_bits().hash(hasher);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foresight_space::RegionId;
    use foresight_env::{FetchError, TokioContext};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FetchExecutor for CountingFetcher {
        async fn fetch(&self, _key: &ResourceKey, _cancel: CancellationToken) -> Result<(), FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            filter: FilterConfig {
                seed: Some(7),
                ..FilterConfig::default()
            },
            prefetch: PrefetchConfig {
                check_frequency_ms: 1,
                min_probability: 0.1,
                ..PrefetchConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    fn engine(fetcher: Arc<CountingFetcher>) -> ForesightEngine<TokioContext> {
        ForesightEngine::new(TokioContext::shared(), fetcher, config()).unwrap()
    }

    /// A column of tall regions across the pointer's path along y = 100.
    fn targets() -> Vec<Region> {
        (0..5)
            .map(|i| Region::new(RegionId::from_index(i), 150.0 + i as f64 * 60.0, 50.0, 40.0, 100.0, format!("/t/{i}")))
            .collect()
    }

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.sampling_rate_hz, 60.0);
        assert_eq!(config.prediction_horizon_ms, 300.0);
        assert_eq!(config.filter.particle_count, 100);
        assert_eq!(config.prefetch.max_concurrent, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_config_fills_defaults() {
        let json = r#"{
            "prediction_horizon_ms": 450.0,
            "filter": { "process_noise": 2.5 },
            "prefetch": { "max_concurrent": 5 }
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.prediction_horizon_ms, 450.0);
        assert_eq!(config.filter.process_noise, 2.5);
        assert_eq!(config.filter.particle_count, 100);
        assert_eq!(config.prefetch.max_concurrent, 5);
        assert_eq!(config.quadtree, QuadtreeConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = EngineConfig {
            prediction_horizon_ms: 0.0,
            ..EngineConfig::default()
        };
        let result = ForesightEngine::new(TokioContext::shared(), Arc::new(CountingFetcher::default()), bad);
        assert!(matches!(result, Err(ConfigError::OutOfRange { field: "prediction_horizon_ms", .. })));
    }

    #[test]
    fn test_set_regions_rebuilds_only_on_change() {
        let engine = engine(Arc::new(CountingFetcher::default()));
        let screen = viewport(0.0, 0.0, 1000.0, 800.0).unwrap();
        let mut regions = targets();

        assert!(engine.set_regions(screen, &regions).unwrap());
        assert!(!engine.set_regions(screen, &regions).unwrap());

        regions[0].bounds = viewport(10.0, 10.0, 40.0, 40.0).unwrap();
        assert!(engine.set_regions(screen, &regions).unwrap());

        let resized = viewport(0.0, 0.0, 1200.0, 800.0).unwrap();
        assert!(engine.set_regions(resized, &regions).unwrap());
        assert_eq!(engine.snapshot().index_stats.regions, 5);
    }

    #[tokio::test]
    async fn test_pipeline_prefetches_regions_ahead() {
        let fetcher = Arc::new(CountingFetcher::default());
        let engine = engine(fetcher.clone());
        engine
            .set_regions(viewport(0.0, 0.0, 1000.0, 800.0).unwrap(), &targets())
            .unwrap();

        // 500 units/sec along y = 100, one sample every 20ms
        for i in 0..15 {
            engine.on_sample(Sample::new(i as f64 * 10.0, 100.0, i as f64 * 20.0));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let snapshot = engine.snapshot();
        let predicted = snapshot.predicted_position.unwrap();
        let current = snapshot.current_position.unwrap();
        assert!(predicted.x > current.x);
        assert!(fetcher.calls.load(Ordering::SeqCst) >= 1);
        assert!(snapshot
            .cache_entries
            .iter()
            .any(|e| e.key == ResourceKey::new("/t/0") && e.status == CacheStatus::Complete));
    }

    #[tokio::test]
    async fn test_shutdown_clears_and_is_idempotent() {
        let engine = Arc::new(engine(Arc::new(CountingFetcher::default())));
        engine.start_maintenance();
        engine.shutdown();
        engine.shutdown();

        assert!(engine.is_shut_down());
        assert!(engine.snapshot().cache_entries.is_empty());
    }

    /// Never finishes on its own; reports when its token fires.
    #[derive(Default)]
    struct HangingFetcher {
        cancelled: AtomicUsize,
    }

    #[async_trait]
    impl FetchExecutor for HangingFetcher {
        async fn fetch(&self, _key: &ResourceKey, cancel: CancellationToken) -> Result<(), FetchError> {
            cancel.cancelled().await;
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Cancelled)
        }
    }

    #[tokio::test]
    async fn test_dropping_last_handle_disposes_engine() {
        let fetcher = Arc::new(HangingFetcher::default());
        let engine = Arc::new(ForesightEngine::new(TokioContext::shared(), fetcher.clone(), config()).unwrap());
        engine
            .set_regions(viewport(0.0, 0.0, 1000.0, 800.0).unwrap(), &targets())
            .unwrap();
        engine.start_maintenance();

        for i in 0..15 {
            engine.on_sample(Sample::new(i as f64 * 10.0, 100.0, i as f64 * 20.0));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let in_flight = engine.snapshot().prefetch_stats.fetches_started;
        assert!(in_flight > 0);

        let weak = Arc::downgrade(&engine);
        drop(engine);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(weak.upgrade().is_none());
        assert_eq!(fetcher.cancelled.load(Ordering::SeqCst) as u64, in_flight);
    }

    #[tokio::test]
    async fn test_samples_after_shutdown_start_nothing() {
        let fetcher = Arc::new(CountingFetcher::default());
        let engine = engine(fetcher.clone());
        engine
            .set_regions(viewport(0.0, 0.0, 1000.0, 800.0).unwrap(), &targets())
            .unwrap();
        engine.shutdown();
        engine.clear_cache();

        for i in 0..15 {
            assert!(engine
                .on_sample(Sample::new(i as f64 * 10.0, 100.0, i as f64 * 20.0))
                .is_none());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        let snapshot = engine.snapshot();
        assert!(snapshot.current_position.is_none());
        assert!(snapshot.cache_entries.is_empty());
    }

    #[test]
    fn test_snapshot_before_any_sample() {
        let engine = engine(Arc::new(CountingFetcher::default()));
        let snapshot = engine.snapshot();
        assert!(snapshot.current_position.is_none());
        assert!(snapshot.candidates.is_empty());
        assert_eq!(engine.particles().len(), 100);
    }
}
