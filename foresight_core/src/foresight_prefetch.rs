//! Prefetch scheduler and its bounded cache.
//!
//! Per resource key the scheduler walks a small state machine:
//!
//! ```text
//!   Uncached ──start──► Pending ──ok──► Complete
//!       ▲                  │  └──err──► Failed
//!       └──cancel/evict────┘
//! ```
//!
//! The scheduler owns the cache outright. Fetches run as spawned tasks and
//! report back over a channel; their results are folded into the cache in
//! `apply_completions`, on the owner's side, so the map is never written
//! from two places at once. Each fetch carries an id, and a completion whose
//! id no longer matches its entry (cleared, evicted, restarted) is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use foresight_env::{CancellationToken, FetchError, FetchExecutor, ForesightContext, ResourceKey};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::ConfigError;
use crate::foresight_hit::{rank_candidates, Candidate};
use crate::foresight_space::Quadtree;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the PrefetchScheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Candidates scoring below this are ignored (default: 0.3)
    pub min_probability: f64,

    /// Top-K per cycle and cap on in-flight fetches (default: 3)
    pub max_concurrent: usize,

    /// Entries kept before the oldest are evicted (default: 50)
    pub cache_size: usize,

    /// Entries older than this are evicted by maintenance (default: 60 s)
    pub cache_max_age_ms: u64,

    /// Minimum spacing between evaluation cycles (default: 100 ms)
    pub check_frequency_ms: u64,

    /// Period of the background maintenance task (default: 10 s)
    pub maintenance_interval_ms: u64,

    /// Cancel pending fetches that drop out of the current top-K (default: off)
    pub preempt_superseded: bool,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            min_probability: 0.3,
            max_concurrent: 3,
            cache_size: 50,
            cache_max_age_ms: 60_000,
            check_frequency_ms: 100,
            maintenance_interval_ms: 10_000,
            preempt_superseded: false,
        }
    }
}

impl PrefetchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::require_unit("min_probability", self.min_probability)?;
        ConfigError::require_nonzero("max_concurrent", self.max_concurrent)?;
        ConfigError::require_nonzero("cache_size", self.cache_size)?;
        ConfigError::require_nonzero("cache_max_age_ms", self.cache_max_age_ms as usize)?;
        ConfigError::require_nonzero("check_frequency_ms", self.check_frequency_ms as usize)?;
        ConfigError::require_nonzero("maintenance_interval_ms", self.maintenance_interval_ms as usize)?;
        Ok(())
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_millis(self.cache_max_age_ms)
    }

    pub fn check_frequency(&self) -> Duration {
        Duration::from_millis(self.check_frequency_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

// ============================================================================
// CACHE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheStatus {
    Pending,
    Complete,
    Failed,
}

/// Read-only view of one cache slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: ResourceKey,
    pub status: CacheStatus,
    /// Context time the fetch was started
    pub inserted_at: Duration,
    /// Score at the time the fetch was started
    pub probability: f64,
    pub time_to_reach: f64,
    /// Failure message, for `Failed` entries
    pub error: Option<String>,
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    fetch_id: u64,
    /// Present while the fetch is in flight
    token: Option<CancellationToken>,
}

#[derive(Debug)]
struct Completion {
    key: ResourceKey,
    fetch_id: u64,
    result: Result<(), FetchError>,
}

/// Counters for introspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchStats {
    pub cycles_run: u64,
    pub cycles_skipped: u64,
    pub fetches_started: u64,
    pub fetches_completed: u64,
    pub fetches_failed: u64,
    pub fetches_cancelled: u64,
    pub evictions: u64,
}

/// What an evaluation call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationOutcome {
    /// Less than `check_frequency` since the previous cycle
    Throttled,
    Evaluated {
        /// Candidates kept after filtering and top-K
        candidates: usize,
        /// Fetches started this cycle
        started: usize,
        /// Pending fetches cancelled as superseded
        preempted: usize,
    },
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Turns ranked candidates into bounded, cancellable, cached fetches.
pub struct PrefetchScheduler<Ctx: ForesightContext> {
    ctx: Arc<Ctx>,
    fetcher: Arc<dyn FetchExecutor>,
    config: PrefetchConfig,

    cache: HashMap<ResourceKey, Slot>,

    /// Every fetch token is a child of this; replaced on clear
    parent_token: CancellationToken,
    next_fetch_id: u64,

    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,

    last_cycle: Option<Duration>,
    candidates: Vec<Candidate>,
    stats: PrefetchStats,
}

impl<Ctx: ForesightContext> PrefetchScheduler<Ctx> {
    pub fn new(ctx: Arc<Ctx>, fetcher: Arc<dyn FetchExecutor>, config: PrefetchConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        Ok(Self {
            ctx,
            fetcher,
            config,
            cache: HashMap::new(),
            parent_token: CancellationToken::new(),
            next_fetch_id: 0,
            completions_tx,
            completions_rx,
            last_cycle: None,
            candidates: Vec::new(),
            stats: PrefetchStats::default(),
        })
    }

    /// Runs one evaluation cycle unless throttled.
    ///
    /// Queries `index` along `current → predicted`, ranks what it finds and
    /// starts fetches for the best uncached candidates, never exceeding
    /// `max_concurrent` fetches in flight.
    pub fn evaluate(
        &mut self,
        index: &Quadtree,
        current: &Point2<f64>,
        predicted: &Point2<f64>,
        horizon_ms: f64,
    ) -> EvaluationOutcome {
        let now = self.ctx.now();
        if let Some(last) = self.last_cycle {
            if now.saturating_sub(last) < self.config.check_frequency() {
                trace!("Evaluation throttled");
                self.stats.cycles_skipped += 1;
                return EvaluationOutcome::Throttled;
            }
        }
        self.last_cycle = Some(now);
        self.stats.cycles_run += 1;
        self.apply_completions();

        let mut ranked = rank_candidates(
            index.query_line(current, predicted),
            current,
            predicted,
            horizon_ms,
            self.config.min_probability,
        );
        ranked.truncate(self.config.max_concurrent);

        let preempted = if self.config.preempt_superseded {
            self.preempt_superseded(&ranked)
        } else {
            0
        };

        let mut slots = self.config.max_concurrent.saturating_sub(self.pending_count());
        let mut started = 0;
        for candidate in &ranked {
            if slots == 0 {
                break;
            }
            if self.cache.contains_key(&candidate.region.key) {
                continue;
            }
            self.start_fetch(candidate);
            slots -= 1;
            started += 1;
        }

        let kept = ranked.len();
        self.candidates = ranked;
        EvaluationOutcome::Evaluated {
            candidates: kept,
            started,
            preempted,
        }
    }

    /// Starts a fetch for `candidate` regardless of throttling and slot
    /// limits. Returns false if the key is already cached or pending.
    pub fn request(&mut self, candidate: &Candidate) -> bool {
        if self.cache.contains_key(&candidate.region.key) {
            return false;
        }
        self.start_fetch(candidate);
        true
    }

    /// Folds every completion that has arrived so far into the cache.
    pub fn apply_completions(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(completion) = self.completions_rx.try_recv() {
            if self.apply(completion) {
                applied += 1;
            }
        }
        applied
    }

    /// Waits until no fetch is pending, applying completions as they land.
    pub async fn settle(&mut self) {
        while self.pending_count() > 0 {
            match self.completions_rx.recv().await {
                Some(completion) => {
                    self.apply(completion);
                }
                None => break,
            }
        }
    }

    /// Evicts entries past their max age, then the oldest entries beyond
    /// the cache size. Evicting a pending entry cancels its fetch.
    pub fn maintain(&mut self) -> usize {
        self.apply_completions();

        let now = self.ctx.now();
        let max_age = self.config.cache_max_age();
        let expired: Vec<ResourceKey> = self
            .cache
            .values()
            .filter(|slot| now.saturating_sub(slot.entry.inserted_at) > max_age)
            .map(|slot| slot.entry.key.clone())
            .collect();

        let mut evicted = expired.len();
        for key in expired {
            self.evict(&key);
        }
        evicted += self.enforce_capacity();

        if evicted > 0 {
            debug!(evicted, remaining = self.cache.len(), "Cache maintenance");
        }
        evicted
    }

    /// Cancels every in-flight fetch and empties the cache.
    pub fn clear_cache(&mut self) {
        let cancelled = self.pending_count();
        self.parent_token.cancel();
        self.parent_token = CancellationToken::new();

        self.cache.clear();
        self.candidates.clear();
        // Late completions no longer match any entry, drain what is queued
        while self.completions_rx.try_recv().is_ok() {}

        self.stats.fetches_cancelled += cancelled as u64;
        info!(cancelled, "Prefetch cache cleared");
    }

    /// Cache entries, oldest first.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut slots: Vec<&Slot> = self.cache.values().collect();
        slots.sort_by_key(|slot| (slot.entry.inserted_at, slot.fetch_id));
        slots.into_iter().map(|slot| slot.entry.clone()).collect()
    }

    pub fn entry(&self, key: &ResourceKey) -> Option<&CacheEntry> {
        self.cache.get(key).map(|slot| &slot.entry)
    }

    pub fn status(&self, key: &ResourceKey) -> Option<CacheStatus> {
        self.entry(key).map(|entry| entry.status)
    }

    /// Ranked candidates from the most recent cycle.
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn pending_count(&self) -> usize {
        self.cache
            .values()
            .filter(|slot| slot.entry.status == CacheStatus::Pending)
            .count()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn stats(&self) -> PrefetchStats {
        self.stats
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    // ========== Private Helper Methods ==========

    fn start_fetch(&mut self, candidate: &Candidate) {
        let key = candidate.region.key.clone();
        let fetch_id = self.next_fetch_id;
        self.next_fetch_id += 1;

        let token = self.parent_token.child_token();
        self.cache.insert(
            key.clone(),
            Slot {
                entry: CacheEntry {
                    key: key.clone(),
                    status: CacheStatus::Pending,
                    inserted_at: self.ctx.now(),
                    probability: candidate.probability,
                    time_to_reach: candidate.time_to_reach,
                    error: None,
                },
                fetch_id,
                token: Some(token.clone()),
            },
        );
        self.stats.fetches_started += 1;
        debug!(
            key = %key,
            probability = candidate.probability,
            time_to_reach = candidate.time_to_reach,
            "Starting prefetch"
        );

        let fetcher = Arc::clone(&self.fetcher);
        let tx = self.completions_tx.clone();
        self.ctx.spawn("prefetch", async move {
            let result = fetcher.fetch(&key, token).await;
            // Receiver gone means the scheduler was dropped
            let _ = tx.send(Completion { key, fetch_id, result });
        });

        self.enforce_capacity();
    }

    /// Returns whether the completion updated a live entry.
    fn apply(&mut self, completion: Completion) -> bool {
        let Some(slot) = self.cache.get_mut(&completion.key) else {
            return false;
        };
        if slot.fetch_id != completion.fetch_id || slot.entry.status != CacheStatus::Pending {
            return false;
        }
        slot.token = None;

        match completion.result {
            Ok(()) => {
                debug!(key = %completion.key, "Prefetch complete");
                slot.entry.status = CacheStatus::Complete;
                self.stats.fetches_completed += 1;
            }
            Err(e) if e.is_cancelled() => {
                trace!(key = %completion.key, "Prefetch cancelled");
                self.cache.remove(&completion.key);
                self.stats.fetches_cancelled += 1;
            }
            Err(e) => {
                warn!(key = %completion.key, error = %e, "Prefetch failed");
                slot.entry.status = CacheStatus::Failed;
                slot.entry.error = Some(e.to_string());
                self.stats.fetches_failed += 1;
            }
        }
        true
    }

    /// Cancels pending fetches whose keys are not among `keep`.
    fn preempt_superseded(&mut self, keep: &[Candidate]) -> usize {
        let wanted: HashSet<&ResourceKey> = keep.iter().map(|c| &c.region.key).collect();
        let superseded: Vec<ResourceKey> = self
            .cache
            .values()
            .filter(|slot| slot.entry.status == CacheStatus::Pending && !wanted.contains(&slot.entry.key))
            .map(|slot| slot.entry.key.clone())
            .collect();

        for key in &superseded {
            debug!(key = %key, "Preempting superseded prefetch");
            self.evict(key);
        }
        superseded.len()
    }

    fn enforce_capacity(&mut self) -> usize {
        let excess = self.cache.len().saturating_sub(self.config.cache_size);
        if excess == 0 {
            return 0;
        }

        let mut by_age: Vec<(Duration, u64, ResourceKey)> = self
            .cache
            .values()
            .map(|slot| (slot.entry.inserted_at, slot.fetch_id, slot.entry.key.clone()))
            .collect();
        by_age.sort();

        for (_, _, key) in by_age.into_iter().take(excess) {
            self.evict(&key);
        }
        excess
    }

    fn evict(&mut self, key: &ResourceKey) {
        if let Some(slot) = self.cache.remove(key) {
            if let Some(token) = slot.token {
                token.cancel();
                self.stats.fetches_cancelled += 1;
            }
            self.stats.evictions += 1;
        }
    }
}

impl<Ctx: ForesightContext> Drop for PrefetchScheduler<Ctx> {
    fn drop(&mut self) {
        self.parent_token.cancel();
    }
}
