//! Scenario runner - plays scenarios against a real engine on virtual time.
//!
//! Each tick the oracle moves the pointer, the virtual clock follows, the
//! runtime is given a chance to run fetch tasks whose latency elapsed, and
//! then one noisy sample goes through the engine. Everything runs on a
//! current-thread runtime so task interleaving is a pure function of the seed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use foresight_core::{
    viewport, CacheStatus, ConfigError, EngineConfig, ForesightEngine, PredictionValidator, RegionId,
    ValidationReport,
};
use foresight_env::ForesightContext;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::context::SimContext;
use crate::exporter::{SimExport, SimFrame};
use crate::network::{NetworkStats, SimFetcher};
use crate::oracle::PointerOracle;
use crate::scenarios::{Criteria, ScenarioId, ScenarioSetup, VIEWPORT_HEIGHT, VIEWPORT_WIDTH};

/// Scrambles the master seed into the oracle's seed
const PHYSICS_SEED_MIX: u64 = 0x9e37_79b9_7f4a_7c15;

/// Scheduler turns granted to spawned tasks after each clock step
const SETTLE_YIELDS: usize = 8;

/// Ticks between exported frames (10 frames/s at 60 Hz)
const EXPORT_INTERVAL: u64 = 6;

/// Errors that stop a run before it produces a result.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Invalid engine configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to build simulation runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,

    pub report: ValidationReport,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMetrics {
    /// Samples fed to the engine
    pub samples: u64,

    /// Prediction error at the horizon (px)
    pub rmse: f64,
    pub max_error: f64,

    pub region_entries: usize,
    pub prefetch_hits: usize,
    pub hit_rate: f64,

    pub fetches_started: u64,
    pub fetches_completed: u64,
    pub fetches_failed: u64,
    pub fetches_cancelled: u64,
    pub evictions: u64,

    /// Largest cache observed at any tick
    pub max_cache_len: usize,

    /// Most fetches any one key received
    pub max_attempts_per_key: u64,

    /// Keys that ended `Failed` yet were fetched more than once
    pub retried_failures: usize,

    pub filter_turns: u64,
    pub filter_reseeds: u64,
    pub filter_recoveries: u64,

    pub network: NetworkStats,
}

/// Runs simulation scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Maximum duration in seconds
    max_duration_secs: f64,

    /// Base engine configuration; scenarios apply their overrides on top
    config: EngineConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            max_duration_secs: 8.0,
            config: EngineConfig::default(),
        }
    }

    /// Sets the maximum duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Sets the base engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> Result<ScenarioResult, SimError> {
        self.execute(scenario, None)
    }

    /// Runs a scenario, capturing frames for export.
    pub fn run_with_export(&self, scenario: ScenarioId) -> Result<(ScenarioResult, SimExport), SimError> {
        let mut export = SimExport::new(scenario.name(), self.seed);
        let result = self.execute(scenario, Some(&mut export))?;
        export.finalize(
            result.passed,
            Some(result.metrics.rmse),
            (result.metrics.region_entries > 0).then_some(result.metrics.hit_rate),
        );
        Ok((result, export))
    }

    fn execute(&self, scenario: ScenarioId, export: Option<&mut SimExport>) -> Result<ScenarioResult, SimError> {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = tokio::runtime::Builder::new_current_thread().build()?;
        runtime.block_on(self.play(scenario, export))
    }

    async fn play(&self, scenario: ScenarioId, mut export: Option<&mut SimExport>) -> Result<ScenarioResult, SimError> {
        let setup = scenario.setup();
        let mut config = self.config.clone();
        setup.configure(&mut config);

        let ctx = SimContext::shared(self.seed);
        let fetcher = Arc::new(SimFetcher::new(Arc::clone(&ctx), setup.network.clone()));
        let engine = Arc::new(ForesightEngine::new(Arc::clone(&ctx), fetcher.clone(), config.clone())?);
        engine.set_regions(viewport(0.0, 0.0, VIEWPORT_WIDTH, VIEWPORT_HEIGHT)?, &setup.regions)?;
        engine.start_maintenance();

        let mut oracle = PointerOracle::new(
            setup.motion.clone(),
            setup.sample_noise,
            self.seed.wrapping_mul(PHYSICS_SEED_MIX),
        );
        let mut validator = PredictionValidator::new();
        let mut metrics = ScenarioMetrics::default();

        let horizon = config.prediction_horizon_ms;
        let dt_ms = 1000.0 / config.sampling_rate_hz;
        let target_ticks = (self.max_duration_secs * config.sampling_rate_hz).max(0.0) as u64;
        let ticks_per_second = config.sampling_rate_hz.round().max(1.0) as u64;

        // Regions the pointer starts inside are not entries
        let start = oracle.true_position();
        let mut inside: HashSet<RegionId> = setup
            .regions
            .iter()
            .filter(|r| r.contains_point(&start))
            .map(|r| r.id)
            .collect();

        for tick in 0..target_ticks {
            if tick > 0 {
                oracle.step(dt_ms);
                ctx.set_time(Duration::from_secs_f64(oracle.time_ms() / 1000.0));
                settle().await;
            }

            let truth = oracle.true_position();
            for region in &setup.regions {
                if region.contains_point(&truth) {
                    if inside.insert(region.id) {
                        validator.record_region_entry(&region.key, engine.cache_status(&region.key));
                    }
                } else {
                    inside.remove(&region.id);
                }
            }

            let sample = oracle.sample();
            let Some(step) = engine.on_sample(sample) else { break };
            // Fetches started this tick begin their latency now
            settle().await;
            validator.record_prediction(sample.t, horizon, step.predicted);
            validator.record_ground_truth(oracle.time_ms(), truth);
            metrics.samples += 1;

            let snapshot = engine.snapshot();
            metrics.max_cache_len = metrics.max_cache_len.max(snapshot.cache_entries.len());

            if let Some(export) = export.as_deref_mut() {
                if tick % EXPORT_INTERVAL == 0 {
                    export.add_frame(SimFrame::capture(oracle.time_ms(), truth, &sample, &snapshot));
                }
            }

            if tick % ticks_per_second == 0 {
                debug!(
                    "  t={:.1}s | cache={} | started={} | failed={}",
                    oracle.time_ms() / 1000.0,
                    snapshot.cache_entries.len(),
                    snapshot.prefetch_stats.fetches_started,
                    snapshot.prefetch_stats.fetches_failed
                );
            }
        }

        // Let fetches still in flight at the horizon land before scoring
        ctx.advance_time(Duration::from_millis(
            setup.network.base_latency_ms + setup.network.jitter_ms,
        ));
        settle().await;

        for key in fetcher.delivered_keys() {
            validator.record_fetch_completed(&key);
        }

        let snapshot = engine.snapshot();
        engine.shutdown();

        let report = validator.generate_report();
        metrics.rmse = report.prediction.rmse();
        metrics.max_error = report.prediction.max_error;
        metrics.region_entries = report.prefetch.hits + report.prefetch.late + report.prefetch.misses;
        metrics.prefetch_hits = report.prefetch.hits;
        metrics.hit_rate = report.prefetch.hit_rate();

        let prefetch = snapshot.prefetch_stats;
        metrics.fetches_started = prefetch.fetches_started;
        metrics.fetches_completed = prefetch.fetches_completed;
        metrics.fetches_failed = prefetch.fetches_failed;
        metrics.fetches_cancelled = prefetch.fetches_cancelled;
        metrics.evictions = prefetch.evictions;
        metrics.max_attempts_per_key = fetcher.max_attempts_per_key();
        metrics.retried_failures = snapshot
            .cache_entries
            .iter()
            .filter(|e| e.status == CacheStatus::Failed && fetcher.attempts_for(&e.key) > 1)
            .count();
        metrics.filter_turns = snapshot.filter_stats.turns;
        metrics.filter_reseeds = snapshot.filter_stats.reseeds;
        metrics.filter_recoveries = snapshot.filter_stats.recoveries;
        metrics.network = fetcher.stats();

        let failures = check_criteria(&setup, &config, &metrics);
        let passed = failures.is_empty();

        info!(
            rmse = metrics.rmse,
            hit_rate = metrics.hit_rate,
            fetches = metrics.fetches_started,
            "Scenario {} finished",
            scenario.name()
        );

        Ok(ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            total_ticks: target_ticks,
            final_time_secs: ctx.now().as_secs_f64(),
            failure_reason: (!passed).then(|| failures.join("; ")),
            metrics,
            report,
        })
    }
}

/// Gives woken tasks a chance to run before the next sample.
async fn settle() {
    for _ in 0..SETTLE_YIELDS {
        tokio::task::yield_now().await;
    }
}

/// Returns one message per violated criterion.
fn check_criteria(setup: &ScenarioSetup, config: &EngineConfig, metrics: &ScenarioMetrics) -> Vec<String> {
    let Criteria {
        max_rmse,
        min_hit_rate,
        max_fetches,
        expect_failures,
        expect_evictions,
    } = setup.criteria;
    let mut failures = Vec::new();

    if let Some(max) = max_rmse {
        if metrics.rmse > max {
            failures.push(format!("RMSE {:.1}px exceeds {:.1}px", metrics.rmse, max));
        }
    }
    if let Some(min) = min_hit_rate {
        if metrics.hit_rate < min {
            failures.push(format!(
                "Hit rate {:.1}% below {:.1}% ({} of {} entries)",
                metrics.hit_rate, min, metrics.prefetch_hits, metrics.region_entries
            ));
        }
    }
    if let Some(max) = max_fetches {
        if metrics.fetches_started > max {
            failures.push(format!("{} fetches started, at most {} expected", metrics.fetches_started, max));
        }
    }
    if expect_failures && metrics.fetches_failed == 0 {
        failures.push("No fetch failed under fault injection".to_string());
    }
    if expect_evictions && metrics.evictions == 0 {
        failures.push("Cache never evicted".to_string());
    }
    if metrics.retried_failures > 0 {
        failures.push(format!("{} failed fetches were retried", metrics.retried_failures));
    }
    if metrics.max_cache_len > config.prefetch.cache_size {
        failures.push(format!(
            "Cache grew to {} entries, capacity {}",
            metrics.max_cache_len, config.prefetch.cache_size
        ));
    }

    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> ScenarioMetrics {
        ScenarioMetrics {
            rmse: 10.0,
            hit_rate: 80.0,
            ..ScenarioMetrics::default()
        }
    }

    #[test]
    fn test_criteria_pass() {
        let setup = ScenarioId::StraightDash.setup();
        assert!(check_criteria(&setup, &EngineConfig::default(), &metrics()).is_empty());
    }

    #[test]
    fn test_criteria_report_each_violation() {
        let setup = ScenarioId::StraightDash.setup();
        let bad = ScenarioMetrics {
            rmse: 500.0,
            hit_rate: 0.0,
            max_cache_len: 51,
            retried_failures: 2,
            ..ScenarioMetrics::default()
        };

        let failures = check_criteria(&setup, &EngineConfig::default(), &bad);
        assert_eq!(failures.len(), 4, "{failures:?}");
        assert!(failures[0].starts_with("RMSE"));
    }

    #[test]
    fn test_fault_expectations() {
        let flaky = ScenarioId::FlakyNetwork.setup();
        let failures = check_criteria(&flaky, &EngineConfig::default(), &metrics());
        assert_eq!(failures, vec!["No fetch failed under fault injection".to_string()]);

        let churn = ScenarioId::CacheChurn.setup();
        let failures = check_criteria(&churn, &EngineConfig::default(), &metrics());
        assert_eq!(failures, vec!["Cache never evicted".to_string()]);
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let mut config = EngineConfig::default();
        config.filter.particle_count = 0;

        let result = ScenarioRunner::new(1).with_duration(0.5).with_config(config).run(ScenarioId::Orbit);
        assert!(matches!(result, Err(SimError::Config(_))));
    }

    #[test]
    fn test_short_run_counts_ticks() {
        let result = ScenarioRunner::new(5).with_duration(0.5).run(ScenarioId::HoverJitter).unwrap();
        assert_eq!(result.total_ticks, 30);
        assert_eq!(result.metrics.samples, 30);
        assert!(result.final_time_secs > 0.48);
    }
}
