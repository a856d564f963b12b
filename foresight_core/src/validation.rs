//! Validation Module - Prediction accuracy and prefetch effectiveness
//! ===================================================================
//!
//! Compares what the engine predicted against where the pointer actually
//! went, and whether prefetched resources were ready when their region was
//! entered.
//!
//! Key metrics:
//! - Prediction error at the horizon (RMSE, mean, max)
//! - Prefetch hits (resource complete on entry), late and missed entries
//! - Wasted fetches (completed but never entered)
//!
//! Usage:
//! ```ignore
//! use foresight_core::validation::PredictionValidator;
//!
//! let mut validator = PredictionValidator::new();
//! validator.record_prediction(t, horizon_ms, predicted);
//! validator.record_ground_truth(t, actual);
//! validator.record_region_entry(&key, scheduler.status(&key));
//!
//! let report = validator.generate_report();
//! ```

use std::collections::{HashSet, VecDeque};

use foresight_env::ResourceKey;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::foresight_prefetch::CacheStatus;

// =============================================================================
// ENTRIES
// =============================================================================

/// A prediction waiting for its horizon to pass.
#[derive(Debug, Clone)]
struct PendingPrediction {
    due_ms: f64,
    predicted: Point2<f64>,
}

#[derive(Debug, Clone, Copy)]
struct TruthSample {
    t_ms: f64,
    position: Point2<f64>,
}

// =============================================================================
// METRICS
// =============================================================================

/// Accumulated error statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub count: usize,
    pub error_sum: f64,
    pub error_sum_squared: f64,
    pub max_error: f64,
}

impl ErrorMetrics {
    fn record(&mut self, error: f64) {
        self.count += 1;
        self.error_sum += error;
        self.error_sum_squared += error * error;
        self.max_error = self.max_error.max(error);
    }

    pub fn rmse(&self) -> f64 {
        if self.count > 0 {
            (self.error_sum_squared / self.count as f64).sqrt()
        } else {
            0.0
        }
    }

    pub fn mean(&self) -> f64 {
        if self.count > 0 {
            self.error_sum / self.count as f64
        } else {
            0.0
        }
    }
}

/// How prefetching fared when the pointer actually arrived.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrefetchMetrics {
    /// Entered with the resource already complete
    pub hits: usize,
    /// Entered while the fetch was still pending
    pub late: usize,
    /// Entered with nothing (or a failure) in the cache
    pub misses: usize,
    /// Completed but never entered
    pub wasted: usize,
}

impl PrefetchMetrics {
    /// Share of region entries served from a completed prefetch, in percent.
    pub fn hit_rate(&self) -> f64 {
        let entries = self.hits + self.late + self.misses;
        if entries > 0 {
            self.hits as f64 / entries as f64 * 100.0
        } else {
            0.0
        }
    }
}

// =============================================================================
// VALIDATOR
// =============================================================================

/// Collects predictions, ground truth and prefetch outcomes over a run.
pub struct PredictionValidator {
    pending: VecDeque<PendingPrediction>,
    last_truth: Option<TruthSample>,
    error: ErrorMetrics,
    /// Predictions that could not be matched to ground truth
    unmatched: usize,
    prefetch: PrefetchMetrics,
    fetched: HashSet<ResourceKey>,
    entered: HashSet<ResourceKey>,
}

impl PredictionValidator {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            last_truth: None,
            error: ErrorMetrics::default(),
            unmatched: 0,
            prefetch: PrefetchMetrics::default(),
            fetched: HashSet::new(),
            entered: HashSet::new(),
        }
    }

    /// Records a prediction made at `made_at_ms` for `horizon_ms` ahead.
    pub fn record_prediction(&mut self, made_at_ms: f64, horizon_ms: f64, predicted: Point2<f64>) {
        self.pending.push_back(PendingPrediction {
            due_ms: made_at_ms + horizon_ms.max(0.0),
            predicted,
        });
    }

    /// Records where the pointer truly was at `t_ms`.
    ///
    /// Every prediction that has come due is scored against the true
    /// position at its due time, interpolated between this sample and the
    /// previous one.
    pub fn record_ground_truth(&mut self, t_ms: f64, actual: Point2<f64>) {
        let current = TruthSample {
            t_ms,
            position: actual,
        };

        while let Some(front) = self.pending.front() {
            if front.due_ms > t_ms {
                break;
            }
            let due = front.due_ms;
            let predicted = front.predicted;
            self.pending.pop_front();

            match self.last_truth {
                Some(prev) if prev.t_ms <= due => {
                    let truth = interpolate(&prev, &current, due);
                    self.error.record((predicted - truth).norm());
                }
                _ => self.unmatched += 1,
            }
        }
        self.last_truth = Some(current);
    }

    /// Records that a prefetch finished successfully.
    pub fn record_fetch_completed(&mut self, key: &ResourceKey) {
        self.fetched.insert(key.clone());
    }

    /// Records the pointer entering the region behind `key`, with the cache
    /// status at that moment. Repeat entries count once.
    pub fn record_region_entry(&mut self, key: &ResourceKey, status: Option<CacheStatus>) {
        if !self.entered.insert(key.clone()) {
            return;
        }
        match status {
            Some(CacheStatus::Complete) => self.prefetch.hits += 1,
            Some(CacheStatus::Pending) => self.prefetch.late += 1,
            Some(CacheStatus::Failed) | None => self.prefetch.misses += 1,
        }
    }

    pub fn generate_report(&self) -> ValidationReport {
        let mut prefetch = self.prefetch.clone();
        prefetch.wasted = self.fetched.difference(&self.entered).count();

        ValidationReport {
            prediction: self.error.clone(),
            unmatched_predictions: self.unmatched + self.pending.len(),
            prefetch,
        }
    }
}

impl Default for PredictionValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn interpolate(a: &TruthSample, b: &TruthSample, t_ms: f64) -> Point2<f64> {
    let span = b.t_ms - a.t_ms;
    if span <= 0.0 {
        return b.position;
    }
    let s = ((t_ms - a.t_ms) / span).clamp(0.0, 1.0);
    a.position + (b.position - a.position) * s
}

// =============================================================================
// VALIDATION REPORT
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub prediction: ErrorMetrics,
    pub unmatched_predictions: usize,
    pub prefetch: PrefetchMetrics,
}

impl ValidationReport {
    /// Print formatted report to console
    pub fn print(&self) {
        println!();
        println!("╔══════════════════════════════════════════════════════════════╗");
        println!("║               FORESIGHT VALIDATION REPORT                    ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ PREDICTION                                                   ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ Scored Predictions:    {:>10}                            ║", self.prediction.count);
        println!("║ Unmatched:             {:>10}                            ║", self.unmatched_predictions);
        println!("║ RMSE:                  {:>10.2} px                         ║", self.prediction.rmse());
        println!("║ Mean Error:            {:>10.2} px                         ║", self.prediction.mean());
        println!("║ Max Error:             {:>10.2} px                         ║", self.prediction.max_error);
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ PREFETCH                                                     ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ Hits:                  {:>10}                            ║", self.prefetch.hits);
        println!("║ Late:                  {:>10}                            ║", self.prefetch.late);
        println!("║ Misses:                {:>10}                            ║", self.prefetch.misses);
        println!("║ Wasted Fetches:        {:>10}                            ║", self.prefetch.wasted);
        println!("║ Hit Rate:              {:>10.1}%                           ║", self.prefetch.hit_rate());
        println!("╚══════════════════════════════════════════════════════════════╝");
    }

    /// Check if validation passes acceptance criteria
    pub fn passes_criteria(&self, max_rmse: f64, min_hit_rate: f64) -> bool {
        self.prediction.rmse() <= max_rmse && self.prefetch.hit_rate() >= min_hit_rate
    }
}

// =============================================================================
// TESTS
// =============================================================================
