//! The "MOTION" Engine - Particle Filter pointer estimator
//!
//! Turns a noisy stream of pointer samples into a probabilistic estimate of
//! where the pointer will be a short time from now. The state of each
//! hypothesis is `[x, y, vx, vy]` (units, units/sec); the population as a
//! whole represents the posterior.
//!
//! One update runs, in order:
//! 1. Timing gate (first sample / too-small Δt / stale gap)
//! 2. Optional adaptive noise from the trailing sample window
//! 3. Turn detection against the current weighted velocity
//! 4. Propagation with heading-shaped process noise
//! 5. Gaussian reweighting against the new sample
//! 6. Normalization with a uniform fallback
//! 7. Recovery when no particle explains the sample, otherwise systematic
//!    resampling on a turn or low effective particle count

use nalgebra::{Point2, Vector2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::ConfigError;
use crate::sample_buffer::{variance, Sample, SampleBuffer};

/// Velocity noise std (units/sec) per sqrt(sec) of elapsed time, per unit of process noise
const VELOCITY_NOISE_GAIN: f64 = 200.0;

/// Position noise std (units) per sqrt(sec) of elapsed time, per unit of process noise
const POSITION_NOISE_GAIN: f64 = 0.5;

/// Velocity spread (units/sec) of a freshly seeded population, per unit of process noise
const INITIAL_VELOCITY_SPREAD: f64 = 40.0;

/// Position spread (units) of a freshly seeded population, per unit of process noise
const INITIAL_POSITION_SPREAD: f64 = 1.0;

/// Turn boost is `1 + TURN_NOISE_GAIN * process_noise²`, capped at `MAX_TURN_BOOST`
const TURN_NOISE_GAIN: f64 = 0.5;
const MAX_TURN_BOOST: f64 = 4.0;

/// Adaptive mode: velocity spread (units/sec) → process noise
const ADAPTIVE_PROCESS_GAIN: f64 = 0.02;

/// Adaptive mode: position spread (units) → measurement noise
const ADAPTIVE_MEASUREMENT_GAIN: f64 = 0.1;

/// Distance from the sample, in measurement sigmas, beyond which the best
/// particle no longer counts as tracking the pointer
const RECOVERY_SIGMAS: f64 = 4.0;

const MOTION_EPSILON: f64 = 1e-9;

// ============================================================================
// TYPES
// ============================================================================

/// One weighted state hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub weight: f64,
}

impl Particle {
    #[inline]
    pub fn position(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }

    #[inline]
    pub fn velocity(&self) -> Vector2<f64> {
        Vector2::new(self.vx, self.vy)
    }
}

/// Weighted mean of the particle population.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterState {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
}

impl FilterState {
    pub fn new(x: f64, y: f64, vx: f64, vy: f64) -> Self {
        Self { x, y, vx, vy }
    }

    /// A motionless state at `(x, y)`.
    pub fn at(x: f64, y: f64) -> Self {
        Self::new(x, y, 0.0, 0.0)
    }

    #[inline]
    pub fn position(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }

    #[inline]
    pub fn velocity(&self) -> Vector2<f64> {
        Vector2::new(self.vx, self.vy)
    }

    /// Position after moving at constant velocity for `horizon_ms`.
    pub fn extrapolate(&self, horizon_ms: f64) -> Point2<f64> {
        self.position() + self.velocity() * (horizon_ms / 1000.0)
    }
}

/// Noise magnitudes currently driving the filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseParameters {
    pub process_noise: f64,
    pub measurement_noise: f64,
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Bounds for adaptive noise estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveNoiseConfig {
    pub min_process_noise: f64,
    pub max_process_noise: f64,
    pub min_measurement_noise: f64,
    pub max_measurement_noise: f64,
}

impl Default for AdaptiveNoiseConfig {
    fn default() -> Self {
        Self {
            min_process_noise: 0.1,
            max_process_noise: 10.0,
            min_measurement_noise: 1.0,
            max_measurement_noise: 50.0,
        }
    }
}

impl AdaptiveNoiseConfig {
    fn clamp(&self, raw: NoiseParameters) -> NoiseParameters {
        NoiseParameters {
            process_noise: raw
                .process_noise
                .clamp(self.min_process_noise, self.max_process_noise),
            measurement_noise: raw
                .measurement_noise
                .clamp(self.min_measurement_noise, self.max_measurement_noise),
        }
    }
}

/// Configuration for the ParticleFilter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Population size, constant for the lifetime of the filter (default: 100)
    pub particle_count: usize,

    /// Trailing samples kept for adaptive noise (default: 10)
    pub history_length: usize,

    /// Process noise when not adaptive (default: 1.0)
    pub process_noise: f64,

    /// Measurement noise in position units when not adaptive (default: 5.0)
    pub measurement_noise: f64,

    /// Recompute noise from the sample window on every update (default: off)
    pub adaptive_noise: Option<AdaptiveNoiseConfig>,

    /// How strongly velocity noise is stretched along each particle's heading, in [0, 1) (default: 0.3)
    pub direction_bias: f64,

    /// Resample when effective count < threshold * particle_count (default: 0.5)
    pub resample_threshold: f64,

    /// Displacement/velocity cosine below which a turn is flagged (default: 0.7, ~45°)
    pub turn_cosine_threshold: f64,

    /// Updates with a smaller Δt are ignored (default: 1 ms)
    pub min_dt_ms: f64,

    /// A larger Δt re-seeds the population at the new sample (default: 1000 ms)
    pub max_dt_ms: f64,

    /// Fixed RNG seed; `None` draws one from the environment
    pub seed: Option<u64>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            particle_count: 100,
            history_length: 10,
            process_noise: 1.0,
            measurement_noise: 5.0,
            adaptive_noise: None,
            direction_bias: 0.3,
            resample_threshold: 0.5,
            turn_cosine_threshold: 0.7,
            min_dt_ms: 1.0,
            max_dt_ms: 1000.0,
            seed: None,
        }
    }
}

impl FilterConfig {
    /// Rejects values that would make the filter misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::require_nonzero("particle_count", self.particle_count)?;
        ConfigError::require_nonzero("history_length", self.history_length)?;
        ConfigError::require_non_negative("process_noise", self.process_noise)?;
        ConfigError::require_positive("measurement_noise", self.measurement_noise)?;
        ConfigError::require_unit("resample_threshold", self.resample_threshold)?;
        ConfigError::require_positive("min_dt_ms", self.min_dt_ms)?;
        ConfigError::require_bounds("dt_ms", self.min_dt_ms, self.max_dt_ms)?;

        if !(0.0..1.0).contains(&self.direction_bias) {
            return Err(ConfigError::OutOfRange {
                field: "direction_bias",
                value: self.direction_bias,
                range: "[0, 1)",
            });
        }
        if !(-1.0..=1.0).contains(&self.turn_cosine_threshold) {
            return Err(ConfigError::OutOfRange {
                field: "turn_cosine_threshold",
                value: self.turn_cosine_threshold,
                range: "[-1, 1]",
            });
        }

        if let Some(adaptive) = &self.adaptive_noise {
            ConfigError::require_bounds(
                "process_noise",
                adaptive.min_process_noise,
                adaptive.max_process_noise,
            )?;
            ConfigError::require_bounds(
                "measurement_noise",
                adaptive.min_measurement_noise,
                adaptive.max_measurement_noise,
            )?;
            ConfigError::require_positive("min_measurement_noise", adaptive.min_measurement_noise)?;
        }
        Ok(())
    }

    /// Noise the filter starts from (fixed values, clamped when adaptive).
    fn initial_noise(&self) -> NoiseParameters {
        let fixed = NoiseParameters {
            process_noise: self.process_noise,
            measurement_noise: self.measurement_noise,
        };
        match &self.adaptive_noise {
            Some(bounds) => bounds.clamp(fixed),
            None => fixed,
        }
    }
}

// ============================================================================
// UPDATE OUTCOME & STATS
// ============================================================================

/// What a call to [`ParticleFilter::update`] did with the sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// First sample or stale gap: population re-seeded at the sample
    Seeded,
    /// Δt below the stability guard (or not a number); nothing changed
    Skipped,
    /// Full predict/reweight step
    Updated {
        turn: bool,
        resampled: bool,
        /// All likelihoods underflowed and weights fell back to uniform
        degenerate: bool,
        /// Population had lost the pointer and was re-injected at the sample
        recovered: bool,
    },
}

/// Counters for introspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStats {
    pub updates: u64,
    pub skipped: u64,
    pub reseeds: u64,
    pub turns: u64,
    pub resamples: u64,
    pub degenerate_fallbacks: u64,
    pub recoveries: u64,
}

// ============================================================================
// PARTICLE FILTER
// ============================================================================

/// Sequential Monte Carlo estimator of pointer position and velocity.
///
/// Weights are non-negative and sum to 1 after every operation; the
/// population size never changes.
#[derive(Debug, Clone)]
pub struct ParticleFilter {
    config: FilterConfig,
    particles: Vec<Particle>,
    history: SampleBuffer,
    noise: NoiseParameters,

    /// Exact state the population was last seeded from.
    ///
    /// Reported by `state()` until the first weighted update, so a reset
    /// reads back exactly what was passed in.
    prior: Option<FilterState>,

    rng: ChaCha8Rng,
    stats: FilterStats,
}

impl ParticleFilter {
    /// Creates a filter at rest at the origin.
    ///
    /// Uses `config.seed` when set, otherwise OS entropy.
    pub fn new(config: FilterConfig) -> Result<Self, ConfigError> {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self::with_rng(config, rng)
    }

    /// Creates a filter drawing from the supplied random stream.
    ///
    /// `config.seed` is ignored; callers use this to plug in a stream
    /// derived from an environment context.
    pub fn with_rng(config: FilterConfig, rng: ChaCha8Rng) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut filter = Self {
            particles: Vec::with_capacity(config.particle_count),
            history: SampleBuffer::new(config.history_length),
            noise: config.initial_noise(),
            prior: None,
            rng,
            stats: FilterStats::default(),
            config,
        };
        filter.seed_population(FilterState::default());
        Ok(filter)
    }

    /// Feeds one sample through the filter.
    ///
    /// Never fails: bad timing is skipped, degenerate weights fall back to
    /// uniform, and the caller can inspect the outcome if it cares.
    pub fn update(&mut self, sample: Sample) -> UpdateOutcome {
        let Some(last) = self.history.latest().copied() else {
            debug!(x = sample.x, y = sample.y, "First sample, seeding population");
            self.reseed_at(sample);
            return UpdateOutcome::Seeded;
        };

        let dt_ms = sample.t - last.t;
        // Written so that NaN also lands here
        if !(dt_ms >= self.config.min_dt_ms) {
            trace!(dt_ms, "Skipping sample below minimum Δt");
            self.stats.skipped += 1;
            return UpdateOutcome::Skipped;
        }
        if dt_ms > self.config.max_dt_ms {
            debug!(dt_ms, "Stale gap, re-seeding population at sample");
            self.reseed_at(sample);
            return UpdateOutcome::Seeded;
        }

        self.history.push(sample);
        if let Some(bounds) = self.config.adaptive_noise.clone() {
            self.noise = self.adapt_noise(&bounds);
        }

        // Turn detection uses the estimate *before* this sample
        let displacement = Vector2::new(sample.x - last.x, sample.y - last.y);
        let turn = self.is_turn(&displacement, &self.state().velocity());

        let mut process_noise = self.noise.process_noise;
        if turn {
            let boost = turn_boost(process_noise);
            debug!(boost, "Direction change detected");
            process_noise *= boost;
            self.stats.turns += 1;
        }

        self.propagate(dt_ms, process_noise);
        let best_likelihood = self.reweight(&sample);
        let degenerate = !self.normalize_weights();

        if best_likelihood < recovery_likelihood() {
            let velocity = displacement / (dt_ms / 1000.0);
            debug!(
                x = sample.x,
                y = sample.y,
                vx = velocity.x,
                vy = velocity.y,
                "No particle near sample, re-injecting population"
            );
            self.recover_at(sample, velocity);
            self.stats.updates += 1;
            return UpdateOutcome::Updated {
                turn,
                resampled: false,
                degenerate,
                recovered: true,
            };
        }

        let threshold = self.config.resample_threshold * self.particles.len() as f64;
        let resampled = turn || self.effective_particle_count() < threshold;
        if resampled {
            self.resample_systematic();
            self.stats.resamples += 1;
        }

        self.prior = None;
        self.stats.updates += 1;

        UpdateOutcome::Updated {
            turn,
            resampled,
            degenerate,
            recovered: false,
        }
    }

    /// Weight-averaged position of every particle extrapolated by its own
    /// velocity over `horizon_ms`. A non-positive horizon returns the
    /// current position.
    pub fn predict(&self, horizon_ms: f64) -> Point2<f64> {
        let state = self.state();
        if !(horizon_ms > 0.0) {
            return state.position();
        }
        if let Some(prior) = self.prior {
            return prior.extrapolate(horizon_ms);
        }

        let dt = horizon_ms / 1000.0;
        let mut predicted = Vector2::zeros();
        for p in &self.particles {
            predicted += (p.position().coords + p.velocity() * dt) * p.weight;
        }
        Point2::from(predicted)
    }

    /// Current estimate (weighted mean, or the exact seed before any update).
    pub fn state(&self) -> FilterState {
        self.prior.unwrap_or_else(|| self.weighted_mean())
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn noise_parameters(&self) -> NoiseParameters {
        self.noise
    }

    pub fn stats(&self) -> FilterStats {
        self.stats
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Samples currently held for timing and adaptive noise.
    pub fn history(&self) -> &SampleBuffer {
        &self.history
    }

    /// `1 / Σ w²`; equals the particle count for uniform weights.
    pub fn effective_particle_count(&self) -> f64 {
        let sum_sq: f64 = self.particles.iter().map(|p| p.weight * p.weight).sum();
        if sum_sq > 0.0 {
            1.0 / sum_sq
        } else {
            0.0
        }
    }

    /// Re-initializes the population around `state` (or at rest at the
    /// origin) and forgets all sample history.
    pub fn reset(&mut self, state: Option<FilterState>) {
        self.history.clear();
        self.noise = self.config.initial_noise();
        self.seed_population(state.unwrap_or_default());
    }

    // ========== Private Helper Methods ==========

    /// Seeds the population around `state`.
    ///
    /// Particle 0 sits exactly on `state`; the rest are perturbed by
    /// Gaussian noise scaled by the process noise.
    fn seed_population(&mut self, state: FilterState) {
        let position_spread = INITIAL_POSITION_SPREAD * self.noise.process_noise;
        let velocity_spread = INITIAL_VELOCITY_SPREAD * self.noise.process_noise;
        self.scatter(state, position_spread, velocity_spread);
    }

    fn scatter(&mut self, state: FilterState, position_spread: f64, velocity_spread: f64) {
        let n = self.config.particle_count;
        let weight = 1.0 / n as f64;

        self.particles.clear();
        self.particles.push(Particle {
            x: state.x,
            y: state.y,
            vx: state.vx,
            vy: state.vy,
            weight,
        });
        for _ in 1..n {
            self.particles.push(Particle {
                x: state.x + gaussian(&mut self.rng) * position_spread,
                y: state.y + gaussian(&mut self.rng) * position_spread,
                vx: state.vx + gaussian(&mut self.rng) * velocity_spread,
                vy: state.vy + gaussian(&mut self.rng) * velocity_spread,
                weight,
            });
        }
        self.prior = Some(state);
    }

    /// Re-injects the population at `sample`, moving at the velocity implied
    /// by the last displacement. Positions spread by the measurement noise.
    /// History is kept.
    fn recover_at(&mut self, sample: Sample, velocity: Vector2<f64>) {
        let state = FilterState::new(sample.x, sample.y, velocity.x, velocity.y);
        let velocity_spread = INITIAL_VELOCITY_SPREAD * self.noise.process_noise;
        self.scatter(state, self.noise.measurement_noise, velocity_spread);
        self.stats.recoveries += 1;
    }

    /// Starts over from `sample` with zero velocity.
    fn reseed_at(&mut self, sample: Sample) {
        self.history.clear();
        self.history.push(sample);
        self.seed_population(FilterState::at(sample.x, sample.y));
        self.stats.reseeds += 1;
    }

    fn weighted_mean(&self) -> FilterState {
        let mut mean = FilterState::default();
        for p in &self.particles {
            mean.x += p.x * p.weight;
            mean.y += p.y * p.weight;
            mean.vx += p.vx * p.weight;
            mean.vy += p.vy * p.weight;
        }
        mean
    }

    /// Noise from the trailing window: spread of inferred velocities drives
    /// process noise, spread of raw positions drives measurement noise.
    fn adapt_noise(&self, bounds: &AdaptiveNoiseConfig) -> NoiseParameters {
        // Two velocities are needed for a spread
        if self.history.len() < 3 {
            return self.noise;
        }

        let velocities = self.history.velocities();
        let velocity_spread = (variance(velocities.iter().map(|v| v.0))
            + variance(velocities.iter().map(|v| v.1)))
        .sqrt();
        let position_spread = (variance(self.history.iter().map(|s| s.x))
            + variance(self.history.iter().map(|s| s.y)))
        .sqrt();

        bounds.clamp(NoiseParameters {
            process_noise: velocity_spread * ADAPTIVE_PROCESS_GAIN,
            measurement_noise: position_spread * ADAPTIVE_MEASUREMENT_GAIN,
        })
    }

    fn is_turn(&self, displacement: &Vector2<f64>, velocity: &Vector2<f64>) -> bool {
        let d = displacement.norm();
        let v = velocity.norm();
        if d < MOTION_EPSILON || v < MOTION_EPSILON {
            return false;
        }
        displacement.dot(velocity) / (d * v) < self.config.turn_cosine_threshold
    }

    /// Moves every particle forward by `dt_ms` with fresh process noise.
    fn propagate(&mut self, dt_ms: f64, process_noise: f64) {
        let dt = dt_ms / 1000.0;
        let velocity_sigma = process_noise * VELOCITY_NOISE_GAIN * dt.sqrt();
        let position_sigma = process_noise * POSITION_NOISE_GAIN * dt.sqrt();
        let bias = self.config.direction_bias;

        let rng = &mut self.rng;
        for p in self.particles.iter_mut() {
            let raw = Vector2::new(gaussian(rng), gaussian(rng)) * velocity_sigma;
            let velocity = p.velocity() + steer_along_heading(raw, &p.velocity(), bias);

            p.vx = velocity.x;
            p.vy = velocity.y;
            p.x += velocity.x * dt + gaussian(rng) * position_sigma;
            p.y += velocity.y * dt + gaussian(rng) * position_sigma;
        }
    }

    /// Multiplies each weight by `exp(-d² / 2σ²)` for the new sample and
    /// returns the largest likelihood seen.
    fn reweight(&mut self, sample: &Sample) -> f64 {
        let sigma = self.noise.measurement_noise;
        let inv_two_var = 1.0 / (2.0 * sigma * sigma);
        let mut best = 0.0_f64;
        for p in self.particles.iter_mut() {
            let dx = p.x - sample.x;
            let dy = p.y - sample.y;
            let likelihood = (-(dx * dx + dy * dy) * inv_two_var).exp();
            best = best.max(likelihood);
            p.weight *= likelihood;
        }
        best
    }

    /// Normalizes weights to sum to 1. Returns false (and installs uniform
    /// weights) if every likelihood underflowed.
    fn normalize_weights(&mut self) -> bool {
        let total: f64 = self.particles.iter().map(|p| p.weight).sum();
        if total > 0.0 && total.is_finite() {
            for p in self.particles.iter_mut() {
                p.weight /= total;
            }
            return true;
        }

        debug!("All particle weights collapsed, falling back to uniform");
        let uniform = 1.0 / self.particles.len() as f64;
        for p in self.particles.iter_mut() {
            p.weight = uniform;
        }
        self.stats.degenerate_fallbacks += 1;
        false
    }

    /// Low-variance (systematic) resampling, O(N).
    fn resample_systematic(&mut self) {
        let n = self.particles.len();
        let step = 1.0 / n as f64;
        let start = self.rng.gen::<f64>() * step;

        let mut resampled = Vec::with_capacity(n);
        let mut cumulative = self.particles[0].weight;
        let mut i = 0;
        for j in 0..n {
            let u = start + j as f64 * step;
            while u > cumulative && i < n - 1 {
                i += 1;
                cumulative += self.particles[i].weight;
            }
            resampled.push(Particle {
                weight: step,
                ..self.particles[i]
            });
        }
        self.particles = resampled;
    }
}

/// Likelihood of a particle sitting `RECOVERY_SIGMAS` from the sample.
fn recovery_likelihood() -> f64 {
    (-0.5 * RECOVERY_SIGMAS * RECOVERY_SIGMAS).exp()
}

/// Multiplier applied to process noise on a turn; grows with the square of
/// the configured noise so noisier filters react harder.
fn turn_boost(process_noise: f64) -> f64 {
    (1.0 + TURN_NOISE_GAIN * process_noise * process_noise).min(MAX_TURN_BOOST)
}

/// Stretches the along-heading component of `noise` by `1 + bias` and
/// shrinks the cross-heading component by `1 - bias`.
fn steer_along_heading(noise: Vector2<f64>, velocity: &Vector2<f64>, bias: f64) -> Vector2<f64> {
    let speed = velocity.norm();
    if speed < MOTION_EPSILON || bias == 0.0 {
        return noise;
    }
    let heading = velocity / speed;
    let along = noise.dot(&heading);
    let across = noise - heading * along;
    heading * (along * (1.0 + bias)) + across * (1.0 - bias)
}

#[inline]
fn gaussian(rng: &mut ChaCha8Rng) -> f64 {
    rng.sample(StandardNormal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn seeded(seed: u64) -> FilterConfig {
        FilterConfig {
            seed: Some(seed),
            ..FilterConfig::default()
        }
    }

    fn weight_sum(filter: &ParticleFilter) -> f64 {
        filter.particles().iter().map(|p| p.weight).sum()
    }

    /// Feeds `(i*10, 0)` every 100ms for i = 0..=10 (100 units/sec along x).
    fn feed_straight_line(filter: &mut ParticleFilter) {
        for i in 0..=10 {
            filter.update(Sample::new(i as f64 * 10.0, 0.0, i as f64 * 100.0));
        }
    }

    #[test]
    fn test_filter_initialization() {
        let filter = ParticleFilter::new(seeded(1)).unwrap();

        assert_eq!(filter.particles().len(), 100);
        assert_relative_eq!(weight_sum(&filter), 1.0, epsilon = 1e-9);

        // Anchor particle carries the seed state exactly
        let anchor = filter.particles()[0];
        assert_eq!((anchor.x, anchor.y, anchor.vx, anchor.vy), (0.0, 0.0, 0.0, 0.0));
        assert_eq!(filter.state(), FilterState::default());
    }

    #[test]
    fn test_reset_round_trip() {
        let mut filter = ParticleFilter::new(seeded(2)).unwrap();
        feed_straight_line(&mut filter);

        filter.reset(Some(FilterState::new(5.0, 5.0, 10.0, 5.0)));

        assert_eq!(filter.state(), FilterState::new(5.0, 5.0, 10.0, 5.0));
        assert!(filter.history().is_empty());
        assert_eq!(filter.particles().len(), 100);
    }

    #[test]
    fn test_first_sample_snaps_with_zero_velocity() {
        let mut filter = ParticleFilter::new(seeded(3)).unwrap();
        filter.reset(Some(FilterState::new(0.0, 0.0, 50.0, 50.0)));

        let outcome = filter.update(Sample::new(120.0, 80.0, 1_000.0));

        assert_eq!(outcome, UpdateOutcome::Seeded);
        assert_eq!(filter.state(), FilterState::at(120.0, 80.0));
        assert_eq!(filter.predict(250.0), Point2::new(120.0, 80.0));
    }

    #[test]
    fn test_predict_zero_is_idempotent() {
        let mut filter = ParticleFilter::new(seeded(4)).unwrap();
        feed_straight_line(&mut filter);

        let first = filter.predict(0.0);
        for _ in 0..5 {
            assert_eq!(filter.predict(0.0), first);
        }
        assert_eq!(filter.predict(-10.0), first);
        assert_eq!(first, filter.state().position());
    }

    #[test]
    fn test_straight_line_convergence() {
        for seed in 0..10 {
            let mut filter = ParticleFilter::new(seeded(seed)).unwrap();
            feed_straight_line(&mut filter);

            let state = filter.state();
            assert!(
                (state.vx - 100.0).abs() < 50.0,
                "seed {seed}: vx = {}",
                state.vx
            );
        }
    }

    #[test]
    fn test_prediction_leads_the_pointer() {
        let mut filter = ParticleFilter::new(seeded(5)).unwrap();
        feed_straight_line(&mut filter);

        let now = filter.predict(0.0);
        let ahead = filter.predict(300.0);
        assert!(ahead.x > now.x + 10.0, "prediction {ahead:?} should lead {now:?}");
    }

    #[test]
    fn test_turn_responsiveness_scales_with_process_noise() {
        for seed in 0..10 {
            let run = |process_noise: f64| {
                let mut filter = ParticleFilter::new(FilterConfig {
                    process_noise,
                    seed: Some(seed),
                    ..FilterConfig::default()
                })
                .unwrap();
                feed_straight_line(&mut filter);
                // 90° turn: now heading +y at the same speed
                filter.update(Sample::new(100.0, 10.0, 1_100.0));
                filter.state().vy
            };

            let calm = run(0.25);
            let jumpy = run(1.0);
            assert!(jumpy > calm, "seed {seed}: vy(1) = {jumpy}, vy(0.25) = {calm}");
        }
    }

    /// Feeds 120 noiseless samples at 60 Hz moving along x at `speed`.
    fn track_at(seed: u64, speed: f64) -> (f64, FilterState) {
        let mut filter = ParticleFilter::new(seeded(seed)).unwrap();
        let dt_ms = 1000.0 / 60.0;
        let mut x = 0.0;
        for i in 0..120 {
            let t = i as f64 * dt_ms;
            x = speed * t / 1000.0;
            filter.update(Sample::new(x, 0.0, t));
        }
        (x, filter.state())
    }

    #[test]
    fn test_tracks_fast_motion_at_sampling_rate() {
        for speed in [500.0, 1000.0] {
            for seed in 0..5 {
                let (true_x, state) = track_at(seed, speed);
                let lag = true_x - state.x;
                assert!(lag.abs() < 10.0, "speed {speed} seed {seed}: lag = {lag}");
                assert!(
                    (state.vx - speed).abs() < 0.15 * speed,
                    "speed {speed} seed {seed}: vx = {}",
                    state.vx
                );
            }
        }
    }

    #[test]
    fn test_lost_population_recovers_at_sample() {
        let mut filter = ParticleFilter::new(seeded(12)).unwrap();
        filter.update(Sample::new(0.0, 0.0, 0.0));

        // 60 units in 20ms is far outside anything seeded at rest
        let outcome = filter.update(Sample::new(60.0, 0.0, 20.0));

        assert!(matches!(
            outcome,
            UpdateOutcome::Updated {
                recovered: true,
                resampled: false,
                ..
            }
        ));
        let state = filter.state();
        assert_eq!((state.x, state.y), (60.0, 0.0));
        assert_relative_eq!(state.vx, 3000.0, epsilon = 1e-6);
        assert_relative_eq!(state.vy, 0.0);
        assert_eq!(filter.stats().recoveries, 1);
        assert_eq!(filter.history().len(), 2);
        assert_relative_eq!(weight_sum(&filter), 1.0, epsilon = 1e-9);

        // The next consistent sample is explained without another recovery
        let outcome = filter.update(Sample::new(120.0, 0.0, 40.0));
        assert!(matches!(outcome, UpdateOutcome::Updated { recovered: false, .. }));
        assert!((filter.state().x - 120.0).abs() < 10.0);
    }

    #[test]
    fn test_turn_is_flagged_and_forces_resample() {
        let mut filter = ParticleFilter::new(seeded(6)).unwrap();
        feed_straight_line(&mut filter);

        let outcome = filter.update(Sample::new(100.0, 10.0, 1_100.0));
        assert!(matches!(
            outcome,
            UpdateOutcome::Updated {
                turn: true,
                resampled: true,
                ..
            }
        ));
        assert_eq!(filter.stats().turns, 1);
    }

    #[test]
    fn test_small_or_backwards_dt_is_noop() {
        let mut filter = ParticleFilter::new(seeded(7)).unwrap();
        feed_straight_line(&mut filter);
        let before = filter.particles().to_vec();

        assert_eq!(filter.update(Sample::new(101.0, 0.0, 1_000.5)), UpdateOutcome::Skipped);
        assert_eq!(filter.update(Sample::new(90.0, 0.0, 900.0)), UpdateOutcome::Skipped);
        assert_eq!(filter.update(Sample::new(90.0, 0.0, f64::NAN)), UpdateOutcome::Skipped);

        assert_eq!(filter.particles(), &before[..]);
        assert_eq!(filter.stats().skipped, 3);
    }

    #[test]
    fn test_stale_gap_reseeds() {
        let mut filter = ParticleFilter::new(seeded(8)).unwrap();
        feed_straight_line(&mut filter);

        let outcome = filter.update(Sample::new(500.0, 500.0, 10_000.0));

        assert_eq!(outcome, UpdateOutcome::Seeded);
        assert_eq!(filter.state(), FilterState::at(500.0, 500.0));
        assert_eq!(filter.history().len(), 1);
    }

    #[test]
    fn test_degenerate_weights_fall_back_to_uniform() {
        let mut filter = ParticleFilter::new(FilterConfig {
            measurement_noise: 1e-3,
            seed: Some(9),
            ..FilterConfig::default()
        })
        .unwrap();
        filter.update(Sample::new(0.0, 0.0, 0.0));

        // Far beyond anything the population can reach in 50ms
        let outcome = filter.update(Sample::new(1.0e6, 1.0e6, 50.0));

        assert!(matches!(
            outcome,
            UpdateOutcome::Updated {
                degenerate: true,
                recovered: true,
                ..
            }
        ));
        assert_relative_eq!(weight_sum(&filter), 1.0, epsilon = 1e-9);
        assert!(filter.particles().iter().all(|p| p.weight > 0.0));
        assert_eq!(filter.stats().degenerate_fallbacks, 1);
        assert_relative_eq!(filter.state().x, 1.0e6);
    }

    #[test]
    fn test_adaptive_noise_stays_within_bounds() {
        let bounds = AdaptiveNoiseConfig {
            min_process_noise: 0.5,
            max_process_noise: 2.0,
            min_measurement_noise: 2.0,
            max_measurement_noise: 8.0,
        };
        let mut filter = ParticleFilter::new(FilterConfig {
            adaptive_noise: Some(bounds.clone()),
            seed: Some(10),
            ..FilterConfig::default()
        })
        .unwrap();

        // Erratic zig-zag produces a large velocity spread
        for i in 0..20 {
            let y = if i % 2 == 0 { 0.0 } else { 400.0 };
            filter.update(Sample::new(i as f64 * 30.0, y, i as f64 * 20.0));

            let noise = filter.noise_parameters();
            assert!((bounds.min_process_noise..=bounds.max_process_noise).contains(&noise.process_noise));
            assert!((bounds.min_measurement_noise..=bounds.max_measurement_noise)
                .contains(&noise.measurement_noise));
        }
        assert_relative_eq!(filter.noise_parameters().process_noise, 2.0);
    }

    #[test]
    fn test_same_seed_same_population() {
        let mut a = ParticleFilter::new(seeded(11)).unwrap();
        let mut b = ParticleFilter::new(seeded(11)).unwrap();
        feed_straight_line(&mut a);
        feed_straight_line(&mut b);

        assert_eq!(a.particles(), b.particles());
        assert_eq!(a.predict(200.0), b.predict(200.0));
    }

    #[test]
    fn test_config_validation() {
        let inverted = FilterConfig {
            adaptive_noise: Some(AdaptiveNoiseConfig {
                min_process_noise: 5.0,
                max_process_noise: 1.0,
                ..AdaptiveNoiseConfig::default()
            }),
            ..FilterConfig::default()
        };
        assert!(matches!(
            ParticleFilter::new(inverted),
            Err(ConfigError::InvertedBounds { field: "process_noise", .. })
        ));

        let empty = FilterConfig {
            particle_count: 0,
            ..FilterConfig::default()
        };
        assert!(matches!(ParticleFilter::new(empty), Err(ConfigError::Zero { .. })));

        let bias = FilterConfig {
            direction_bias: 1.0,
            ..FilterConfig::default()
        };
        assert!(bias.validate().is_err());
    }

    #[test]
    fn test_steer_along_heading_preserves_axes() {
        let velocity = Vector2::new(10.0, 0.0);
        let steered = steer_along_heading(Vector2::new(1.0, 1.0), &velocity, 0.5);
        assert_relative_eq!(steered.x, 1.5);
        assert_relative_eq!(steered.y, 0.5);

        // No heading, no shaping
        let still = steer_along_heading(Vector2::new(1.0, 1.0), &Vector2::zeros(), 0.5);
        assert_eq!(still, Vector2::new(1.0, 1.0));
    }

    #[test]
    fn test_turn_boost_grows_then_caps() {
        assert_relative_eq!(turn_boost(1.0), 1.5);
        assert_relative_eq!(turn_boost(2.0), 3.0);
        assert_relative_eq!(turn_boost(10.0), MAX_TURN_BOOST);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_weights_normalized_and_population_constant(
            steps in prop::collection::vec((-60.0f64..60.0, -60.0f64..60.0, 0.0f64..1500.0), 1..40),
            particle_count in 1usize..64,
        ) {
            let mut filter = ParticleFilter::new(FilterConfig {
                particle_count,
                seed: Some(42),
                ..FilterConfig::default()
            }).unwrap();

            let (mut x, mut y, mut t) = (0.0, 0.0, 0.0);
            for (dx, dy, dt) in steps {
                x += dx;
                y += dy;
                t += dt;
                filter.update(Sample::new(x, y, t));

                let sum: f64 = filter.particles().iter().map(|p| p.weight).sum();
                prop_assert!((sum - 1.0).abs() < 1e-6, "weights sum to {}", sum);
                prop_assert!(filter.particles().iter().all(|p| p.weight >= 0.0));
                prop_assert_eq!(filter.particles().len(), particle_count);
            }
        }
    }
}
