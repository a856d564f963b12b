//! Ground truth oracle for simulation.
//!
//! The PointerOracle knows where the pointer really is:
//! - Scripted motion (polyline paths, orbits, idle hovering)
//! - Sample generation with seeded Gaussian noise
//!
//! The engine under test only ever sees the noisy samples.

use foresight_core::Sample;
use nalgebra::{Point2, Vector2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// How the true pointer moves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Motion {
    /// Constant speed (units/s) along a polyline; rests on the last waypoint.
    Path {
        waypoints: Vec<Point2<f64>>,
        speed: f64,
    },

    /// Circles `center` counter-clockwise, starting at angle zero.
    Orbit {
        center: Point2<f64>,
        radius: f64,
        /// Radians per second
        angular_speed: f64,
    },

    /// Bounded random walk around `center`.
    Hover {
        center: Point2<f64>,
        /// Maximum distance from `center` on either axis
        amplitude: f64,
        /// Standard deviation of each step
        step: f64,
    },
}

/// The Oracle - maintains the true pointer position and generates samples.
pub struct PointerOracle {
    motion: Motion,

    /// RNG for sample noise and hover steps
    rng: ChaCha8Rng,

    /// Sample noise; `None` when noise is disabled
    noise: Option<Normal<f64>>,

    /// Current simulation time (ms)
    time_ms: f64,

    /// True position at `time_ms`
    position: Point2<f64>,

    /// Accumulated hover offset
    wander: Vector2<f64>,
}

impl PointerOracle {
    /// Creates an oracle. The seed should be derived separately from the
    /// network seed so latency draws never shift the trajectory.
    pub fn new(motion: Motion, noise_std: f64, seed: u64) -> Self {
        let noise = if noise_std.is_finite() && noise_std > 0.0 {
            Normal::new(0.0, noise_std).ok()
        } else {
            None
        };

        let mut oracle = Self {
            motion,
            rng: ChaCha8Rng::seed_from_u64(seed),
            noise,
            time_ms: 0.0,
            position: Point2::origin(),
            wander: Vector2::zeros(),
        };
        oracle.position = oracle.position_at(0.0);
        oracle
    }

    /// Advances the pointer by `dt_ms`.
    pub fn step(&mut self, dt_ms: f64) {
        self.time_ms += dt_ms.max(0.0);

        if let Motion::Hover { amplitude, step, .. } = self.motion {
            if let Ok(walk) = Normal::new(0.0, step.max(0.0)) {
                let limit = amplitude.max(0.0);
                self.wander.x = (self.wander.x + walk.sample(&mut self.rng)).clamp(-limit, limit);
                self.wander.y = (self.wander.y + walk.sample(&mut self.rng)).clamp(-limit, limit);
            }
        }

        self.position = self.position_at(self.time_ms);
    }

    /// Current simulation time in ms.
    pub fn time_ms(&self) -> f64 {
        self.time_ms
    }

    /// Where the pointer truly is.
    pub fn true_position(&self) -> Point2<f64> {
        self.position
    }

    /// A noisy sample of the current position, as a sampling front end
    /// would deliver it.
    pub fn sample(&mut self) -> Sample {
        let (dx, dy) = match self.noise {
            Some(normal) => (normal.sample(&mut self.rng), normal.sample(&mut self.rng)),
            None => (0.0, 0.0),
        };
        Sample::new(self.position.x + dx, self.position.y + dy, self.time_ms)
    }

    pub fn motion(&self) -> &Motion {
        &self.motion
    }

    fn position_at(&self, time_ms: f64) -> Point2<f64> {
        match &self.motion {
            Motion::Path { waypoints, speed } => along_path(waypoints, speed * time_ms / 1000.0),
            Motion::Orbit {
                center,
                radius,
                angular_speed,
            } => {
                let angle = angular_speed * time_ms / 1000.0;
                center + Vector2::new(angle.cos(), angle.sin()) * *radius
            }
            Motion::Hover { center, .. } => center + self.wander,
        }
    }
}

/// The point `distance` units along the polyline, clamped to its ends.
fn along_path(waypoints: &[Point2<f64>], distance: f64) -> Point2<f64> {
    let Some(first) = waypoints.first() else {
        return Point2::origin();
    };

    let mut remaining = distance.max(0.0);
    for pair in waypoints.windows(2) {
        let leg = pair[1] - pair[0];
        let length = leg.norm();
        if remaining <= length {
            return if length > 0.0 {
                pair[0] + leg * (remaining / length)
            } else {
                pair[0]
            };
        }
        remaining -= length;
    }

    waypoints.last().copied().unwrap_or(*first)
}
