//! Hit-probability model.
//!
//! Scores how likely the straight path `current → predicted` is to enter a
//! region within the prediction horizon. Regions are approximated by a
//! circle of half their smaller dimension around their centre.
//!
//! ```text
//!                       perp
//!   current ──────●────────┼──────► predicted
//!                 near     │
//!                       ( centre )
//! ```
//!
//! Directness dominates closeness (60/40) because a region squarely ahead
//! is the better prefetch bet than a nearby one off to the side.

use std::cmp::Ordering;

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::foresight_space::Region;

/// Share of the score given to along-path closeness
const CLOSENESS_WEIGHT: f64 = 0.4;

/// Share of the score given to how squarely the path hits the centre
const DIRECTNESS_WEIGHT: f64 = 0.6;

/// Added to the effective radius when normalizing perpendicular distance
const DIRECTNESS_SLACK: f64 = 50.0;

/// Movements shorter than this carry no direction
const MIN_MOVEMENT: f64 = 1e-6;

/// Probability and estimated arrival time for one region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HitScore {
    /// In [0, 1]
    pub probability: f64,
    /// Milliseconds until the path enters the region; +∞ if it never does
    pub time_to_reach: f64,
}

impl HitScore {
    pub const MISS: HitScore = HitScore {
        probability: 0.0,
        time_to_reach: f64::INFINITY,
    };

    pub fn is_hit(&self) -> bool {
        self.probability > 0.0
    }
}

/// Scores `region` against the predicted path.
///
/// Returns [`HitScore::MISS`] when there is no movement, when the region is
/// off the path or behind the pointer, or when it lies beyond the horizon.
pub fn score(region: &Region, current: &Point2<f64>, predicted: &Point2<f64>, horizon_ms: f64) -> HitScore {
    let movement = predicted - current;
    let distance = movement.norm();
    if distance < MIN_MOVEMENT || !distance.is_finite() {
        return HitScore::MISS;
    }
    let direction = movement / distance;

    let to_center = region.center() - current;
    let along = to_center.dot(&direction);
    let perpendicular = direction.perp(&to_center).abs();
    let radius = region.effective_radius();

    if perpendicular > radius || along <= 0.0 {
        return HitScore::MISS;
    }

    let near = (along - (radius * radius - perpendicular * perpendicular).sqrt()).max(0.0);
    let time_to_reach = horizon_ms * near / distance;
    if time_to_reach > horizon_ms {
        return HitScore::MISS;
    }

    let closeness = 1.0 - near / distance;
    let directness = 1.0 - perpendicular / (radius + DIRECTNESS_SLACK);
    HitScore {
        probability: (CLOSENESS_WEIGHT * closeness + DIRECTNESS_WEIGHT * directness).clamp(0.0, 1.0),
        time_to_reach,
    }
}

/// A scored region from one evaluation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub region: Region,
    pub probability: f64,
    pub time_to_reach: f64,
}

impl Candidate {
    pub fn new(region: Region, score: HitScore) -> Self {
        Self {
            region,
            probability: score.probability,
            time_to_reach: score.time_to_reach,
        }
    }

    /// Ranking order: higher probability first, then sooner arrival.
    pub fn rank(a: &Candidate, b: &Candidate) -> Ordering {
        b.probability
            .total_cmp(&a.probability)
            .then_with(|| a.time_to_reach.total_cmp(&b.time_to_reach))
    }
}

/// Scores every region and returns those at or above `min_probability`,
/// best first.
pub fn rank_candidates<'a>(
    regions: impl IntoIterator<Item = &'a Region>,
    current: &Point2<f64>,
    predicted: &Point2<f64>,
    horizon_ms: f64,
    min_probability: f64,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = regions
        .into_iter()
        .filter_map(|region| {
            let hit = score(region, current, predicted, horizon_ms);
            (hit.is_hit() && hit.probability >= min_probability).then(|| Candidate::new(region.clone(), hit))
        })
        .collect();
    candidates.sort_by(Candidate::rank);
    candidates
}
