//! Simulation scenarios for DST.
//!
//! Each scenario pairs a scripted pointer motion with a region layout, a
//! network profile and the acceptance criteria the run is judged by.

use std::f64::consts::FRAC_PI_4;
use std::fmt;
use std::str::FromStr;

use foresight_core::{EngineConfig, Region, RegionId};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::network::NetworkProfile;
use crate::oracle::Motion;

/// Width and height of the simulated screen
pub const VIEWPORT_WIDTH: f64 = 1280.0;
pub const VIEWPORT_HEIGHT: f64 = 720.0;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// SIM-001: Straight horizontal sweep across a row of cards
    StraightDash,

    /// SIM-002: Sweep right, then a sharp turn downwards
    RightAngle,

    /// SIM-003: Continuous circular motion over a ring of cards
    Orbit,

    /// SIM-004: Repeated diagonal reversals
    Zigzag,

    /// SIM-005: Pointer resting with hand tremor
    HoverJitter,

    /// SIM-006: Diagonal pass over a dense grid
    DenseGrid,

    /// SIM-007: Dense grid with an unreliable origin
    FlakyNetwork,

    /// SIM-008: Raster scan against a tiny, short-lived cache
    CacheChurn,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::StraightDash,
            ScenarioId::RightAngle,
            ScenarioId::Orbit,
            ScenarioId::Zigzag,
            ScenarioId::HoverJitter,
            ScenarioId::DenseGrid,
            ScenarioId::FlakyNetwork,
            ScenarioId::CacheChurn,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::StraightDash => "straight_dash",
            ScenarioId::RightAngle => "right_angle",
            ScenarioId::Orbit => "orbit",
            ScenarioId::Zigzag => "zigzag",
            ScenarioId::HoverJitter => "hover_jitter",
            ScenarioId::DenseGrid => "dense_grid",
            ScenarioId::FlakyNetwork => "flaky_network",
            ScenarioId::CacheChurn => "cache_churn",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::StraightDash => "600px/s sweep over six cards, decoys above and below",
            ScenarioId::RightAngle => "450px/s sweep with a 90° turn into a column of cards",
            ScenarioId::Orbit => "300px/s circle over a ring of eight cards",
            ScenarioId::Zigzag => "300px/s zigzag with a card on every leg",
            ScenarioId::HoverJitter => "Idle pointer with tremor between four cards, nothing should load",
            ScenarioId::DenseGrid => "450px/s diagonal pass over a 12x8 grid of cells",
            ScenarioId::FlakyNetwork => "Dense grid pass, 40% of fetches fail, failures are never retried",
            ScenarioId::CacheChurn => "Raster scan with an 8-entry cache and 2s entry lifetime",
        }
    }

    /// Builds the scenario's world.
    pub fn setup(&self) -> ScenarioSetup {
        match self {
            ScenarioId::StraightDash => straight_dash(),
            ScenarioId::RightAngle => right_angle(),
            ScenarioId::Orbit => orbit(),
            ScenarioId::Zigzag => zigzag(),
            ScenarioId::HoverJitter => hover_jitter(),
            ScenarioId::DenseGrid => dense_grid(),
            ScenarioId::FlakyNetwork => flaky_network(),
            ScenarioId::CacheChurn => cache_churn(),
        }
    }
}

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "straight_dash" | "straightdash" | "sim-001" => Ok(ScenarioId::StraightDash),
            "right_angle" | "rightangle" | "sim-002" => Ok(ScenarioId::RightAngle),
            "orbit" | "sim-003" => Ok(ScenarioId::Orbit),
            "zigzag" | "sim-004" => Ok(ScenarioId::Zigzag),
            "hover_jitter" | "hoverjitter" | "sim-005" => Ok(ScenarioId::HoverJitter),
            "dense_grid" | "densegrid" | "sim-006" => Ok(ScenarioId::DenseGrid),
            "flaky_network" | "flakynetwork" | "sim-007" => Ok(ScenarioId::FlakyNetwork),
            "cache_churn" | "cachechurn" | "sim-008" => Ok(ScenarioId::CacheChurn),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

// =============================================================================
// SETUP
// =============================================================================

/// Everything the runner needs to play one scenario.
#[derive(Debug, Clone)]
pub struct ScenarioSetup {
    pub motion: Motion,

    /// Standard deviation of sample noise (px)
    pub sample_noise: f64,

    pub regions: Vec<Region>,
    pub network: NetworkProfile,

    /// Overrides for the cache, applied on top of the run's config
    pub cache_size: Option<usize>,
    pub cache_max_age_ms: Option<u64>,
    pub maintenance_interval_ms: Option<u64>,

    pub criteria: Criteria,
}

impl ScenarioSetup {
    fn new(motion: Motion, regions: Vec<Region>, criteria: Criteria) -> Self {
        Self {
            motion,
            sample_noise: 1.5,
            regions,
            network: NetworkProfile::default(),
            cache_size: None,
            cache_max_age_ms: None,
            maintenance_interval_ms: None,
            criteria,
        }
    }

    /// Applies the scenario's overrides to `config`.
    pub fn configure(&self, config: &mut EngineConfig) {
        if let Some(cache_size) = self.cache_size {
            config.prefetch.cache_size = cache_size;
        }
        if let Some(max_age) = self.cache_max_age_ms {
            config.prefetch.cache_max_age_ms = max_age;
        }
        if let Some(interval) = self.maintenance_interval_ms {
            config.prefetch.maintenance_interval_ms = interval;
        }
    }
}

/// Acceptance criteria. Unset fields are not checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Criteria {
    /// Upper bound on prediction RMSE at the horizon (px)
    pub max_rmse: Option<f64>,

    /// Lower bound on the prefetch hit rate (percent)
    pub min_hit_rate: Option<f64>,

    /// Upper bound on fetches started over the run
    pub max_fetches: Option<u64>,

    /// At least one fetch must fail
    pub expect_failures: bool,

    /// At least one cache entry must be evicted
    pub expect_evictions: bool,
}

// =============================================================================
// LAYOUTS
// =============================================================================

fn card(index: u64, x: f64, y: f64, key: String) -> Region {
    Region::new(RegionId::from_index(index), x, y, 80.0, 80.0, key)
}

/// 12x8 grid of 80x60 cells at a 100x90 pitch.
fn grid(prefix: &str) -> Vec<Region> {
    (0..8u64)
        .flat_map(|row| (0..12u64).map(move |col| (row, col)))
        .map(|(row, col)| {
            Region::new(
                RegionId::from_index(row * 12 + col),
                20.0 + col as f64 * 100.0,
                20.0 + row as f64 * 90.0,
                80.0,
                60.0,
                format!("/{prefix}/{row}/{col}"),
            )
        })
        .collect()
}

fn straight_dash() -> ScenarioSetup {
    let mut regions: Vec<Region> = (0..6u64)
        .map(|i| card(i, 260.0 + i as f64 * 160.0, 320.0, format!("/cards/{i}")))
        .collect();
    regions.extend((0..6u64).flat_map(|i| {
        let x = 260.0 + i as f64 * 160.0;
        [
            card(100 + i, x, 80.0, format!("/decoys/top/{i}")),
            card(200 + i, x, 560.0, format!("/decoys/bottom/{i}")),
        ]
    }));

    ScenarioSetup::new(
        Motion::Path {
            waypoints: vec![Point2::new(100.0, 360.0), Point2::new(1180.0, 360.0)],
            speed: 600.0,
        },
        regions,
        Criteria {
            max_rmse: Some(80.0),
            min_hit_rate: Some(50.0),
            ..Criteria::default()
        },
    )
}

fn right_angle() -> ScenarioSetup {
    let mut regions: Vec<Region> = (0..4u64)
        .map(|i| card(i, 200.0 + i as f64 * 150.0, 120.0, format!("/row/{i}")))
        .collect();
    regions.extend((0..3u64).map(|i| card(10 + i, 760.0, 240.0 + i as f64 * 130.0, format!("/column/{i}"))));

    ScenarioSetup::new(
        Motion::Path {
            waypoints: vec![Point2::new(120.0, 160.0), Point2::new(800.0, 160.0), Point2::new(800.0, 640.0)],
            speed: 450.0,
        },
        regions,
        Criteria {
            max_rmse: Some(100.0),
            min_hit_rate: Some(40.0),
            ..Criteria::default()
        },
    )
}

fn orbit() -> ScenarioSetup {
    let center = Point2::new(640.0, 360.0);
    let radius = 200.0;
    let regions = (0..8u64)
        .map(|i| {
            let angle = i as f64 * FRAC_PI_4 + FRAC_PI_4 / 2.0;
            card(
                i,
                center.x + radius * angle.cos() - 40.0,
                center.y + radius * angle.sin() - 40.0,
                format!("/ring/{i}"),
            )
        })
        .collect();

    ScenarioSetup::new(
        Motion::Orbit {
            center,
            radius,
            angular_speed: 1.5,
        },
        regions,
        Criteria {
            max_rmse: Some(70.0),
            min_hit_rate: Some(40.0),
            ..Criteria::default()
        },
    )
}

fn zigzag() -> ScenarioSetup {
    let waypoints: Vec<Point2<f64>> = (0..6)
        .map(|i| Point2::new(100.0 + i as f64 * 200.0, if i % 2 == 0 { 200.0 } else { 520.0 }))
        .collect();
    let regions = waypoints
        .windows(2)
        .enumerate()
        .map(|(i, leg)| {
            let mid = nalgebra::center(&leg[0], &leg[1]);
            card(i as u64, mid.x - 40.0, mid.y - 40.0, format!("/legs/{i}"))
        })
        .collect();

    ScenarioSetup::new(
        Motion::Path { waypoints, speed: 300.0 },
        regions,
        Criteria {
            max_rmse: Some(100.0),
            min_hit_rate: Some(30.0),
            ..Criteria::default()
        },
    )
}

fn hover_jitter() -> ScenarioSetup {
    let regions = vec![
        card(0, 720.0, 320.0, "/hover/east".to_string()),
        card(1, 480.0, 320.0, "/hover/west".to_string()),
        card(2, 600.0, 200.0, "/hover/north".to_string()),
        card(3, 600.0, 440.0, "/hover/south".to_string()),
    ];

    ScenarioSetup {
        sample_noise: 2.0,
        ..ScenarioSetup::new(
            Motion::Hover {
                center: Point2::new(640.0, 360.0),
                amplitude: 4.0,
                step: 1.5,
            },
            regions,
            Criteria {
                max_rmse: Some(25.0),
                max_fetches: Some(3),
                ..Criteria::default()
            },
        )
    }
}

fn diagonal() -> Motion {
    Motion::Path {
        waypoints: vec![Point2::new(100.0, 100.0), Point2::new(1180.0, 620.0)],
        speed: 450.0,
    }
}

fn dense_grid() -> ScenarioSetup {
    ScenarioSetup::new(
        diagonal(),
        grid("grid"),
        Criteria {
            max_rmse: Some(70.0),
            min_hit_rate: Some(25.0),
            ..Criteria::default()
        },
    )
}

fn flaky_network() -> ScenarioSetup {
    ScenarioSetup {
        network: NetworkProfile {
            base_latency_ms: 80,
            jitter_ms: 80,
            failure_rate: 0.4,
        },
        // Large enough that no failed entry is ever evicted and refetched
        cache_size: Some(200),
        ..ScenarioSetup::new(
            diagonal(),
            grid("flaky"),
            Criteria {
                max_rmse: Some(70.0),
                expect_failures: true,
                ..Criteria::default()
            },
        )
    }
}

fn cache_churn() -> ScenarioSetup {
    // Boustrophedon over rows 1, 3 and 5 of the grid
    let rows = [140.0, 320.0, 500.0];
    let waypoints = rows
        .iter()
        .enumerate()
        .flat_map(|(i, &y)| {
            let (from, to) = if i % 2 == 0 { (60.0, 1220.0) } else { (1220.0, 60.0) };
            [Point2::new(from, y), Point2::new(to, y)]
        })
        .collect();

    ScenarioSetup {
        cache_size: Some(8),
        cache_max_age_ms: Some(2000),
        maintenance_interval_ms: Some(500),
        ..ScenarioSetup::new(
            Motion::Path { waypoints, speed: 300.0 },
            grid("churn"),
            Criteria {
                expect_evictions: true,
                ..Criteria::default()
            },
        )
    }
}
