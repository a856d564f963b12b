//! JSON exporter for offline inspection of a run.
//!
//! Exports simulation frames as plain JSON: pointer truth, the sample the
//! engine saw, its forecast, the scored candidates and the cache contents.

use foresight_core::{CacheStatus, EngineSnapshot, Sample};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// A point in screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl From<Point2<f64>> for Position {
    fn from(p: Point2<f64>) -> Self {
        Self { x: p.x, y: p.y }
    }
}

/// One scored candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateFrame {
    pub key: String,
    pub probability: f64,
    pub time_to_reach_ms: f64,
}

/// One cache slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheFrame {
    pub key: String,
    pub status: CacheStatus,
}

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in ms
    pub time_ms: f64,

    /// Where the pointer truly was
    pub pointer: Position,

    /// The noisy sample handed to the engine
    pub sample: Position,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate: Option<Position>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted: Option<Position>,

    pub candidates: Vec<CandidateFrame>,
    pub cache: Vec<CacheFrame>,
}

impl SimFrame {
    pub fn capture(time_ms: f64, pointer: Point2<f64>, sample: &Sample, snapshot: &EngineSnapshot) -> Self {
        Self {
            time_ms,
            pointer: pointer.into(),
            sample: Position {
                x: sample.x,
                y: sample.y,
            },
            estimate: snapshot.current_position.map(Position::from),
            predicted: snapshot.predicted_position.map(Position::from),
            candidates: snapshot
                .candidates
                .iter()
                .map(|c| CandidateFrame {
                    key: c.region.key.to_string(),
                    probability: c.probability,
                    time_to_reach_ms: c.time_to_reach,
                })
                .collect(),
            cache: snapshot
                .cache_entries
                .iter()
                .map(|e| CacheFrame {
                    key: e.key.to_string(),
                    status: e.status,
                })
                .collect(),
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_rmse: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit_rate: Option<f64>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            final_rmse: None,
            hit_rate: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_ms / 1000.0;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, rmse: Option<f64>, hit_rate: Option<f64>) {
        self.passed = passed;
        self.final_rmse = rmse;
        self.hit_rate = hit_rate;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_serializes_frames() {
        let mut export = SimExport::new("straight_dash", 42);
        export.add_frame(SimFrame {
            time_ms: 500.0,
            pointer: Position { x: 1.0, y: 2.0 },
            sample: Position { x: 1.5, y: 2.5 },
            estimate: None,
            predicted: Some(Position { x: 10.0, y: 2.0 }),
            candidates: vec![CandidateFrame {
                key: "/cards/0".to_string(),
                probability: 0.8,
                time_to_reach_ms: 120.0,
            }],
            cache: vec![CacheFrame {
                key: "/cards/0".to_string(),
                status: CacheStatus::Pending,
            }],
        });
        export.finalize(true, Some(12.5), None);

        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["scenario"], "straight_dash");
        assert_eq!(json["duration_sec"], 0.5);
        assert_eq!(json["frames"][0]["cache"][0]["status"], "Pending");
        assert!(json["frames"][0].get("estimate").is_none());
        assert!(json.get("hit_rate").is_none());
    }
}
