//! Foresight Deterministic Simulation Testing (DST) Harness
//!
//! This crate provides a controlled world in which the real Foresight engine
//! runs deterministically against scripted pointer motion.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: a virtual clock that only the runner advances
//! - **Network**: simulated fetches with seeded latency and failures
//! - **Randomness**: all entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ScenarioRunner                         │
//! │                                                              │
//! │  PointerOracle ──noisy Sample──► ForesightEngine             │
//! │  (ground truth)                       │                      │
//! │        │                              │ spawn                │
//! │        │                              ▼                      │
//! │        │                         SimFetcher ◄── SimContext   │
//! │        │                      (latency, faults)  (clock)     │
//! │        ▼                              │                      │
//! │  PredictionValidator ◄──cache status──┘                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use foresight_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42)
//!     .with_duration(8.0)
//!     .run(ScenarioId::StraightDash)?;
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod network;
mod oracle;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use exporter::{CacheFrame, CandidateFrame, Position, SimExport, SimFrame};
pub use network::{NetworkProfile, NetworkStats, SimFetcher};
pub use oracle::{Motion, PointerOracle};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, SimError};
