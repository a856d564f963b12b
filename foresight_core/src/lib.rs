//! Foresight Core - Pointer motion prediction and speculative prefetch
//!
//! This library hides fetch latency by acting on where the pointer is
//! going rather than where it is:
//! 1. **Motion**: a particle filter turns noisy samples into a short-horizon position forecast
//! 2. **Space**: a quadtree narrows candidate regions to those along the predicted path
//! 3. **Hit**: a geometric model scores each candidate's probability and time-to-reach
//! 4. **Prefetch**: a scheduler turns the best scores into bounded, cancellable, cached fetches

pub mod engine_runtime;
pub mod error;
pub mod foresight_hit;
pub mod foresight_motion;
pub mod foresight_prefetch;
pub mod foresight_space;
pub mod sample_buffer;
pub mod validation;

// Re-export key types for convenience
pub use engine_runtime::{
    EngineConfig, EngineSnapshot, ForesightEngine, PointerSampleSource, RegionProvider, SampleStep,
};
pub use error::ConfigError;
pub use foresight_hit::{score, Candidate, HitScore};
pub use foresight_motion::{FilterConfig, FilterState, ParticleFilter, UpdateOutcome};
pub use foresight_prefetch::{CacheEntry, CacheStatus, PrefetchConfig, PrefetchScheduler};
pub use foresight_space::{viewport, Quadtree, QuadtreeConfig, Region, RegionId, SpatialIndex};
pub use sample_buffer::{Sample, SampleBuffer};
pub use validation::{PredictionValidator, ValidationReport};
