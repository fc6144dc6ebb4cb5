//! Recommendation services
//!
//! The request path runs candidates -> scoring -> cold start -> blending ->
//! diversity, coordinated by the orchestrator. Artifacts, features and
//! experiments are shared, read-mostly state behind it.

pub mod artifacts;
pub mod blending;
pub mod candidates;
pub mod cold_start;
pub mod diversity;
pub mod experiment;
pub mod features;
pub mod orchestrator;
pub mod outcome;
pub mod scoring;

pub use artifacts::{ArtifactStore, FsArtifactSource};
pub use blending::{BlendConfig, Blender};
pub use experiment::ExperimentRouter;
pub use features::{CatalogSnapshot, FeatureCache};
pub use orchestrator::RecommendationOrchestrator;
pub use outcome::{OutcomeRecorder, TracingOutcomeSink};
pub use scoring::ScorerSet;
