// =============================================================================
// Crash-recoverable ingestion pipeline (spec.md §4.G)
// =============================================================================

pub mod pipeline;

pub use pipeline::{IngestionPhase, IngestionPipeline};
