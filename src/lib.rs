//! paperpipe - resumable, cost-bounded enrichment for academic paper corpora.
//!
//! ## Architecture
//!
//! - **Fallback chain**: extraction backends tried in priority order per
//!   item, gated by confidence and a run-level cost ledger
//! - **Checkpoint manager**: atomic, checksum-validated snapshots of
//!   session progress, safe to interrupt at any point
//! - **Batch orchestrator**: pulls fixed-size batches per source, drives
//!   the chain, and resumes from the last completed batch
//!
//! Backends are polymorphic over one operation, `attempt(item)`;
//! free, local, and paid strategies differ only in declared cost
//! metadata. A run never exceeds its budget and never silently drops an
//! item: the worst case is a result tagged low confidence.

pub mod backend;
pub mod checkpoint;
pub mod client;
pub mod models;
pub mod pipeline;

// Re-exports for convenience
pub use backend::{
    registry_from_config, BackendRegistry, ChainConfig, CostLedger, ExtractionBackend,
    FallbackChain,
};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointManager, SessionState, SourceStatus};
pub use models::{
    Config, EnrichedItem, ExtractionResult, Item, PipelineError, Result, RunStats,
};
pub use pipeline::{BatchOrchestrator, ItemSource, JsonlSource, OrchestratorOptions};
