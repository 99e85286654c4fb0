//! Batch orchestration over configured sources.

mod orchestrator;
mod source;

pub use orchestrator::{BatchOrchestrator, OrchestratorOptions};
pub use source::{ItemSource, JsonlSource, VecSource};
