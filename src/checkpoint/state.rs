//! Session and per-source progress state.
//!
//! Invariants:
//! - Source transitions are monotonic: pending → in_progress →
//!   {completed | failed}; a completed source never re-enters
//!   in_progress without an explicit resume reset.
//! - `last_batch_index` only ever grows within a run; a resume reading
//!   index N may assume batches 0..=N are fully reflected in the output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status of one source within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// Not yet started
    Pending,
    /// Batches being processed
    InProgress,
    /// All batches done
    Completed,
    /// Aborted mid-source; terminal for this run only
    Failed,
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceStatus::Pending => write!(f, "pending"),
            SourceStatus::InProgress => write!(f, "in_progress"),
            SourceStatus::Completed => write!(f, "completed"),
            SourceStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-source progress within a session.
///
/// Mutated only by the batch orchestrator as batches complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceState {
    /// Source identifier
    pub id: String,

    /// Current status
    pub status: SourceStatus,

    /// Index of the last fully completed batch; None before the first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_batch_index: Option<u64>,

    /// Items accepted at or above the confidence threshold
    #[serde(default)]
    pub items_enriched: u64,

    /// Items that fell through the chain below threshold
    #[serde(default)]
    pub items_low_confidence: u64,

    /// Items where every attempt failed outright
    #[serde(default)]
    pub items_failed: u64,

    /// Last activity timestamp
    pub updated_at: DateTime<Utc>,
}

impl SourceState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: SourceStatus::Pending,
            last_batch_index: None,
            items_enriched: 0,
            items_low_confidence: 0,
            items_failed: 0,
            updated_at: Utc::now(),
        }
    }

    /// First batch index a (resumed) run should process.
    pub fn resume_index(&self) -> u64 {
        self.last_batch_index.map_or(0, |i| i + 1)
    }

    /// Number of batches a resume will skip.
    pub fn batches_done(&self) -> u64 {
        self.last_batch_index.map_or(0, |i| i + 1)
    }

    /// Record one completed batch and its item counts.
    pub fn record_batch(&mut self, index: u64, enriched: u64, low_confidence: u64, failed: u64) {
        self.last_batch_index = Some(index);
        self.items_enriched += enriched;
        self.items_low_confidence += low_confidence;
        self.items_failed += failed;
        self.updated_at = Utc::now();
    }
}

/// One logical run of the pipeline, stable across resumes.
///
/// This is the `checkpoint.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    /// Unique per run, stable across resumes of the same run
    pub session_id: String,

    /// Pipeline name (checkpoint directory component)
    pub pipeline: String,

    /// Human-readable reference to the input corpus
    pub input_reference: String,

    /// When the session was first created
    pub created_at: DateTime<Utc>,

    /// Last state mutation
    pub updated_at: DateTime<Utc>,

    /// Per-source progress, keyed by source id
    pub sources: BTreeMap<String, SourceState>,

    /// Cost spent across the whole session so far, in USD
    #[serde(default)]
    pub total_cost_usd: f64,
}

impl SessionState {
    /// Create a fresh session covering the given sources.
    pub fn new(
        pipeline: impl Into<String>,
        input_reference: impl Into<String>,
        source_ids: &[String],
    ) -> Self {
        let now = Utc::now();
        let sources = source_ids
            .iter()
            .map(|id| (id.clone(), SourceState::new(id.clone())))
            .collect();

        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            pipeline: pipeline.into(),
            input_reference: input_reference.into(),
            created_at: now,
            updated_at: now,
            sources,
            total_cost_usd: 0.0,
        }
    }

    /// Ensure a state entry exists for a source (new sources may appear
    /// in config between resumes).
    pub fn ensure_source(&mut self, id: &str) -> &mut SourceState {
        self.sources
            .entry(id.to_string())
            .or_insert_with(|| SourceState::new(id))
    }

    /// Move a source into in_progress.
    ///
    /// Completed sources are left untouched; callers skip them. A failed
    /// source re-enters in_progress, which is the explicit resume reset.
    pub fn begin_source(&mut self, id: &str) {
        let source = self.ensure_source(id);
        if source.status != SourceStatus::Completed {
            source.status = SourceStatus::InProgress;
            source.updated_at = Utc::now();
        }
        self.updated_at = Utc::now();
    }

    /// Mark a source terminal.
    pub fn finish_source(&mut self, id: &str, status: SourceStatus) {
        debug_assert!(matches!(
            status,
            SourceStatus::Completed | SourceStatus::Failed
        ));
        let source = self.ensure_source(id);
        source.status = status;
        source.updated_at = Utc::now();
        self.updated_at = Utc::now();
    }

    /// All sources completed.
    pub fn is_complete(&self) -> bool {
        !self.sources.is_empty()
            && self
                .sources
                .values()
                .all(|s| s.status == SourceStatus::Completed)
    }

    /// Aggregate item counts: (enriched, low_confidence, failed).
    pub fn item_counts(&self) -> (u64, u64, u64) {
        self.sources.values().fold((0, 0, 0), |acc, s| {
            (
                acc.0 + s.items_enriched,
                acc.1 + s.items_low_confidence,
                acc.2 + s.items_failed,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_index_starts_at_zero() {
        let state = SourceState::new("arxiv");
        assert_eq!(state.resume_index(), 0);
        assert_eq!(state.batches_done(), 0);
    }

    #[test]
    fn record_batch_advances_index() {
        let mut state = SourceState::new("arxiv");
        state.record_batch(0, 4, 1, 0);
        state.record_batch(1, 5, 0, 0);
        assert_eq!(state.last_batch_index, Some(1));
        assert_eq!(state.resume_index(), 2);
        assert_eq!(state.items_enriched, 9);
        assert_eq!(state.items_low_confidence, 1);
    }

    #[test]
    fn completed_source_is_not_restarted() {
        let mut session = SessionState::new("paperpipe", "test", &["arxiv".to_string()]);
        session.finish_source("arxiv", SourceStatus::Completed);
        session.begin_source("arxiv");
        assert_eq!(
            session.sources["arxiv"].status,
            SourceStatus::Completed
        );
    }

    #[test]
    fn failed_source_reenters_in_progress() {
        let mut session = SessionState::new("paperpipe", "test", &["arxiv".to_string()]);
        session.begin_source("arxiv");
        session.finish_source("arxiv", SourceStatus::Failed);
        session.begin_source("arxiv");
        assert_eq!(
            session.sources["arxiv"].status,
            SourceStatus::InProgress
        );
    }

    #[test]
    fn complete_requires_every_source() {
        let mut session = SessionState::new(
            "paperpipe",
            "test",
            &["arxiv".to_string(), "neurips".to_string()],
        );
        session.finish_source("arxiv", SourceStatus::Completed);
        assert!(!session.is_complete());
        session.finish_source("neurips", SourceStatus::Completed);
        assert!(session.is_complete());
    }
}
