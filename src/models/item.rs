//! Core data types flowing through the pipeline.
//!
//! An `Item` goes in, one backend attempt at a time produces an
//! `ExtractionResult`, and exactly one `EnrichedItem` comes out per item.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of work: a paper record or a reference to a fetched PDF.
///
/// Immutable once created; the id is the dedup key across the whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Stable identifier (e.g. DOI, arXiv id, or corpus-assigned key)
    pub id: String,

    /// Identifier of the source this item came from
    pub source: String,

    /// Arbitrary payload: collected metadata or a file reference
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

/// Output of one backend invocation on one item.
///
/// Never mutated after creation. One item may accumulate several of these
/// (one per attempted backend); only the accepted one is retained
/// downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    /// Name of the backend that produced this result
    pub backend: String,

    /// Whether the backend produced usable output
    pub success: bool,

    /// Extracted payload (text, fields), if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    /// Confidence score in [0, 1]
    pub confidence: f64,

    /// Monetary cost incurred by this invocation, in USD
    pub cost_usd: f64,

    /// Wall-clock time spent in the backend
    pub elapsed_ms: u64,

    /// When the attempt happened
    pub attempted_at: DateTime<Utc>,

    /// Error message for failed attempts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtractionResult {
    /// Build a successful result.
    pub fn ok(
        backend: &str,
        payload: serde_json::Value,
        confidence: f64,
        cost_usd: f64,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            backend: backend.to_string(),
            success: true,
            payload: Some(payload),
            confidence: confidence.clamp(0.0, 1.0),
            cost_usd,
            elapsed_ms,
            attempted_at: Utc::now(),
            error: None,
        }
    }

    /// Build a failed result from a backend error or timeout.
    pub fn failed(backend: &str, error: impl Into<String>, cost_usd: f64, elapsed_ms: u64) -> Self {
        Self {
            backend: backend.to_string(),
            success: false,
            payload: None,
            confidence: 0.0,
            cost_usd,
            elapsed_ms,
            attempted_at: Utc::now(),
            error: Some(error.into()),
        }
    }
}

/// Terminal per-item outcome persisted to `items_output.json`.
///
/// Holds only the accepted (or best-effort) result; the full attempt list
/// stays transient inside the chain executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedItem {
    /// Id of the enriched item
    pub item_id: String,

    /// Source the item came from
    pub source: String,

    /// True when no backend met the acceptance threshold within budget.
    /// Still a valid result; flagged for optional manual review.
    pub low_confidence: bool,

    /// Number of backends attempted for this item
    pub attempts: u32,

    /// Total cost spent on this item across all attempts, in USD
    pub item_cost_usd: f64,

    /// The retained extraction result
    pub result: ExtractionResult,
}

/// Aggregate statistics for one pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub total_items: usize,
    pub accepted: usize,
    pub low_confidence: usize,
    pub failed: usize,
    pub batches_run: u64,
    pub batches_skipped: u64,
    pub total_cost_usd: f64,
    pub runtime_secs: f64,

    // Derived, filled in by finalize()
    pub acceptance_rate: f64,
    pub throughput_per_hour: f64,
}

impl RunStats {
    /// Compute derived rates. Call once all counters are final.
    pub fn finalize(&mut self) {
        if self.total_items > 0 {
            self.acceptance_rate = self.accepted as f64 / self.total_items as f64;
        }
        if self.runtime_secs > 0.0 {
            self.throughput_per_hour = self.total_items as f64 / (self.runtime_secs / 3600.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped() {
        let r = ExtractionResult::ok("grobid", serde_json::json!({}), 1.7, 0.0, 12);
        assert_eq!(r.confidence, 1.0);
        let r = ExtractionResult::ok("grobid", serde_json::json!({}), -0.2, 0.0, 12);
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn stats_finalize_rates() {
        let mut stats = RunStats {
            total_items: 40,
            accepted: 30,
            runtime_secs: 1800.0,
            ..Default::default()
        };
        stats.finalize();
        assert!((stats.acceptance_rate - 0.75).abs() < 1e-9);
        assert!((stats.throughput_per_hour - 80.0).abs() < 1e-9);
    }
}
