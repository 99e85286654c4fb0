//! Free structural backend over already-collected metadata.
//!
//! Scores confidence by coverage: the fraction of configured fields that
//! are present and non-empty in the item payload.

use crate::backend::ExtractionBackend;
use crate::models::{BackendKind, ExtractionResult, Item, Result};
use async_trait::async_trait;
use std::time::Instant;

/// Extracts structured fields the collectors already captured, without
/// touching the network. First tier of most chains.
pub struct MetadataBackend {
    name: String,
    fields: Vec<String>,
}

impl MetadataBackend {
    pub fn new(name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    fn field_present(value: &serde_json::Value) -> bool {
        match value {
            serde_json::Value::Null => false,
            serde_json::Value::String(s) => !s.trim().is_empty(),
            serde_json::Value::Array(a) => !a.is_empty(),
            serde_json::Value::Object(o) => !o.is_empty(),
            _ => true,
        }
    }
}

#[async_trait]
impl ExtractionBackend for MetadataBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Free
    }

    async fn attempt(&self, item: &Item) -> Result<ExtractionResult> {
        let start = Instant::now();

        let mut extracted = serde_json::Map::new();
        if let serde_json::Value::Object(payload) = &item.payload {
            for field in &self.fields {
                if let Some(value) = payload.get(field) {
                    if Self::field_present(value) {
                        extracted.insert(field.clone(), value.clone());
                    }
                }
            }
        }

        let coverage = if self.fields.is_empty() {
            0.0
        } else {
            extracted.len() as f64 / self.fields.len() as f64
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        if extracted.is_empty() {
            return Ok(ExtractionResult::failed(
                &self.name,
                "no structured fields present in payload",
                0.0,
                elapsed_ms,
            ));
        }

        Ok(ExtractionResult::ok(
            &self.name,
            serde_json::Value::Object(extracted),
            coverage,
            0.0,
            elapsed_ms,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MetadataBackend {
        MetadataBackend::new(
            "metadata",
            vec![
                "title".to_string(),
                "authors".to_string(),
                "abstract".to_string(),
                "affiliations".to_string(),
            ],
        )
    }

    #[tokio::test]
    async fn confidence_equals_field_coverage() {
        let item = Item {
            id: "p1".to_string(),
            source: "arxiv".to_string(),
            payload: serde_json::json!({
                "title": "Scaling Laws",
                "authors": ["A. Author"],
                "abstract": "",
                "venue": "ignored",
            }),
        };

        let result = backend().attempt(&item).await.unwrap();
        assert!(result.success);
        assert!((result.confidence - 0.5).abs() < 1e-9);
        let payload = result.payload.unwrap();
        assert!(payload.get("title").is_some());
        assert!(payload.get("abstract").is_none());
    }

    #[tokio::test]
    async fn empty_payload_fails() {
        let item = Item {
            id: "p2".to_string(),
            source: "arxiv".to_string(),
            payload: serde_json::json!({}),
        };

        let result = backend().attempt(&item).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.confidence, 0.0);
    }
}
