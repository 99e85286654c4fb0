//! Backend adapter over an HTTP extraction endpoint.

use crate::backend::ExtractionBackend;
use crate::client::VisionClient;
use crate::models::{BackendKind, ExtractionResult, Item, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Cloud vision or self-hosted extraction service as a chain backend.
///
/// The paid services and a local OCR engine are all instances of this
/// type; they differ only in endpoint configuration and declared cost.
pub struct CloudVisionBackend {
    name: String,
    kind: BackendKind,
    cost_per_item: f64,
    features: Vec<String>,
    client: Arc<VisionClient>,
}

impl CloudVisionBackend {
    pub fn new(
        name: impl Into<String>,
        kind: BackendKind,
        cost_per_item: f64,
        features: Vec<String>,
        client: Arc<VisionClient>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            cost_per_item,
            features,
            client,
        }
    }
}

#[async_trait]
impl ExtractionBackend for CloudVisionBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn cost_per_item(&self) -> f64 {
        self.cost_per_item
    }

    async fn attempt(&self, item: &Item) -> Result<ExtractionResult> {
        let extraction = self
            .client
            .extract(&item.id, &item.source, &item.payload, &self.features)
            .await?;

        Ok(ExtractionResult::ok(
            &self.name,
            extraction.fields,
            extraction.confidence,
            self.cost_per_item,
            extraction.duration.as_millis() as u64,
        ))
    }
}
