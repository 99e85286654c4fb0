//! Extraction backends and the fallback chain that drives them.
//!
//! A backend is one strategy for producing an `ExtractionResult` from an
//! `Item`. Free, local, and paid backends differ only in declared cost
//! metadata; all are polymorphic over the same `attempt` operation.

mod budget;
mod chain;
mod metadata;
mod registry;
mod vision;

pub use budget::CostLedger;
pub use chain::{ChainConfig, ChainOutcome, FallbackChain};
pub use metadata::MetadataBackend;
pub use registry::BackendRegistry;
pub use vision::CloudVisionBackend;

use crate::client::VisionClient;
use crate::models::{expand_headers, BackendKind, Config, ExtractionResult, Item, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Capability interface for a single extraction strategy.
///
/// Backends either return a result or raise; retry and backoff policy is
/// a backend implementation detail and never part of this contract.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    /// Backend name, unique within a registry.
    fn name(&self) -> &str;

    /// Declared kind (cost metadata only).
    fn kind(&self) -> BackendKind {
        BackendKind::Free
    }

    /// Declared cost per item in USD. Checked against the run budget
    /// before every invocation.
    fn cost_per_item(&self) -> f64 {
        0.0
    }

    /// Attempt extraction for one item.
    async fn attempt(&self, item: &Item) -> Result<ExtractionResult>;
}

/// Build the backend registry declared in the configuration.
///
/// Free backends parse collected metadata in-process; local and paid
/// backends share the HTTP client, one instance per endpoint.
pub fn registry_from_config(config: &Config) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    let mut clients: std::collections::HashMap<String, Arc<VisionClient>> =
        std::collections::HashMap::new();

    for spec in &config.backends {
        match spec.kind {
            BackendKind::Free => {
                registry.register(
                    spec.name.clone(),
                    Arc::new(MetadataBackend::new(spec.name.clone(), spec.fields.clone())),
                    spec.priority,
                );
            }
            BackendKind::Local | BackendKind::Paid => {
                let endpoint_name = spec.endpoint.as_deref().ok_or_else(|| {
                    crate::models::ConfigError::Invalid(format!(
                        "backend '{}' needs an endpoint reference",
                        spec.name
                    ))
                })?;

                let client = match clients.get(endpoint_name) {
                    Some(client) => Arc::clone(client),
                    None => {
                        let endpoint = config.endpoints.get(endpoint_name).ok_or_else(|| {
                            crate::models::ConfigError::EndpointNotFound(
                                endpoint_name.to_string(),
                            )
                        })?;
                        let api_key = config.resolve_endpoint_api_key(endpoint_name)?;
                        let client = Arc::new(VisionClient::new(
                            endpoint_name.to_string(),
                            api_key,
                            endpoint.base_url.clone(),
                            expand_headers(&endpoint.headers),
                            endpoint.timeout_secs,
                            endpoint.max_retries,
                        )?);
                        clients.insert(endpoint_name.to_string(), Arc::clone(&client));
                        client
                    }
                };

                registry.register(
                    spec.name.clone(),
                    Arc::new(CloudVisionBackend::new(
                        spec.name.clone(),
                        spec.kind,
                        spec.cost_per_item_usd,
                        spec.features.clone(),
                        client,
                    )),
                    spec.priority,
                );
            }
        }
    }

    Ok(registry)
}
