//! Configuration models for paperpipe.
//!
//! All runtime-tunable parameters live here and load from a TOML file.
//! API keys resolve from the config or from environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level configuration for paperpipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Pipeline-wide settings (batching, checkpointing, output)
    pub pipeline: PipelineConfig,

    /// Fallback chain settings (thresholds, budgets, timeouts)
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Item sources, processed sequentially in listed order
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Extraction backends, tried in ascending priority order
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// HTTP endpoints referenced by local/paid backends
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,
}

/// Pipeline-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Name used for the checkpoint directory tree
    #[serde(default = "default_pipeline_name")]
    pub name: String,

    /// Root directory for checkpoint state
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,

    /// Path for the final merged output
    pub output: PathBuf,

    /// Items per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Max items processed concurrently within a batch
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,

    /// Minutes between periodic checkpoints; 0 disables periodic saves
    /// (forced checkpoints on error or interrupt still apply)
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_mins: u64,
}

fn default_pipeline_name() -> String {
    "paperpipe".to_string()
}

fn default_state_root() -> PathBuf {
    PathBuf::from(".paperpipe/state")
}

fn default_batch_size() -> usize {
    25
}

fn default_batch_concurrency() -> usize {
    8
}

fn default_checkpoint_interval() -> u64 {
    5
}

/// Fallback chain settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Minimum confidence for a result to be accepted
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Max spend per item across all attempted backends, in USD
    #[serde(default = "default_per_item_budget")]
    pub per_item_budget_usd: f64,

    /// Max spend for the whole run, in USD
    #[serde(default = "default_run_budget")]
    pub run_budget_usd: f64,

    /// Per-backend invocation timeout in seconds
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            per_item_budget_usd: default_per_item_budget(),
            run_budget_usd: default_run_budget(),
            backend_timeout_secs: default_backend_timeout(),
        }
    }
}

fn default_min_confidence() -> f64 {
    0.7
}

fn default_per_item_budget() -> f64 {
    0.25
}

fn default_run_budget() -> f64 {
    10.0
}

fn default_backend_timeout() -> u64 {
    60
}

/// One configured item source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source identifier (e.g. "arxiv", "neurips")
    pub id: String,

    /// Path to the source's JSONL corpus file
    pub path: PathBuf,
}

/// Kind of an extraction backend.
///
/// Kinds are declared cost metadata only; all backends are polymorphic
/// over the same `attempt` operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Structural parsing over already-collected metadata
    #[default]
    Free,
    /// Self-hosted engine reached over HTTP (e.g. local OCR)
    Local,
    /// Paid cloud vision service
    Paid,
}

/// One configured extraction backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend name (unique within the chain)
    pub name: String,

    /// Priority level; lowest is tried first, ties broken by listed order
    #[serde(default)]
    pub priority: u8,

    /// Backend kind
    #[serde(default)]
    pub kind: BackendKind,

    /// Declared cost per item in USD (0 for free/local)
    #[serde(default)]
    pub cost_per_item_usd: f64,

    /// Endpoint name for local/paid backends; references [endpoints.<name>]
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Extraction features requested from HTTP backends
    #[serde(default = "default_features")]
    pub features: Vec<String>,

    /// Payload fields inspected by the free structural backend
    #[serde(default = "default_metadata_fields")]
    pub fields: Vec<String>,
}

fn default_features() -> Vec<String> {
    vec!["text".to_string(), "affiliations".to_string()]
}

fn default_metadata_fields() -> Vec<String> {
    ["title", "authors", "abstract", "affiliations"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Configuration for one HTTP extraction endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL for the API (e.g. "http://localhost:8070" for local OCR)
    pub base_url: String,

    /// API key (optional; omit for local endpoints)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Custom headers; values may contain ${ENV_VAR} placeholders
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request timeout in seconds
    #[serde(default = "default_endpoint_timeout")]
    pub timeout_secs: u64,

    /// Maximum transport-level retries
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_endpoint_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: Box::new(e),
        })
    }

    /// Resolve the API key for an endpoint, if it needs one.
    ///
    /// Returns Ok(None) for endpoints without auth (valid for local OCR).
    pub fn resolve_endpoint_api_key(
        &self,
        endpoint_name: &str,
    ) -> Result<Option<String>, ConfigError> {
        let endpoint = self
            .endpoints
            .get(endpoint_name)
            .ok_or_else(|| ConfigError::EndpointNotFound(endpoint_name.to_string()))?;

        if let Some(key) = &endpoint.api_key {
            return Ok(Some(expand_env_vars(key)));
        }

        if let Some(env_var) = &endpoint.api_key_env {
            return match std::env::var(env_var) {
                Ok(key) => Ok(Some(key)),
                Err(_) => Err(ConfigError::MissingApiKey {
                    endpoint: endpoint_name.to_string(),
                    env_var: env_var.clone(),
                }),
            };
        }

        Ok(None)
    }

    /// Validate cross-references and value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one backend must be configured".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if !seen.insert(&backend.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend name '{}'",
                    backend.name
                )));
            }

            if backend.cost_per_item_usd < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "backend '{}' has negative cost",
                    backend.name
                )));
            }

            match backend.kind {
                BackendKind::Free => {}
                BackendKind::Local | BackendKind::Paid => {
                    let endpoint = backend.endpoint.as_deref().ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "backend '{}' needs an endpoint reference",
                            backend.name
                        ))
                    })?;
                    if !self.endpoints.contains_key(endpoint) {
                        return Err(ConfigError::EndpointNotFound(endpoint.to_string()));
                    }
                }
            }
        }

        let mut seen_sources = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen_sources.insert(&source.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.extraction.min_confidence) {
            return Err(ConfigError::Invalid(
                "min_confidence must be in [0, 1]".to_string(),
            ));
        }
        if self.extraction.per_item_budget_usd < 0.0 || self.extraction.run_budget_usd < 0.0 {
            return Err(ConfigError::Invalid(
                "budgets must be non-negative".to_string(),
            ));
        }
        if self.pipeline.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch_size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax. Unset variables are left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Expand environment variables in all header values.
pub fn expand_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },

    #[error(
        "Missing API key for endpoint '{endpoint}': set {env_var} env var or api_key in config"
    )]
    MissingApiKey { endpoint: String, env_var: String },

    #[error("Endpoint not found: '{0}' (referenced by a backend but not configured in [endpoints.*])")]
    EndpointNotFound(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        toml::from_str(
            r#"
            [pipeline]
            output = "out/enriched.json"

            [[sources]]
            id = "arxiv"
            path = "data/arxiv.jsonl"

            [[backends]]
            name = "metadata"
            priority = 0

            [[backends]]
            name = "cloud-a"
            priority = 2
            kind = "paid"
            cost_per_item_usd = 0.04
            endpoint = "cloud-a"

            [endpoints.cloud-a]
            base_url = "https://vision.example.com"
            api_key = "sk-test"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn parses_and_validates() {
        let config = sample_config();
        assert_eq!(config.pipeline.batch_size, 25);
        assert_eq!(config.extraction.min_confidence, 0.7);
        assert_eq!(config.backends.len(), 2);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_missing_endpoint() {
        let mut config = sample_config();
        config.backends[1].endpoint = Some("nope".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EndpointNotFound(_))
        ));
    }

    #[test]
    fn rejects_duplicate_backend_names() {
        let mut config = sample_config();
        config.backends[1].name = "metadata".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn expands_env_vars() {
        std::env::set_var("PAPERPIPE_TEST_TOKEN", "abc123");
        assert_eq!(
            expand_env_vars("Bearer ${PAPERPIPE_TEST_TOKEN}"),
            "Bearer abc123"
        );
        assert_eq!(expand_env_vars("${PAPERPIPE_UNSET_VAR}"), "${PAPERPIPE_UNSET_VAR}");
    }
}
