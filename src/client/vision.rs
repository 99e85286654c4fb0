//! Generic client for document-extraction HTTP endpoints.
//!
//! Covers both paid cloud vision services and self-hosted engines behind
//! the same request shape; endpoints differ only in base URL, auth, and
//! declared cost. Retry and backoff live here, at the transport level;
//! the chain executor only ever sees "returned or raised".

use crate::models::{PipelineError, Result, VisionApiError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Extraction request payload.
#[derive(Debug, Serialize)]
struct ExtractRequest<'a> {
    document_id: &'a str,
    source: &'a str,
    payload: &'a serde_json::Value,
    features: &'a [String],
}

/// Extraction response payload.
#[derive(Debug, Deserialize)]
struct ExtractResponse {
    fields: serde_json::Value,
    confidence: f64,
    #[serde(default)]
    model: Option<String>,
}

/// API error response body.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Result of one extraction call.
#[derive(Debug, Clone)]
pub struct VisionExtraction {
    /// Extracted fields
    pub fields: serde_json::Value,
    /// Endpoint-reported confidence in [0, 1]
    pub confidence: f64,
    /// Model/engine identifier reported by the endpoint, if any
    pub model: Option<String>,
    /// Request duration
    pub duration: Duration,
}

/// HTTP client for one extraction endpoint.
pub struct VisionClient {
    client: reqwest::Client,
    /// Endpoint name (for logging)
    name: String,
    /// API key (None for local endpoints without auth)
    api_key: Option<String>,
    /// Base URL for the API
    base_url: String,
    /// Custom headers to include in requests
    custom_headers: HashMap<String, String>,
    /// Request timeout
    timeout: Duration,
    /// Maximum retries on transient failure
    max_retries: u32,
    /// Requests issued (including retries)
    total_requests: AtomicU64,
}

impl VisionClient {
    pub fn new(
        name: String,
        api_key: Option<String>,
        base_url: String,
        custom_headers: HashMap<String, String>,
        timeout_secs: u64,
        max_retries: u32,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(PipelineError::Network)?;

        Ok(Self {
            client,
            name,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            custom_headers,
            timeout,
            max_retries: max_retries.max(1),
            total_requests: AtomicU64::new(0),
        })
    }

    /// Endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests issued so far, including retries.
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Some(ref api_key) = self.api_key {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        for (key, value) in &self.custom_headers {
            if let (Ok(name), Ok(val)) = (
                HeaderName::try_from(key.as_str()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, val);
            }
        }

        headers
    }

    /// Run document extraction for one item.
    pub async fn extract(
        &self,
        document_id: &str,
        source: &str,
        payload: &serde_json::Value,
        features: &[String],
    ) -> Result<VisionExtraction> {
        let start = Instant::now();
        let request = ExtractRequest {
            document_id,
            source,
            payload,
            features,
        };

        let url = format!("{}/v1/extract", self.base_url);
        let mut last_error: Option<PipelineError> = None;

        for attempt in 0..self.max_retries {
            self.total_requests.fetch_add(1, Ordering::Relaxed);

            let response = self
                .client
                .post(&url)
                .headers(self.headers())
                .json(&request)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(if e.is_timeout() {
                        PipelineError::Timeout(self.timeout)
                    } else {
                        PipelineError::Network(e)
                    });
                    if attempt < self.max_retries - 1 {
                        let backoff = Duration::from_secs(2u64.pow(attempt));
                        debug!(
                            endpoint = %self.name,
                            attempt = attempt,
                            backoff_secs = backoff.as_secs(),
                            "Retrying after network error"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    continue;
                }
            };

            let status = response.status().as_u16();

            if status == 429 {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(1.0);

                last_error = Some(PipelineError::VisionApi(VisionApiError::RateLimited {
                    retry_after_secs: retry_after,
                }));

                if attempt < self.max_retries - 1 {
                    debug!(
                        endpoint = %self.name,
                        attempt = attempt,
                        retry_after_secs = retry_after,
                        "Rate limited, waiting"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(retry_after)).await;
                }
                continue;
            }

            if !response.status().is_success() {
                let error_body = response.text().await.unwrap_or_default();
                let error = if status == 401 {
                    VisionApiError::AuthenticationFailed
                } else if status == 404 || status == 422 {
                    VisionApiError::DocumentRejected(document_id.to_string())
                } else if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(&error_body)
                {
                    VisionApiError::ApiError {
                        status,
                        message: api_error.error.message,
                    }
                } else {
                    VisionApiError::ApiError {
                        status,
                        message: error_body,
                    }
                };

                last_error = Some(PipelineError::VisionApi(error));

                // Auth failures and rejected documents won't change on retry
                if status == 401 || status == 404 || status == 422 {
                    break;
                }

                if attempt < self.max_retries - 1 {
                    let backoff = Duration::from_secs(2u64.pow(attempt));
                    tokio::time::sleep(backoff).await;
                }
                continue;
            }

            let body: ExtractResponse = response.json().await.map_err(|e| {
                PipelineError::VisionApi(VisionApiError::InvalidResponse(format!(
                    "failed to parse response: {e}"
                )))
            })?;

            if !(0.0..=1.0).contains(&body.confidence) {
                return Err(PipelineError::VisionApi(VisionApiError::InvalidResponse(
                    format!("confidence out of range: {}", body.confidence),
                )));
            }

            return Ok(VisionExtraction {
                fields: body.fields,
                confidence: body.confidence,
                model: body.model,
                duration: start.elapsed(),
            });
        }

        Err(last_error.unwrap_or_else(|| {
            PipelineError::VisionApi(VisionApiError::MaxRetriesExceeded {
                attempts: self.max_retries,
                last_error: "unknown error".to_string(),
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_slash_from_base_url() {
        let client = VisionClient::new(
            "cloud-a".to_string(),
            None,
            "https://vision.example.com/".to_string(),
            HashMap::new(),
            30,
            3,
        )
        .unwrap();
        assert_eq!(client.base_url, "https://vision.example.com");
    }

    #[test]
    fn max_retries_is_at_least_one() {
        let client = VisionClient::new(
            "cloud-a".to_string(),
            None,
            "https://vision.example.com".to_string(),
            HashMap::new(),
            30,
            0,
        )
        .unwrap();
        assert_eq!(client.max_retries, 1);
    }
}
