//! HTTP structured generation provider.
//!
//! Talks to a structured generation endpoint over JSON:
//! - `POST {base_url}/v1/generate` — structured results for an intent
//! - `POST {base_url}/v1/complete` — free text for the direct path
//!
//! Bearer-token auth. HTTP and transport failures map onto
//! [`ProviderError`] so the retry wrapper and fallback can react uniformly.

use std::time::Instant;

use async_trait::async_trait;
use loupe_core::error::ProviderError;
use loupe_core::generation::{
    GeneratedResult, GenerationMetadata, GenerationMethod, GenerationProvider, GenerationRequest,
    GenerationResponse,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A structured generation backend reached over HTTP.
pub struct HttpProvider {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        }
    }

    fn map_status(status: reqwest::StatusCode, body: &str) -> ProviderError {
        if status.as_u16() == 429 {
            return ProviderError::RateLimited {
                retry_after_secs: 30,
            };
        }
        ProviderError::ApiError {
            status_code: status.as_u16(),
            message: body.chars().take(500).collect(),
        }
    }

    fn map_transport(e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else if e.is_connect() {
            ProviderError::Unavailable(e.to_string())
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

// ── Wire types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ApiGenerateRequest<'a> {
    intent: &'a str,
    context: &'a str,
    count: usize,
    temperature: f32,
    model: &'a str,
}

#[derive(Deserialize)]
struct ApiGenerateResponse {
    results: Vec<ApiResult>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct ApiResult {
    content: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    attributes: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize)]
struct ApiCompleteRequest<'a> {
    prompt: &'a str,
    model: &'a str,
}

#[derive(Deserialize)]
struct ApiCompleteResponse {
    text: String,
}

#[async_trait]
impl GenerationProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        let started = Instant::now();
        let url = format!("{}/v1/generate", self.base_url);
        debug!(provider = %self.name, count = request.count, "Structured generation request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&ApiGenerateRequest {
                intent: request.intent.as_str(),
                context: &request.context,
                count: request.count,
                temperature: request.temperature,
                model: &self.model,
            })
            .send()
            .await
            .map_err(Self::map_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_status(status, &body));
        }

        let body: ApiGenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedOutput(e.to_string()))?;
        if body.results.is_empty() {
            return Err(ProviderError::MalformedOutput(
                "provider returned zero results".into(),
            ));
        }

        Ok(GenerationResponse {
            results: body
                .results
                .into_iter()
                .map(|r| GeneratedResult {
                    content: r.content,
                    confidence: r.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
                    attributes: r.attributes,
                })
                .collect(),
            metadata: GenerationMetadata {
                duration_ms: started.elapsed().as_millis() as u64,
                retries: 0,
                model_used: body.model.unwrap_or_else(|| self.model.clone()),
                generation_method: GenerationMethod::Structured,
            },
        })
    }

    async fn complete_text(&self, prompt: &str) -> Result<String, ProviderError> {
        let url = format!("{}/v1/complete", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&ApiCompleteRequest {
                prompt,
                model: &self.model,
            })
            .send()
            .await
            .map_err(Self::map_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_status(status, &body));
        }

        let body: ApiCompleteResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedOutput(e.to_string()))?;
        Ok(body.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let provider = HttpProvider::new("gen", "https://gen.example.com/", "key", "model-1");
        assert_eq!(provider.base_url, "https://gen.example.com");
    }

    #[test]
    fn rate_limit_status_maps_to_rate_limited() {
        let err = HttpProvider::map_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(err, ProviderError::RateLimited { .. }));
    }

    #[test]
    fn server_error_maps_to_api_error() {
        let err = HttpProvider::map_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "boom");
        match err {
            ProviderError::ApiError { status_code, message } => {
                assert_eq!(status_code, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("Expected ApiError, got: {other:?}"),
        }
    }

    #[test]
    fn response_parsing_defaults_confidence() {
        let json = r#"{"results":[{"content":"How might we simplify signup?"}]}"#;
        let parsed: ApiGenerateResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert!(parsed.results[0].confidence.is_none());
        assert!(parsed.model.is_none());
    }
}
