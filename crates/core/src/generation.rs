//! Generation provider trait — the abstraction over generative backends.
//!
//! A provider knows how to turn assembled context into structured results
//! (questions, solutions) or free text. Implementations live in
//! `loupe-generation`: an HTTP structured client, a retry/backoff wrapper,
//! and the local fallback path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::intent::Intent;

/// A structured generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// The intent driving generation (questions vs. solutions)
    pub intent: Intent,

    /// Rendered context the generation should be grounded in
    pub context: String,

    /// How many results the caller needs
    pub count: usize,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_temperature() -> f32 {
    0.7
}

/// One generated result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedResult {
    /// The generated text
    pub content: String,

    /// Provider or scorer confidence in [0, 1]
    pub confidence: f32,

    /// Secondary attributes (e.g. `related_metric` for solutions)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl GeneratedResult {
    pub fn new(content: impl Into<String>, confidence: f32) -> Self {
        Self {
            content: content.into(),
            confidence: confidence.clamp(0.0, 1.0),
            attributes: serde_json::Map::new(),
        }
    }
}

/// Which path produced a generation response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMethod {
    /// The structured external provider
    Structured,
    /// The locally-executed fallback path
    Fallback,
}

/// Processing metadata attached to every generation response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub duration_ms: u64,
    pub retries: u32,
    pub model_used: String,
    pub generation_method: GenerationMethod,
}

/// A complete generation response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub results: Vec<GeneratedResult>,
    pub metadata: GenerationMetadata,
}

/// The core generation provider trait.
///
/// `generate` is the structured path; `complete_text` is the direct
/// free-text path the fallback generator parses itself. A backend may
/// support either or both.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// A human-readable name for this provider (e.g., "structured-http").
    fn name(&self) -> &str;

    /// Structured generation: context in, typed results out.
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> std::result::Result<GenerationResponse, ProviderError>;

    /// Free-text completion for the direct/fallback path.
    ///
    /// Default implementation reports the capability as unavailable.
    async fn complete_text(&self, _prompt: &str) -> std::result::Result<String, ProviderError> {
        Err(ProviderError::Unavailable(format!(
            "Provider '{}' does not support free-text completion",
            self.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_result_clamps_confidence() {
        let r = GeneratedResult::new("How might we shorten onboarding?", 1.4);
        assert!((r.confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn request_default_temperature() {
        let json = r#"{"intent":"generate-questions","context":"ctx","count":3}"#;
        let req: GenerationRequest = serde_json::from_str(json).unwrap();
        assert!((req.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(req.count, 3);
    }

    #[test]
    fn method_serde_tags() {
        assert_eq!(
            serde_json::to_string(&GenerationMethod::Fallback).unwrap(),
            r#""fallback""#
        );
    }
}
