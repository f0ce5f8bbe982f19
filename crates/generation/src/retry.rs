//! Retry wrapper — per-attempt timeout, bounded retries, exponential
//! backoff.
//!
//! Exhausting the retry budget returns the last error so the caller can
//! trigger the fallback path; a provider failure is never surfaced raw.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loupe_core::error::ProviderError;
use loupe_core::generation::{GenerationProvider, GenerationRequest, GenerationResponse};
use loupe_core::policy::RetryPolicy;
use tracing::warn;

/// A provider that retries an inner provider with backoff.
pub struct RetryingProvider {
    inner: Arc<dyn GenerationProvider>,
    policy: RetryPolicy,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn GenerationProvider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.policy.timeout_secs)
    }
}

#[async_trait]
impl GenerationProvider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        let mut last_error = ProviderError::Unavailable("no attempt made".into());

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.policy.backoff(attempt - 1)).await;
            }

            match tokio::time::timeout(self.timeout(), self.inner.generate(request.clone())).await
            {
                Ok(Ok(mut response)) => {
                    response.metadata.retries = attempt;
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    warn!(
                        provider = self.inner.name(),
                        attempt = attempt + 1,
                        max = self.policy.max_retries + 1,
                        error = %e,
                        "Structured generation attempt failed"
                    );
                    last_error = e;
                }
                Err(_) => {
                    warn!(
                        provider = self.inner.name(),
                        attempt = attempt + 1,
                        timeout_secs = self.policy.timeout_secs,
                        "Structured generation attempt timed out"
                    );
                    last_error = ProviderError::Timeout(format!(
                        "Provider '{}' timed out after {}s",
                        self.inner.name(),
                        self.policy.timeout_secs
                    ));
                }
            }
        }

        Err(last_error)
    }

    async fn complete_text(&self, prompt: &str) -> Result<String, ProviderError> {
        let mut last_error = ProviderError::Unavailable("no attempt made".into());

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.policy.backoff(attempt - 1)).await;
            }

            match tokio::time::timeout(self.timeout(), self.inner.complete_text(prompt)).await {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(e)) => {
                    warn!(
                        provider = self.inner.name(),
                        attempt = attempt + 1,
                        error = %e,
                        "Free-text completion attempt failed"
                    );
                    last_error = e;
                }
                Err(_) => {
                    last_error = ProviderError::Timeout(format!(
                        "Provider '{}' timed out after {}s",
                        self.inner.name(),
                        self.policy.timeout_secs
                    ));
                }
            }
        }

        Err(last_error)
    }
}
