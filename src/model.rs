use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{GenerationError, ModelError};
use crate::keys::KeyPool;

/// One request/response exchange with a text model.
#[async_trait]
pub trait ModelApi: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &str, api_key: &str) -> Result<String, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    /// Delay before attempt `n + 1` is `base_delay * n`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawModelResponse {
    pub text: String,
    pub model: String,
}

#[derive(Clone)]
pub struct ModelClient {
    api: Arc<dyn ModelApi>,
    keys: Arc<KeyPool>,
    retry: RetryPolicy,
}

impl ModelClient {
    pub fn new(api: Arc<dyn ModelApi>, keys: Arc<KeyPool>) -> Self {
        Self {
            api,
            keys,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model_name(&self) -> &str {
        self.api.model_name()
    }

    pub fn keys(&self) -> &Arc<KeyPool> {
        &self.keys
    }

    /// Sends `prompt`, leasing a fresh key for every attempt.
    ///
    /// Rate-limit, auth and transient failures rotate to another key until the
    /// attempt ceiling is hit. A malformed body is returned immediately since
    /// another key would not change it. `PoolExhausted` propagates as-is.
    pub async fn generate(&self, prompt: &str) -> Result<RawModelResponse, GenerationError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last_error = ModelError::Transient("no attempt made".to_owned());

        for attempt in 1..=attempts {
            let lease = self.keys.acquire().await?;
            tracing::debug!(attempt, attempts, key = %lease.masked(), "model call");

            match self.api.complete(prompt, lease.api_key()).await {
                Ok(text) => {
                    self.keys.report_success(&lease).await;
                    return Ok(RawModelResponse {
                        text,
                        model: self.api.model_name().to_owned(),
                    });
                }
                Err(err @ ModelError::Malformed(_)) => {
                    self.keys.report_success(&lease).await;
                    return Err(err.into());
                }
                Err(err) => {
                    let health = self.keys.report_failure(&lease, err.kind()).await;
                    tracing::warn!(
                        attempt,
                        attempts,
                        key = %lease.masked(),
                        ?health,
                        error = %err,
                        "model call failed"
                    );
                    last_error = err;
                }
            }

            if attempt < attempts {
                let factor = u32::try_from(attempt).unwrap_or(u32::MAX);
                tokio::time::sleep(self.retry.base_delay.saturating_mul(factor)).await;
            }
        }

        Err(GenerationError::GenerationFailed {
            attempts,
            last_error,
        })
    }
}
