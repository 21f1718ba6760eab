//! `LlmBackend`: the opaque external collaborator consumed by Session and
//! the Task Manager's Review Agent. The wire protocol of any concrete
//! provider is out of scope; this module defines only the contract and a
//! thin HTTP-based implementation of it.

pub mod error;
pub mod http_backend;

pub use error::{LlmError, LlmErrorKind};
pub use http_backend::HttpLlmBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub prompt: String,
    pub session_remote_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub usage: LlmUsage,
    pub remote_id: Option<String>,
}

/// Common interface for the LLM backend, matching teacher's
/// `LlmService` trait shape (`async_trait`, `Arc<dyn Trait>` object).
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn invoke(
        &self,
        request: LlmRequest,
        cancellation: tokio_util::sync::CancellationToken,
    ) -> Result<LlmResponse, LlmError>;

    async fn summarize(&self, log_excerpt: &str) -> Result<String, LlmError>;
}

/// Logging wrapper, matching teacher's `LoggingService` pattern: every
/// component reaches the backend through this so request/response
/// telemetry is structured and uniform regardless of which backend is
/// actually configured.
pub struct LoggingBackend {
    inner: std::sync::Arc<dyn LlmBackend>,
}

impl LoggingBackend {
    pub fn new(inner: std::sync::Arc<dyn LlmBackend>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl LlmBackend for LoggingBackend {
    async fn invoke(
        &self,
        request: LlmRequest,
        cancellation: tokio_util::sync::CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.invoke(request, cancellation).await;
        let duration = start.elapsed();
        match &result {
            Ok(response) => tracing::info!(
                duration_ms = %duration.as_millis(),
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                "llm invoke completed"
            ),
            Err(e) => tracing::warn!(
                duration_ms = %duration.as_millis(),
                kind = ?e.kind,
                error = %e.message,
                "llm invoke failed"
            ),
        }
        result
    }

    async fn summarize(&self, log_excerpt: &str) -> Result<String, LlmError> {
        self.inner.summarize(log_excerpt).await
    }
}
