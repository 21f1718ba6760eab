//! Concrete `LlmBackend` that speaks to whatever HTTP endpoint is
//! configured via `llm_backend_endpoint`. The wire format of that endpoint
//! is an external collaborator's concern (§6's Non-goal on the provider
//! wire protocol) — this backend sends a minimal JSON envelope and expects
//! one back, the way teacher's `AnthropicService` sends a translated
//! request and parses a translated response, without this crate needing to
//! know which provider sits behind the endpoint.

use super::{LlmBackend, LlmError, LlmRequest, LlmResponse, LlmUsage};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub struct HttpLlmBackend {
    client: Client,
    endpoint: String,
}

impl HttpLlmBackend {
    pub fn new(endpoint: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .expect("failed to build reqwest client");
        Self { client, endpoint }
    }
}

#[derive(Serialize)]
struct InvokeWire<'a> {
    prompt: &'a str,
    session_remote_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct InvokeResponseWire {
    text: String,
    #[serde(default)]
    usage: LlmUsage,
    remote_id: Option<String>,
}

#[derive(Serialize)]
struct SummarizeWire<'a> {
    log_excerpt: &'a str,
}

#[derive(Deserialize)]
struct SummarizeResponseWire {
    text: String,
}

#[async_trait]
impl LlmBackend for HttpLlmBackend {
    async fn invoke(
        &self,
        request: LlmRequest,
        cancellation: tokio_util::sync::CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        let wire = InvokeWire {
            prompt: &request.prompt,
            session_remote_id: request.session_remote_id.as_deref(),
        };

        let send = self
            .client
            .post(format!("{}/invoke", self.endpoint))
            .json(&wire)
            .send();

        let response = tokio::select! {
            result = send => result.map_err(|e| LlmError::transport(e.to_string()))?,
            () = cancellation.cancelled() => {
                return Err(LlmError::transport("invocation cancelled"));
            }
        };

        match response.status() {
            StatusCode::OK => {
                let body: InvokeResponseWire = response
                    .json()
                    .await
                    .map_err(|e| LlmError::transport(e.to_string()))?;
                Ok(LlmResponse {
                    text: body.text,
                    usage: body.usage,
                    remote_id: body.remote_id,
                })
            }
            StatusCode::TOO_MANY_REQUESTS => Err(LlmError::rate_limit("backend rate limited")),
            StatusCode::GONE | StatusCode::NOT_FOUND if request.session_remote_id.is_some() => {
                Err(LlmError::remote_unknown("backend no longer recognizes session"))
            }
            StatusCode::BAD_REQUEST => Err(LlmError::invalid_request("backend rejected request")),
            status => Err(LlmError::transport(format!("backend returned {status}"))),
        }
    }

    async fn summarize(&self, log_excerpt: &str) -> Result<String, LlmError> {
        let wire = SummarizeWire { log_excerpt };
        let response = self
            .client
            .post(format!("{}/summarize", self.endpoint))
            .json(&wire)
            .send()
            .await
            .map_err(|e| LlmError::transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::transport(format!(
                "summarize returned {}",
                response.status()
            )));
        }
        let body: SummarizeResponseWire = response
            .json()
            .await
            .map_err(|e| LlmError::transport(e.to_string()))?;
        Ok(body.text)
    }
}
