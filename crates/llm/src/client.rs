use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{Generator, LlmError};

/// Parameters for one completion call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub system: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            temperature: 0.2,
            max_tokens: 1024,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// HTTP wrapper for Ollama's generate and embeddings endpoints.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    /// The timeout covers the slowest case: several observer tasks hitting
    /// the model server at once while a main response streams.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn payload(request: &GenerateRequest, stream: bool) -> serde_json::Value {
        let mut payload = json!({
            "model": request.model,
            "prompt": request.prompt,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": stream,
        });
        if let Some(ref system) = request.system {
            payload["system"] = json!(system);
        }
        payload
    }

    /// Fetch one embedding vector for `text`.
    ///
    /// Falls back to `fallback_model` once when the configured model is not
    /// installed (HTTP 404) so a missing pull degrades instead of failing
    /// every turn.
    pub async fn embed(
        &self,
        model: &str,
        fallback_model: Option<&str>,
        text: &str,
    ) -> Result<Vec<f32>, LlmError> {
        match self.call_embedding(model, text).await {
            Err(LlmError::Http { status: 404, .. }) if fallback_model.is_some() => {
                let fallback = fallback_model.unwrap_or_default();
                info!(model, fallback, "embedding model not installed, retrying with fallback");
                self.call_embedding(fallback, text).await
            }
            other => other,
        }
    }

    async fn call_embedding(&self, model: &str, text: &str) -> Result<Vec<f32>, LlmError> {
        let payload = json!({ "model": model, "prompt": text });
        let response = self
            .client
            .post(self.endpoint("/api/embeddings"))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = response.json().await?;
        if let Some(values) = body.get("embedding").and_then(|v| v.as_array()) {
            return collect_floats(values);
        }
        // Newer servers return a batched `embeddings` array.
        if let Some(first) = body
            .get("embeddings")
            .and_then(|v| v.as_array())
            .and_then(|rows| rows.first())
            .and_then(|v| v.as_array())
        {
            return collect_floats(first);
        }
        Err(LlmError::InvalidResponse(
            "embedding response carried no vector".to_string(),
        ))
    }

    /// List the model names the server has installed (`/api/tags`).
    pub async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let response = self.client.get(self.endpoint("/api/tags")).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = response.json().await?;
        let models = body
            .get("models")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("name").and_then(|n| n.as_str()))
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }
}

fn collect_floats(values: &[serde_json::Value]) -> Result<Vec<f32>, LlmError> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| LlmError::InvalidResponse("non-numeric embedding value".to_string()))
        })
        .collect()
}

#[async_trait]
impl Generator for OllamaClient {
    async fn generate(&self, request: GenerateRequest) -> Result<String, LlmError> {
        let payload = Self::payload(&request, false);
        let response = self
            .client
            .post(self.endpoint("/api/generate"))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = response.json().await?;
        let text = body
            .get("response")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LlmError::InvalidResponse("generate response missing text".to_string()))?;
        Ok(text.trim().to_string())
    }

    async fn generate_stream(
        &self,
        request: GenerateRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<String, LlmError> {
        let payload = Self::payload(&request, true);
        let mut response = self
            .client
            .post(self.endpoint("/api/generate"))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let mut full_response = String::new();
        // Chunks may split a JSON line; carry the partial tail between reads.
        let mut pending = String::new();

        while let Some(chunk) = response.chunk().await? {
            pending.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = pending.find('\n') {
                let line = pending[..newline].trim().to_string();
                pending.drain(..=newline);
                if line.is_empty() {
                    continue;
                }
                let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
                    continue;
                };
                if let Some(token) = value.get("response").and_then(|v| v.as_str()) {
                    if !token.is_empty() {
                        full_response.push_str(token);
                        let _ = tx.send(token.to_string()).await;
                    }
                }
                if value.get("done").and_then(|v| v.as_bool()).unwrap_or(false) {
                    debug!(chars = full_response.len(), "stream complete");
                    return Ok(full_response);
                }
            }
        }

        Ok(full_response)
    }
}
