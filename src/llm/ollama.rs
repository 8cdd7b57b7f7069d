//! Ollama HTTP client
//!
//! Talks to a local Ollama-compatible server over `/api/generate`. Structured
//! calls request `format: "json"` and embed the schema in the prompt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{extract_json, LlmClient, LlmError, StructuredResult};

pub struct OllamaClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaClient {
    /// `endpoint` is the base URL, e.g. `http://localhost:11434`
    pub fn new(endpoint: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, format: Option<&str>) -> Result<String, LlmError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            format,
            options: GenerateOptions {
                temperature: 0.1,
                num_predict: 1024,
            },
        };

        let url = format!("{}/api/generate", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Provider(format!("HTTP request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(LlmError::Provider(format!(
                "API returned status: {}",
                response.status()
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Provider(format!("Failed to parse response: {e}")))?;

        Ok(body.response)
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn extract_structured(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        timeout: Duration,
    ) -> Result<StructuredResult, LlmError> {
        let full_prompt = format!(
            "{prompt}\n\nRespond with ONLY valid JSON matching this schema, no explanation:\n{schema}"
        );

        let raw = tokio::time::timeout(timeout, self.generate(&full_prompt, Some("json")))
            .await
            .map_err(|_| LlmError::Timeout(timeout))??;

        let json = extract_json(&raw)
            .ok_or_else(|| LlmError::InvalidOutput(format!("no JSON object in: {raw}")))?;
        let value = serde_json::from_str(json)
            .map_err(|e| LlmError::InvalidOutput(format!("{e}, raw: {raw}")))?;

        Ok(StructuredResult {
            value,
            model: self.model.clone(),
        })
    }

    async fn generate_text(&self, prompt: &str, timeout: Duration) -> Result<String, LlmError> {
        let text = tokio::time::timeout(timeout, self.generate(prompt, None))
            .await
            .map_err(|_| LlmError::Timeout(timeout))??;
        Ok(text.trim().to_string())
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trailing_slash_trimmed() {
        let client = OllamaClient::new("http://localhost:11434/", "qwen2.5:1.5b");
        assert_eq!(client.endpoint, "http://localhost:11434");
        assert_eq!(client.model(), "qwen2.5:1.5b");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_provider_error() {
        let client = OllamaClient::new("http://127.0.0.1:9", "none");
        let err = client
            .generate_text("hello", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Provider(_) | LlmError::Timeout(_)));
    }
}
