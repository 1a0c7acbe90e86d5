//! HTTP client for the generation backend.
//!
//! Thin wrapper over the backend's `/generate-text` endpoint. The backend
//! multiplexes the actual model call and reports failures as a
//! `{ success, text, message }` envelope, so errors are classified from the
//! HTTP status plus the message text.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::GenerationError;

use super::TextGenerator;

/// Default per-request timeout at the HTTP layer.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// Configuration for [`BackendClient`].
#[derive(Debug, Clone)]
pub struct BackendClientConfig {
    /// Base URL of the generation backend.
    pub base_url: String,
    /// Model identifier forwarded to the backend.
    pub model: String,
    /// HTTP timeout for a single request.
    pub request_timeout: Duration,
}

impl BackendClientConfig {
    /// Creates a configuration for the given backend URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: "gemini-2.0-flash".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Sets the model identifier.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the HTTP request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Request body for `/generate-text`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateTextRequest<'a> {
    api_key: &'a str,
    prompt: &'a str,
    model: &'a str,
}

/// Response envelope from `/generate-text`.
#[derive(Debug, Deserialize)]
struct GenerateTextResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Client for the generation backend.
pub struct BackendClient {
    config: BackendClientConfig,
    http_client: Client,
}

impl BackendClient {
    /// Creates a new client for the configured backend.
    pub fn new(config: BackendClientConfig) -> Self {
        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();

        Self {
            config,
            http_client,
        }
    }

    /// Creates a client with default settings for the given base URL.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self::new(BackendClientConfig::new(base_url))
    }

    async fn post_generate(
        &self,
        credential: &str,
        prompt: &str,
    ) -> Result<String, GenerationError> {
        let url = format!("{}/generate-text", self.config.base_url);
        let body = GenerateTextRequest {
            api_key: credential,
            prompt,
            model: &self.config.model,
        };

        debug!(url = %url, model = %self.config.model, "Sending generation request");

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::Timeout {
                        seconds: self.config.request_timeout.as_secs(),
                    }
                } else {
                    GenerationError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        let envelope: GenerateTextResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Network(format!("Malformed backend response: {}", e)))?;

        if !status.is_success() || !envelope.success {
            let message = envelope
                .message
                .unwrap_or_else(|| "Unknown backend error".to_string());
            return Err(GenerationError::from_message(status.as_u16(), &message));
        }

        match envelope.text {
            Some(text) if !text.trim().is_empty() => Ok(text),
            _ => Err(GenerationError::EmptyResponse),
        }
    }
}

#[async_trait]
impl TextGenerator for BackendClient {
    async fn generate(
        &self,
        credential: &str,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<String, GenerationError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(GenerationError::Cancelled),
            result = self.post_generate(credential, prompt) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = BackendClientConfig::new("https://backend.example.com");

        assert_eq!(config.base_url, "https://backend.example.com");
        assert_eq!(config.model, "gemini-2.0-flash");
        assert_eq!(config.request_timeout, Duration::from_secs(180));
    }

    #[test]
    fn test_config_builder() {
        let config = BackendClientConfig::new("https://backend.example.com")
            .with_model("gemini-2.5-pro")
            .with_request_timeout(Duration::from_secs(60));

        assert_eq!(config.model, "gemini-2.5-pro");
        assert_eq!(config.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_request_serialization_uses_camel_case() {
        let request = GenerateTextRequest {
            api_key: "key-123",
            prompt: "write a script",
            model: "gemini-2.0-flash",
        };

        let json = serde_json::to_value(&request).expect("request should serialize");
        assert_eq!(json["apiKey"], "key-123");
        assert_eq!(json["prompt"], "write a script");
        assert_eq!(json["model"], "gemini-2.0-flash");
    }

    #[test]
    fn test_response_envelope_parsing() {
        let envelope: GenerateTextResponse =
            serde_json::from_str(r#"{"success": true, "text": "hello"}"#)
                .expect("envelope should parse");
        assert!(envelope.success);
        assert_eq!(envelope.text.as_deref(), Some("hello"));

        let envelope: GenerateTextResponse =
            serde_json::from_str(r#"{"success": false, "message": "quota exceeded"}"#)
                .expect("envelope should parse");
        assert!(!envelope.success);
        assert_eq!(envelope.message.as_deref(), Some("quota exceeded"));
    }

    #[tokio::test]
    async fn test_cancelled_before_request() {
        let client = BackendClient::with_base_url("http://127.0.0.1:1");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = client.generate("key", "prompt", cancel).await;
        assert!(matches!(result, Err(GenerationError::Cancelled)));
    }
}
