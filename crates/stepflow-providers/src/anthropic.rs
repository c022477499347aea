// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Anthropic (Claude) transport implementation.

use crate::traits::{ProviderError, QueryRequest, Transport, TransportMessage};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Anthropic API transport.
pub struct AnthropicProvider {
    /// HTTP client.
    client: Client,
    /// API key.
    api_key: String,
    /// API base URL.
    base_url: String,
    /// Default API version.
    api_version: String,
}

/// Anthropic messages request.
#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

/// Message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

/// Anthropic messages response.
#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[allow(dead_code)]
    id: String,
    content: Vec<ContentBlock>,
    #[allow(dead_code)]
    model: String,
    #[allow(dead_code)]
    stop_reason: Option<String>,
    usage: Usage,
}

/// Content block in response.
#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    content_type: String,
    text: String,
}

/// Token usage information.
#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

/// Anthropic error response.
#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicError,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

/// Per-token-ish cost estimate; Anthropic billing varies per model, this is
/// a conservative flat estimate used only for `IterationSummary.cost_usd`.
const COST_PER_1K_TOKENS_USD: f64 = 0.003;

impl AnthropicProvider {
    fn convert_reqwest_error(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if let Some(status) = err.status() {
            if status == 401 || status == 403 {
                ProviderError::AuthError(err.to_string())
            } else if status == 429 {
                ProviderError::RateLimitExceeded
            } else {
                ProviderError::HttpError(err.to_string())
            }
        } else {
            ProviderError::HttpError(err.to_string())
        }
    }

    /// Creates a new Anthropic provider.
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(
            api_key,
            "https://api.anthropic.com/v1".to_string(),
            "2023-06-01".to_string(),
        )
    }

    /// Creates a new Anthropic provider with custom base URL and API version.
    pub fn with_base_url(api_key: String, base_url: String, api_version: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_key,
            base_url,
            api_version,
        }
    }

    /// Creates a new Anthropic provider from `ANTHROPIC_API_KEY`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            ProviderError::InvalidRequest(
                "ANTHROPIC_API_KEY environment variable not set".to_string(),
            )
        })?;

        Ok(Self::new(api_key))
    }

    fn to_anthropic_request(&self, request: &QueryRequest) -> MessagesRequest {
        let messages = vec![Message {
            role: "user".to_string(),
            content: request.prompt.clone(),
        }];

        let system = match (&request.system, &request.output_schema) {
            (Some(system), Some(schema)) => Some(format!(
                "{system}\n\nRespond with a single JSON object matching this schema, \
                 and nothing else:\n{schema}",
                schema = schema
            )),
            (Some(system), None) => Some(system.clone()),
            (None, Some(schema)) => Some(format!(
                "Respond with a single JSON object matching this schema, and nothing else:\n{schema}"
            )),
            (None, None) => None,
        };

        MessagesRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(1024),
            system,
            temperature: request.temperature,
        }
    }

    fn parse_error(&self, status: StatusCode, body: &str) -> ProviderError {
        if let Ok(error_response) = serde_json::from_str::<AnthropicErrorResponse>(body) {
            let error = error_response.error;

            if status == StatusCode::TOO_MANY_REQUESTS || error.error_type == "rate_limit_error" {
                return ProviderError::RateLimitExceeded;
            }

            if status == StatusCode::UNAUTHORIZED
                || status == StatusCode::FORBIDDEN
                || error.error_type == "authentication_error"
                || error.error_type == "permission_error"
            {
                return ProviderError::AuthError(error.message);
            }

            if error.error_type == "invalid_request_error" {
                return ProviderError::InvalidRequest(error.message);
            }

            return ProviderError::ProviderSpecific(format!(
                "[{}] {}: {}",
                status.as_u16(),
                error.error_type,
                error.message
            ));
        }

        ProviderError::HttpError(format!("[{}] {}", status.as_u16(), body))
    }
}

#[async_trait]
impl Transport for AnthropicProvider {
    async fn query(
        &self,
        request: QueryRequest,
    ) -> Result<Vec<TransportMessage>, ProviderError> {
        let start = Instant::now();
        let wants_structured = request.output_schema.is_some();
        let anthropic_request = self.to_anthropic_request(&request);

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header("Content-Type", "application/json")
            .json(&anthropic_request)
            .send()
            .await
            .map_err(Self::convert_reqwest_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("Failed to read response body"));

        if !status.is_success() {
            return Err(self.parse_error(status, &body));
        }

        let messages_response: MessagesResponse = serde_json::from_str(&body)?;

        let text = messages_response
            .content
            .iter()
            .map(|block| block.text.clone())
            .collect::<Vec<_>>()
            .join("");

        let total_tokens = messages_response.usage.input_tokens + messages_response.usage.output_tokens;
        let cost_usd = (total_tokens as f64 / 1000.0) * COST_PER_1K_TOKENS_USD;

        let structured_output = if wants_structured {
            extract_json_object(&text)
        } else {
            None
        };

        Ok(vec![
            TransportMessage::Assistant { text: text.clone() },
            TransportMessage::Result {
                session_id: messages_response.id,
                structured_output,
                cost_usd: Some(cost_usd),
                num_turns: 1,
                duration_ms: start.elapsed().as_millis() as u64,
            },
        ])
    }

    fn name(&self) -> &str {
        "anthropic"
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let test_request = QueryRequest {
            model: "claude-3-haiku-20240307".to_string(),
            prompt: "Hi".to_string(),
            system: None,
            session_id: None,
            temperature: None,
            max_tokens: Some(5),
            output_schema: None,
            extra: std::collections::HashMap::new(),
        };

        self.query(test_request).await?;
        Ok(())
    }
}

/// Pulls the first top-level JSON object out of a text blob. Claude usually
/// replies with exactly that, but may wrap it in prose or a code fence.
fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text.trim()) {
        return Some(value);
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_creation() {
        let provider = AnthropicProvider::new("test-key".to_string());
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(provider.base_url, "https://api.anthropic.com/v1");
    }

    #[test]
    fn test_provider_with_custom_base_url() {
        let provider = AnthropicProvider::with_base_url(
            "test-key".to_string(),
            "http://localhost:8080".to_string(),
            "2023-06-01".to_string(),
        );
        assert_eq!(provider.base_url, "http://localhost:8080");
        assert_eq!(provider.api_version, "2023-06-01");
    }

    #[test]
    fn test_to_anthropic_request_with_schema() {
        let provider = AnthropicProvider::new("test-key".to_string());

        let request = QueryRequest {
            model: "claude-3-opus-20240229".to_string(),
            prompt: "Hello, world!".to_string(),
            system: Some("You are a helpful assistant".to_string()),
            session_id: None,
            temperature: Some(0.7),
            max_tokens: Some(100),
            output_schema: Some(serde_json::json!({"type": "object"})),
            extra: std::collections::HashMap::new(),
        };

        let anthropic_req = provider.to_anthropic_request(&request);

        assert_eq!(anthropic_req.model, "claude-3-opus-20240229");
        assert_eq!(anthropic_req.messages[0].content, "Hello, world!");
        assert!(anthropic_req.system.unwrap().contains("JSON object"));
        assert_eq!(anthropic_req.temperature, Some(0.7));
        assert_eq!(anthropic_req.max_tokens, 100);
    }

    #[test]
    fn test_parse_rate_limit_error() {
        let provider = AnthropicProvider::new("test-key".to_string());

        let error_json = r#"{
            "error": {
                "type": "rate_limit_error",
                "message": "Rate limit exceeded"
            }
        }"#;

        let error = provider.parse_error(StatusCode::TOO_MANY_REQUESTS, error_json);
        assert!(matches!(error, ProviderError::RateLimitExceeded));
    }

    #[test]
    fn test_parse_auth_error() {
        let provider = AnthropicProvider::new("test-key".to_string());

        let error_json = r#"{
            "error": {
                "type": "authentication_error",
                "message": "Invalid API key"
            }
        }"#;

        let error = provider.parse_error(StatusCode::UNAUTHORIZED, error_json);
        match error {
            ProviderError::AuthError(msg) => assert_eq!(msg, "Invalid API key"),
            _ => panic!("Expected AuthError"),
        }
    }

    #[test]
    fn test_extract_json_object_from_prose() {
        let text = "Sure, here you go:\n```json\n{\"a\": 1}\n```\nHope that helps!";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_extract_json_object_plain() {
        let text = "{\"a\": 1}";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["a"], 1);
    }
}
