// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport trait definitions.
//!
//! A [`Transport`] is the one LLM-facing seam the orchestration core talks
//! to. It stands in for "an external `query` function producing an async
//! stream of messages": this crate surfaces that stream as an ordered
//! `Vec<TransportMessage>` gathered from a single request/response cycle
//! rather than a live stream, since every concrete provider here replies in
//! one HTTP round trip.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single request to an LLM transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Model name.
    pub model: String,

    /// The rendered prompt for this turn.
    pub prompt: String,

    /// System prompt (optional).
    pub system: Option<String>,

    /// Session id from a previous turn, if any.
    pub session_id: Option<String>,

    /// Temperature (0.0 - 2.0).
    pub temperature: Option<f32>,

    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,

    /// JSON Schema to constrain structured output, if enforced this turn.
    pub output_schema: Option<serde_json::Value>,

    /// Additional provider-specific parameters.
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// One message surfaced by a transport during a query.
///
/// Mirrors the message kinds an agent transport stream would emit:
/// assistant text, tool invocations, a terminal result, and errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportMessage {
    /// Assistant free-text content.
    Assistant { text: String },
    /// A tool invocation the assistant requested.
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    /// Terminal result of the turn.
    Result {
        session_id: String,
        structured_output: Option<serde_json::Value>,
        cost_usd: Option<f64>,
        num_turns: u32,
        duration_ms: u64,
    },
    /// A transport-level error surfaced mid-stream.
    Error { message: String },
}

/// LLM transport trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run one request/response cycle, returning the ordered messages.
    async fn query(&self, request: QueryRequest) -> Result<Vec<TransportMessage>, ProviderError>;

    /// Get transport name.
    fn name(&self) -> &str;

    /// Check if transport is healthy.
    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP request error.
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    /// Authentication error.
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Invalid request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Provider-specific error.
    #[error("Provider error: {0}")]
    ProviderSpecific(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Timeout error.
    #[error("Request timed out")]
    Timeout,

    /// Unknown error.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
