// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! LLM transport implementations for the step-flow orchestrator.

pub mod anthropic;
pub mod openai;
pub mod traits;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAIProvider;
pub use traits::{ProviderError, QueryRequest, Transport, TransportMessage};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
