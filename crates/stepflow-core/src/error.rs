// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The orchestrator's error taxonomy.
//!
//! Every fallible operation in this crate returns `Result<T, OrchestratorError>`.
//! `OrchestratorError` is a single sum type rather than a hierarchy: per
//! design note §9 of the specification this system is built against, code
//! identity (the stable string from [`OrchestratorError::code`]) is the
//! external contract, not Rust type identity.

use crate::executor::IterationSummary;
use std::time::Duration;
use thiserror::Error;

/// The orchestrator's error taxonomy.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The orchestrator was used before `initialize()` completed.
    #[error("agent not initialized")]
    NotInitialized,

    /// The transport returned a recoverable error, or an in-flight query
    /// was cancelled. `partial` carries whatever the executor had already
    /// gathered (assistant text, tool uses) before the failure or
    /// cancellation point.
    #[error("query failed: {message}")]
    Query {
        message: String,
        partial: Option<Box<IterationSummary>>,
    },

    /// `CompletionChain` validation failed and no retry path was available.
    #[error("completion validation failed: {message}")]
    Completion { message: String },

    /// A single query exceeded its deadline.
    #[error("operation timed out after {}ms", .timeout.as_millis())]
    Timeout { timeout: Duration },

    /// The run loop exceeded `maxIterations`.
    #[error("exceeded maximum iterations ({max_iterations})")]
    MaxIterations { max_iterations: usize },

    /// Rate-limit retries were exhausted.
    #[error("rate limited, retry after {}ms", .retry_after.as_millis())]
    RateLimit { retry_after: Duration },

    /// An environment or configuration problem (missing files, malformed
    /// registry, missing required step fields).
    #[error("environment error: {message}")]
    Environment { message: String },

    /// Two consecutive schema-resolution failures on the same step, or a
    /// malformed `outputSchemaRef`.
    #[error(
        "schema resolution failed for step '{step_id}' (ref {schema_ref}, {consecutive_failures} consecutive failures)"
    )]
    SchemaResolution {
        step_id: String,
        schema_ref: String,
        consecutive_failures: u32,
    },

    /// `GateInterpreter` could not extract a valid intent and `failFast`
    /// left no fallback.
    #[error("gate interpretation failed for step '{step_id}': {reason}")]
    GateInterpretation { step_id: String, reason: String },

    /// `WorkflowRouter` hit a rule violation (unknown target, disallowed
    /// intent for this step kind, missing conditional default, ...).
    #[error("routing failed: {message}")]
    Routing { message: String },
}

impl OrchestratorError {
    /// The stable external error code, per the §6 taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized => "AGENT_NOT_INITIALIZED",
            Self::Query { .. } => "AGENT_QUERY_ERROR",
            Self::Completion { .. } => "AGENT_COMPLETION_ERROR",
            Self::Timeout { .. } => "AGENT_TIMEOUT",
            Self::MaxIterations { .. } => "AGENT_MAX_ITERATIONS",
            Self::RateLimit { .. } => "AGENT_RATE_LIMIT",
            Self::Environment { .. } => "AGENT_ENVIRONMENT_ERROR",
            Self::SchemaResolution { .. } => "FAILED_SCHEMA_RESOLUTION",
            Self::GateInterpretation { .. } => "FAILED_GATE_INTERPRETATION",
            Self::Routing { .. } => "FAILED_STEP_ROUTING",
        }
    }

    /// Whether the caller may usefully retry after this error.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            Self::Query { .. } | Self::Completion { .. } | Self::Timeout { .. } | Self::RateLimit { .. }
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(OrchestratorError::NotInitialized.code(), "AGENT_NOT_INITIALIZED");
        assert_eq!(
            OrchestratorError::MaxIterations { max_iterations: 10 }.code(),
            "AGENT_MAX_ITERATIONS"
        );
        assert_eq!(
            OrchestratorError::SchemaResolution {
                step_id: "initial.issue".into(),
                schema_ref: "steps.json#/foo".into(),
                consecutive_failures: 2,
            }
            .code(),
            "FAILED_SCHEMA_RESOLUTION"
        );
    }

    #[test]
    fn recoverability_matches_taxonomy() {
        assert!(OrchestratorError::Query { message: "x".into(), partial: None }.recoverable());
        assert!(!OrchestratorError::MaxIterations { max_iterations: 1 }.recoverable());
        assert!(!OrchestratorError::Environment { message: "x".into() }.recoverable());
        assert!(OrchestratorError::RateLimit { retry_after: Duration::from_secs(1) }.recoverable());
    }
}
