// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Narrow dependency-injection seams for collaborators this crate treats
//! as external: condition checking, retry-prompt construction, and
//! prompt rendering.

use crate::context::StepContext;
use crate::error::Result;
use crate::registry::StepId;
use async_trait::async_trait;

/// Outcome of checking a closure step's `completionConditions`.
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub failed_conditions: Vec<String>,
}

/// Runs command-based completion conditions (e.g. shelling out to a type
/// checker). Out of scope for this crate: this trait is the seam.
#[async_trait]
pub trait CompletionValidator: Send + Sync {
    async fn validate(&self, step_id: &StepId, conditions: &[String]) -> Result<ValidationOutcome>;
}

/// Builds a retry prompt from a named pattern when completion validation
/// fails.
pub trait RetryHandler: Send + Sync {
    fn build_retry_prompt(&self, step_id: &StepId, failed_conditions: &[String]) -> String;
}

/// Renders the initial or continuation prompt for a step from the
/// accumulated [`StepContext`]. Variable substitution only; template
/// rendering proper is out of scope.
pub trait PromptResolver: Send + Sync {
    fn build_prompt(&self, step_id: &StepId, iteration: usize, context: &StepContext) -> Result<String>;
}
