// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runs after the LLM declares completion: validates closure prerequisites
//! and, on failure, produces a retry prompt that replaces the next
//! iteration's prompt.

use crate::error::{OrchestratorError, Result};
use crate::ports::{CompletionValidator, RetryHandler};
use crate::registry::{Registry, StepId};
use crate::schema::SchemaManager;
use serde_json::Value;
use std::sync::Arc;
use stepflow_providers::{QueryRequest, Transport};
use tracing::warn;

/// The embedded validation prompt asked of the model when a closure step
/// declares a schema-based `outputSchema` for its completion check.
pub const VALIDATION_PROMPT: &str = concat!(
    "Before declaring this step complete, verify the following using the tools ",
    "available to you, then reply with a JSON object under a top-level `validation` ",
    "key with one boolean field per check:\n",
    "- `gitClean`: `git status --porcelain` produces no output\n",
    "- `typesPass`: the project's type checker exits zero\n",
    "- `testsPass`: the project's test suite exits zero\n",
    "Reply with exactly `{\"validation\": {\"gitClean\": <bool>, \"typesPass\": <bool>, \"testsPass\": <bool>}}`."
);

/// Result of validating a closure step's completion.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub valid: bool,
    pub retry_prompt: Option<String>,
}

/// Validates closure-step prerequisites, orchestrating either an inner
/// schema-based validation query or an injected [`CompletionValidator`].
pub struct CompletionChain {
    schema_manager: Arc<SchemaManager>,
    transport: Arc<dyn Transport>,
    model: String,
    completion_validator: Option<Arc<dyn CompletionValidator>>,
    retry_handler: Option<Arc<dyn RetryHandler>>,
}

impl CompletionChain {
    pub fn new(
        schema_manager: Arc<SchemaManager>,
        transport: Arc<dyn Transport>,
        model: impl Into<String>,
        completion_validator: Option<Arc<dyn CompletionValidator>>,
        retry_handler: Option<Arc<dyn RetryHandler>>,
    ) -> Self {
        Self {
            schema_manager,
            transport,
            model: model.into(),
            completion_validator,
            retry_handler,
        }
    }

    pub async fn validate(&self, step_id: &StepId, registry: &Registry) -> Result<CompletionOutcome> {
        let Some(completion_step) = registry.completion_steps.get(step_id) else {
            return Ok(CompletionOutcome { valid: true, retry_prompt: None });
        };

        if let Some(schema_ref) = &completion_step.output_schema {
            let schema = self
                .schema_manager
                .load_gate_schema(step_id, &schema_ref.file, &schema_ref.schema)?;
            return self.validate_via_schema_query(step_id, schema).await;
        }

        if !completion_step.completion_conditions.is_empty() {
            return self.validate_via_conditions(step_id, &completion_step.completion_conditions).await;
        }

        Ok(CompletionOutcome { valid: true, retry_prompt: None })
    }

    async fn validate_via_schema_query(
        &self,
        step_id: &StepId,
        schema: Option<Value>,
    ) -> Result<CompletionOutcome> {
        let request = QueryRequest {
            model: self.model.clone(),
            prompt: VALIDATION_PROMPT.to_string(),
            system: None,
            session_id: None,
            temperature: None,
            max_tokens: None,
            output_schema: schema,
            extra: Default::default(),
        };

        let messages = self.transport.query(request).await.map_err(|err| OrchestratorError::Completion {
            message: format!("inner validation query failed: {err}"),
        })?;

        let structured = messages.into_iter().find_map(|message| match message {
            stepflow_providers::TransportMessage::Result { structured_output, .. } => structured_output,
            _ => None,
        });

        let Some(validation) = structured.as_ref().and_then(|v| v.get("validation")).and_then(Value::as_object) else {
            return Ok(CompletionOutcome {
                valid: false,
                retry_prompt: Some(generic_retry_prompt(step_id, &["validation object missing from reply".to_string()])),
            });
        };

        let failed: Vec<String> = validation
            .iter()
            .filter(|(_, value)| value.as_bool() == Some(false))
            .map(|(key, _)| key.clone())
            .collect();

        if failed.is_empty() {
            Ok(CompletionOutcome { valid: true, retry_prompt: None })
        } else {
            Ok(CompletionOutcome {
                valid: false,
                retry_prompt: Some(generic_retry_prompt(step_id, &failed)),
            })
        }
    }

    async fn validate_via_conditions(&self, step_id: &StepId, conditions: &[String]) -> Result<CompletionOutcome> {
        let Some(validator) = &self.completion_validator else {
            warn!(%step_id, "completionConditions configured but no CompletionValidator injected; passing");
            return Ok(CompletionOutcome { valid: true, retry_prompt: None });
        };

        let outcome = validator.validate(step_id, conditions).await?;
        if outcome.valid {
            return Ok(CompletionOutcome { valid: true, retry_prompt: None });
        }

        let retry_prompt = match &self.retry_handler {
            Some(handler) => handler.build_retry_prompt(step_id, &outcome.failed_conditions),
            None => generic_retry_prompt(step_id, &outcome.failed_conditions),
        };

        Ok(CompletionOutcome { valid: false, retry_prompt: Some(retry_prompt) })
    }
}

fn generic_retry_prompt(step_id: &StepId, failed: &[String]) -> String {
    format!(
        "Step '{step_id}' is not yet complete. The following checks failed: {}. Address them and report completion again.",
        failed.join(", ")
    )
}
