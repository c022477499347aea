// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-iteration driver that owns the canonical `stepId` and the
//! [`StepContext`], normalizing the model's self-reported step and turning
//! its interpreted intent into a routing decision.

use crate::context::StepContext;
use crate::error::{OrchestratorError, Result};
use crate::executor::IterationSummary;
use crate::gate::GateInterpreter;
use crate::registry::{Registry, StepId};
use crate::router::{RoutingResult, WorkflowRouter};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::info;

/// Per-iteration driver: entry-step pick, stepId normalization, output
/// recording, transition.
pub struct FlowOrchestrator {
    context: StepContext,
    current_step_id: Mutex<Option<StepId>>,
    gate: GateInterpreter,
    router: WorkflowRouter,
}

impl FlowOrchestrator {
    pub fn new() -> Self {
        Self {
            context: StepContext::new(),
            current_step_id: Mutex::new(None),
            gate: GateInterpreter::new(),
            router: WorkflowRouter::new(),
        }
    }

    pub fn context(&self) -> &StepContext {
        &self.context
    }

    /// Allocates the context and primes `currentStepId` to the entry step.
    pub fn initialize_step_context(&self, registry: &Registry, completion_type: Option<&str>) -> Result<StepId> {
        let entry = registry.entry_step_for(completion_type)?;
        *self.current_step_id.lock() = Some(entry.clone());
        Ok(entry)
    }

    /// `i=1`: resolves the entry step. `i>1`: returns the `currentStepId`
    /// left by the previous `handle_step_transition`.
    pub fn get_step_id_for_iteration(
        &self,
        iteration: usize,
        registry: &Registry,
        completion_type: Option<&str>,
    ) -> Result<StepId> {
        if iteration == 1 {
            return self.initialize_step_context(registry, completion_type);
        }

        self.current_step_id
            .lock()
            .clone()
            .ok_or_else(|| OrchestratorError::Environment {
                message: format!("no currentStepId available for iteration {iteration}; context was never initialized"),
            })
    }

    /// Overwrites the model's self-reported `stepId` in the structured
    /// output with the canonical value, logging a correction when they
    /// differ.
    pub fn normalize_structured_output_step_id(&self, canonical: &StepId, structured_output: &mut Value) {
        let Some(obj) = structured_output.as_object_mut() else {
            return;
        };

        let reported = obj.get("stepId").and_then(Value::as_str).map(str::to_string);
        if reported.as_deref() != Some(canonical.as_str()) {
            if let Some(got) = reported {
                info!("[StepFlow] stepId corrected: \"{got}\" -> \"{canonical}\"");
            }
            obj.insert("stepId".to_string(), Value::String(canonical.to_string()));
        }
    }

    /// Merges structured output (plus `iteration`, `sessionId`, error
    /// count) into `StepContext[stepId]`. No-op when the context was never
    /// initialized.
    pub fn record_step_output(&self, step_id: &StepId, summary: &IterationSummary) {
        if self.current_step_id.lock().is_none() {
            return;
        }

        let mut fields: Vec<(String, Value)> = Vec::new();
        if let Some(output) = &summary.structured_output {
            if let Some(map) = output.as_object() {
                fields.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        fields.push(("iteration".to_string(), Value::from(summary.iteration)));
        if let Some(session_id) = &summary.session_id {
            fields.push(("sessionId".to_string(), Value::String(session_id.clone())));
        }
        fields.push(("errorCount".to_string(), Value::from(summary.errors.len())));

        self.context.record(step_id, fields);
    }

    /// Returns `None` when schema resolution previously failed, routing is
    /// disabled, or there is no structured output; otherwise interprets the
    /// gate and routes, storing any handoff and advancing `currentStepId`.
    pub fn handle_step_transition(
        &self,
        step_id: &StepId,
        summary: &IterationSummary,
        registry: &Registry,
        routing_enabled: bool,
    ) -> Result<Option<RoutingResult>> {
        if summary.schema_resolution_failed || !routing_enabled {
            return Ok(None);
        }
        let Some(structured_output) = &summary.structured_output else {
            return Ok(None);
        };

        let step = registry.steps.get(step_id).ok_or_else(|| OrchestratorError::Environment {
            message: format!("unknown step '{step_id}' during routing"),
        })?;

        let interpretation = self.gate.interpret(step_id, step, structured_output)?;
        let result = self.router.route(step_id, &interpretation, registry)?;

        if !interpretation.handoff.is_empty() {
            self.context.record(
                step_id,
                interpretation.handoff.iter().map(|(k, v)| (k.clone(), v.clone())),
            );
        }

        if let Some(next) = &result.next_step_id {
            *self.current_step_id.lock() = Some(next.clone());
        }

        Ok(Some(result))
    }
}

impl Default for FlowOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Intent, Step, Transition};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    fn registry_with_two_steps() -> Registry {
        let mut steps = HashMap::new();
        steps.insert(
            StepId::new("initial.test"),
            Step {
                name: "Initial".to_string(),
                structured_gate: None,
                transitions: {
                    let mut t = HashMap::new();
                    t.insert(Intent::Next, Transition::Concrete(StepId::new("continuation.test")));
                    t
                },
                output_schema_ref: None,
            },
        );
        steps.insert(
            StepId::new("continuation.test"),
            Step {
                name: "Continuation".to_string(),
                structured_gate: None,
                transitions: HashMap::new(),
                output_schema_ref: None,
            },
        );

        Registry {
            agent_id: "issue-agent".to_string(),
            version: "1.0.0".to_string(),
            c1: json!({}),
            steps,
            schemas_base: None,
            entry_step: Some(StepId::new("initial.test")),
            entry_step_mapping: None,
            completion_patterns: HashMap::new(),
            validators: Vec::new(),
            completion_steps: HashMap::new(),
        }
    }

    fn summary_with_output(output: Value) -> IterationSummary {
        IterationSummary {
            iteration: 1,
            session_id: Some("sess-1".to_string()),
            assistant_responses: Vec::new(),
            tools_used: Vec::new(),
            structured_output: Some(output),
            errors: Vec::new(),
            schema_resolution_failed: false,
            rate_limit_retry: None,
            cost_usd: 0.0,
            duration: Duration::from_millis(0),
        }
    }

    #[test]
    fn iteration_one_resolves_entry_step() {
        let orchestrator = FlowOrchestrator::new();
        let registry = registry_with_two_steps();
        let step = orchestrator.get_step_id_for_iteration(1, &registry, None).unwrap();
        assert_eq!(step, StepId::new("initial.test"));
    }

    #[test]
    fn normalize_corrects_mismatched_step_id() {
        let orchestrator = FlowOrchestrator::new();
        let mut output = json!({"stepId": "s_initial_test"});
        orchestrator.normalize_structured_output_step_id(&StepId::new("initial.test"), &mut output);
        assert_eq!(output["stepId"], "initial.test");
    }

    #[test]
    fn handle_transition_advances_current_step() {
        let orchestrator = FlowOrchestrator::new();
        let registry = registry_with_two_steps();
        orchestrator.initialize_step_context(&registry, None).unwrap();

        let summary = summary_with_output(json!({}));
        let routing = orchestrator
            .handle_step_transition(&StepId::new("initial.test"), &summary, &registry, true)
            .unwrap()
            .unwrap();
        assert_eq!(routing.next_step_id, Some(StepId::new("continuation.test")));

        let next = orchestrator.get_step_id_for_iteration(2, &registry, None).unwrap();
        assert_eq!(next, StepId::new("continuation.test"));
    }

    #[test]
    fn schema_resolution_failure_short_circuits_routing() {
        let orchestrator = FlowOrchestrator::new();
        let registry = registry_with_two_steps();
        orchestrator.initialize_step_context(&registry, None).unwrap();

        let mut summary = summary_with_output(json!({}));
        summary.schema_resolution_failed = true;
        let routing = orchestrator
            .handle_step_transition(&StepId::new("initial.test"), &summary, &registry, true)
            .unwrap();
        assert!(routing.is_none());
    }
}
