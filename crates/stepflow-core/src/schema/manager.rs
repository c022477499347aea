// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Registry-wide schema invariants and the per-step, 2-strike
//! schema-resolution fail-fast rule.

use super::resolver::{SchemaPointerError, SchemaResolver};
use crate::error::{OrchestratorError, Result};
use crate::registry::{Registry, StepId};
use dashmap::DashMap;
use serde_json::Value;
use tracing::warn;

/// Consecutive schema-resolution failures tolerated for a step before
/// `loadSchemaForStep` raises instead of returning `None`.
pub const MAX_SCHEMA_FAILURES: u32 = 2;

/// Validates registry-wide schema invariants and resolves per-step output
/// schemas, tracking consecutive failures per step.
pub struct SchemaManager {
    resolver: SchemaResolver,
    failures: DashMap<StepId, u32>,
}

impl SchemaManager {
    pub fn new(resolver: SchemaResolver) -> Self {
        Self {
            resolver,
            failures: DashMap::new(),
        }
    }

    /// Checks that every non-template step carries a `structuredGate`,
    /// `transitions`, and `outputSchemaRef`. Returns a single consolidated
    /// error naming every offending step, rather than failing on the first.
    pub fn validate_flow_steps(&self, registry: &Registry) -> Result<()> {
        let mut offenders = Vec::new();

        for (step_id, step) in &registry.steps {
            if step_id.is_template() {
                continue;
            }

            let mut missing = Vec::new();
            if step.structured_gate.is_none() {
                missing.push("structuredGate");
            }
            if step.transitions.is_empty() {
                missing.push("transitions");
            }
            if step.output_schema_ref.is_none() {
                missing.push("outputSchemaRef");
            }

            if !missing.is_empty() {
                offenders.push(format!("{step_id} (missing {})", missing.join(", ")));
            }
        }

        if offenders.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Environment {
                message: format!("invalid registry steps: {}", offenders.join("; ")),
            })
        }
    }

    /// Loads the output schema for `step_id`'s current iteration, applying
    /// the 2-strike fail-fast rule: the first resolution failure is
    /// recorded and `None` returned (the gate degrades gracefully for one
    /// iteration); a second consecutive failure raises
    /// `OrchestratorError::SchemaResolution`. A success clears the counter.
    pub fn load_schema_for_step(&self, registry: &Registry, step_id: &StepId) -> Result<Option<Value>> {
        let Some(step) = registry.steps.get(step_id) else {
            return Err(OrchestratorError::Environment {
                message: format!("unknown step '{step_id}'"),
            });
        };

        let Some(schema_ref) = &step.output_schema_ref else {
            return Ok(None);
        };

        match self.resolver.resolve(&schema_ref.file, &schema_ref.schema) {
            Ok(schema) => {
                self.failures.remove(step_id);
                Ok(Some(schema))
            }
            Err(err) => self.record_failure(step_id, schema_ref.to_string(), err),
        }
    }

    /// Resolves an arbitrary gate-intent schema ref, applying the same
    /// 2-strike counter as `load_schema_for_step` (counters are shared per
    /// step regardless of which schema kind failed).
    pub fn load_gate_schema(
        &self,
        step_id: &StepId,
        file: &str,
        schema: &str,
    ) -> Result<Option<Value>> {
        match self.resolver.resolve(file, schema) {
            Ok(value) => {
                self.failures.remove(step_id);
                Ok(Some(value))
            }
            Err(err) => self.record_failure(step_id, format!("{file}#{schema}"), err),
        }
    }

    fn record_failure(
        &self,
        step_id: &StepId,
        schema_ref: String,
        err: SchemaPointerError,
    ) -> Result<Option<Value>> {
        let mut count = self.failures.entry(step_id.clone()).or_insert(0);
        *count += 1;

        if *count >= MAX_SCHEMA_FAILURES {
            let consecutive_failures = *count;
            drop(count);
            self.failures.remove(step_id);
            return Err(OrchestratorError::SchemaResolution {
                step_id: step_id.to_string(),
                schema_ref,
                consecutive_failures,
            });
        }

        warn!(%step_id, %schema_ref, error = %err, "schema resolution failed, degrading for this iteration");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use std::collections::HashMap;

    fn registry_with_one_step() -> Registry {
        let json = r#"{
            "agentId": "issue-agent",
            "version": "1.0.0",
            "entryStep": "initial.test",
            "steps": {
                "initial.test": {
                    "name": "Initial",
                    "structuredGate": {
                        "allowedIntents": ["next"],
                        "intentField": "next_action.action",
                        "intentSchemaRef": {"file": "steps.json", "schema": "Intent"}
                    },
                    "transitions": {"next": null},
                    "outputSchemaRef": {"file": "steps.json", "schema": "Missing"}
                },
                "section.intro": {
                    "name": "Intro",
                    "transitions": {}
                }
            }
        }"#;
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn template_steps_are_exempt_from_validation() {
        let resolver = SchemaResolver::new(std::env::temp_dir());
        let manager = SchemaManager::new(resolver);
        let registry = registry_with_one_step();
        assert!(manager.validate_flow_steps(&registry).is_ok());
    }

    #[test]
    fn missing_required_fields_are_consolidated() {
        let mut registry = registry_with_one_step();
        registry.steps.insert(
            StepId::new("continuation.bare"),
            crate::registry::Step {
                name: "Bare".to_string(),
                structured_gate: None,
                transitions: HashMap::new(),
                output_schema_ref: None,
            },
        );

        let resolver = SchemaResolver::new(std::env::temp_dir());
        let manager = SchemaManager::new(resolver);
        let err = manager.validate_flow_steps(&registry).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("continuation.bare"));
    }

    #[test]
    fn two_consecutive_failures_raise_after_one_degrade() {
        let resolver = SchemaResolver::new(std::env::temp_dir().join("does-not-exist"));
        let manager = SchemaManager::new(resolver);
        let registry = registry_with_one_step();
        let step_id = StepId::new("initial.test");

        let first = manager.load_schema_for_step(&registry, &step_id).unwrap();
        assert!(first.is_none());

        let second = manager.load_schema_for_step(&registry, &step_id);
        assert!(matches!(second, Err(OrchestratorError::SchemaResolution { .. })));
    }
}
