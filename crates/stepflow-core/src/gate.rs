// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interprets a step's structured output into a bounded [`Intent`] using its
//! [`GateConfig`].

use crate::error::{OrchestratorError, Result};
use crate::registry::{GateConfig, Intent, Step, StepId};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Dot-paths probed, in order, for a human-readable reason when the
/// structured output does not carry one at the intent field itself.
const REASON_PATHS: &[&str] = &["next_action.reason", "reason", "message", "next_action.details.reason"];

/// The result of interpreting a step's structured output.
#[derive(Debug, Clone)]
pub struct Interpretation {
    pub intent: Intent,
    pub target: Option<String>,
    pub handoff: HashMap<String, Value>,
    pub used_fallback: bool,
    pub reason: Option<String>,
}

/// Extracts routing information from structured output against a step's gate.
pub struct GateInterpreter;

impl GateInterpreter {
    pub fn new() -> Self {
        Self
    }

    pub fn interpret(&self, step_id: &StepId, step: &Step, output: &Value) -> Result<Interpretation> {
        let Some(gate) = &step.structured_gate else {
            return Ok(Interpretation {
                intent: Intent::Next,
                target: None,
                handoff: HashMap::new(),
                used_fallback: true,
                reason: None,
            });
        };

        let raw = get_path(output, &gate.intent_field);
        let mapped = raw.and_then(|value| coerce_intent(value));

        let (intent, used_fallback) = match mapped {
            Some(intent) if gate.allowed_intents.contains(&intent) => (intent, false),
            _ => (self.fallback(step_id, gate)?, true),
        };

        let target = if intent == Intent::Jump {
            gate.target_field
                .as_deref()
                .and_then(|path| get_path(output, path))
                .and_then(|value| value.as_str())
                .map(|s| s.to_string())
        } else {
            None
        };

        let mut handoff = HashMap::new();
        for path in &gate.handoff_fields {
            if let Some(value) = get_path(output, path) {
                let key = path.rsplit('.').next().unwrap_or(path).to_string();
                handoff.insert(key, value.clone());
            }
        }

        let reason = REASON_PATHS
            .iter()
            .find_map(|path| get_path(output, path))
            .and_then(|value| value.as_str())
            .map(|s| s.to_string());

        Ok(Interpretation {
            intent,
            target,
            handoff,
            used_fallback,
            reason,
        })
    }

    fn fallback(&self, step_id: &StepId, gate: &GateConfig) -> Result<Intent> {
        if gate.fail_fast {
            return Err(OrchestratorError::GateInterpretation {
                step_id: step_id.to_string(),
                reason: format!(
                    "could not extract a valid intent at '{}' from the allowed set {:?}",
                    gate.intent_field, gate.allowed_intents
                ),
            });
        }

        warn!(%step_id, field = %gate.intent_field, "spec violation: gate fell back without failFast");

        if let Some(fallback) = gate.fallback_intent {
            if gate.allowed_intents.contains(&fallback) {
                return Ok(fallback);
            }
        }
        if gate.allowed_intents.contains(&Intent::Next) {
            return Ok(Intent::Next);
        }
        gate.allowed_intents
            .iter()
            .next()
            .copied()
            .ok_or_else(|| OrchestratorError::GateInterpretation {
                step_id: step_id.to_string(),
                reason: "no allowed intents to fall back to".to_string(),
            })
    }
}

impl Default for GateInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads a dot-path into `value`. Each segment must index into an object;
/// any mismatch yields `None`.
fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Lowercases and string-coerces the raw intent value, then maps it through
/// the fixed alias table.
fn coerce_intent(value: &Value) -> Option<Intent> {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let lowered = raw.to_lowercase();

    Some(match lowered.as_str() {
        "next" | "continue" => Intent::Next,
        "repeat" | "retry" => Intent::Repeat,
        "jump" => Intent::Jump,
        "closing" | "done" | "complete" => Intent::Closing,
        "handoff" => Intent::Handoff,
        "abort" => Intent::Abort,
        "escalate" => Intent::Escalate,
        _ => return None,
    })
}
