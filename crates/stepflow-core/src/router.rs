// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Maps `(currentStepId, interpretation)` to `{nextStepId, signalCompletion,
//! reason}`, enforcing the step-kind rules.

use crate::error::{OrchestratorError, Result};
use crate::gate::Interpretation;
use crate::registry::{Intent, Registry, StepId, StepKind, Transition};

/// The result of routing a single iteration's interpreted intent.
#[derive(Debug, Clone)]
pub struct RoutingResult {
    pub next_step_id: Option<StepId>,
    pub signal_completion: bool,
    pub reason: String,
}

/// Enforces step-kind routing rules over a registry's transitions.
pub struct WorkflowRouter;

impl WorkflowRouter {
    pub fn new() -> Self {
        Self
    }

    pub fn route(
        &self,
        current_step_id: &StepId,
        interpretation: &Interpretation,
        registry: &Registry,
    ) -> Result<RoutingResult> {
        let kind = StepKind::from_step_id(current_step_id);
        let step = registry.steps.get(current_step_id).ok_or_else(|| OrchestratorError::Routing {
            message: format!("unknown current step '{current_step_id}'"),
        })?;

        let result = match interpretation.intent {
            Intent::Closing => self.route_closing(current_step_id, kind, step, registry)?,
            Intent::Abort => RoutingResult {
                next_step_id: None,
                signal_completion: true,
                reason: "Intent: abort".to_string(),
            },
            Intent::Repeat => RoutingResult {
                next_step_id: Some(current_step_id.clone()),
                signal_completion: false,
                reason: "Intent: repeat".to_string(),
            },
            Intent::Jump => self.route_jump(interpretation, registry)?,
            Intent::Escalate => self.route_escalate(current_step_id, kind, step, registry)?,
            Intent::Handoff => self.route_handoff(current_step_id, kind, step, registry)?,
            Intent::Next => self.route_transition(current_step_id, kind, step, interpretation, registry)?,
        };

        let reason = interpretation
            .reason
            .clone()
            .unwrap_or_else(|| format!("Intent: {}", interpretation.intent.as_str()));

        Ok(RoutingResult { reason, ..result })
    }

    fn route_closing(
        &self,
        current_step_id: &StepId,
        kind: StepKind,
        step: &crate::registry::Step,
        registry: &Registry,
    ) -> Result<RoutingResult> {
        if kind == StepKind::Closure {
            return Ok(RoutingResult {
                next_step_id: None,
                signal_completion: true,
                reason: String::new(),
            });
        }

        if step.transitions.contains_key(&Intent::Closing) {
            return self.route_transition_for(current_step_id, step, Intent::Closing, None, registry);
        }

        Err(OrchestratorError::Routing {
            message: format!("Intent 'closing' not allowed for work step '{current_step_id}'"),
        })
    }

    fn route_jump(&self, interpretation: &Interpretation, registry: &Registry) -> Result<RoutingResult> {
        let target = interpretation.target.as_ref().ok_or_else(|| OrchestratorError::Routing {
            message: "intent 'jump' requires a target but none was extracted".to_string(),
        })?;
        let target_id = StepId::new(target.clone());

        if !registry.steps.contains_key(&target_id) {
            return Err(OrchestratorError::Routing {
                message: format!("jump target '{target}' is not a known step"),
            });
        }

        Ok(RoutingResult {
            next_step_id: Some(target_id),
            signal_completion: false,
            reason: String::new(),
        })
    }

    fn route_escalate(
        &self,
        current_step_id: &StepId,
        kind: StepKind,
        step: &crate::registry::Step,
        registry: &Registry,
    ) -> Result<RoutingResult> {
        if kind != StepKind::Verification {
            return Err(OrchestratorError::Routing {
                message: format!("Intent 'escalate' not allowed outside verification steps ('{current_step_id}')"),
            });
        }
        if !step.transitions.contains_key(&Intent::Escalate) {
            return Err(OrchestratorError::Routing {
                message: format!("step '{current_step_id}' has no 'escalate' transition configured"),
            });
        }
        self.route_transition_for(current_step_id, step, Intent::Escalate, None, registry)
    }

    /// `handoff` is disallowed from `initial`/`closure`. When the step
    /// wires an explicit `transitions.handoff` entry it is honored like any
    /// other transition (letting a multi-step flow hand off to the next
    /// phase); otherwise it falls back to the documented default of
    /// signalling completion.
    fn route_handoff(
        &self,
        current_step_id: &StepId,
        kind: StepKind,
        step: &crate::registry::Step,
        registry: &Registry,
    ) -> Result<RoutingResult> {
        if matches!(kind, StepKind::Initial | StepKind::Closure) {
            return Err(OrchestratorError::Routing {
                message: format!("Intent 'handoff' not allowed from step '{current_step_id}' (kind {kind:?})"),
            });
        }

        if step.transitions.contains_key(&Intent::Handoff) {
            return self.route_transition_for(current_step_id, step, Intent::Handoff, None, registry);
        }

        Ok(RoutingResult {
            next_step_id: None,
            signal_completion: true,
            reason: String::new(),
        })
    }

    fn route_transition(
        &self,
        current_step_id: &StepId,
        kind: StepKind,
        step: &crate::registry::Step,
        interpretation: &Interpretation,
        registry: &Registry,
    ) -> Result<RoutingResult> {
        if step.transitions.contains_key(&interpretation.intent) {
            return self.resolve_conditional(current_step_id, step, interpretation, registry);
        }

        if interpretation.intent == Intent::Next && kind == StepKind::Initial {
            let default_target = StepId::new(format!(
                "continuation.{}",
                current_step_id.domain_suffix().unwrap_or_default()
            ));
            if registry.steps.contains_key(&default_target) {
                return Ok(RoutingResult {
                    next_step_id: Some(default_target),
                    signal_completion: false,
                    reason: String::new(),
                });
            }
            return Ok(RoutingResult {
                next_step_id: None,
                signal_completion: true,
                reason: String::new(),
            });
        }

        Err(OrchestratorError::Routing {
            message: format!(
                "step '{current_step_id}' has no transition configured for intent '{}'",
                interpretation.intent.as_str()
            ),
        })
    }

    /// Resolves `step.transitions[intent]` directly (used for the explicit
    /// `closing`/`escalate` shortcut transitions, which are never
    /// conditional in practice but share the same resolution rules).
    fn route_transition_for(
        &self,
        current_step_id: &StepId,
        step: &crate::registry::Step,
        intent: Intent,
        _handoff_value: Option<&serde_json::Value>,
        registry: &Registry,
    ) -> Result<RoutingResult> {
        let transition = step.transitions.get(&intent).ok_or_else(|| OrchestratorError::Routing {
            message: format!("step '{current_step_id}' has no transition for intent '{}'", intent.as_str()),
        })?;

        self.resolve_transition(current_step_id, transition, &Default::default(), registry)
    }

    /// Resolves the transition configured for `interpretation.intent`,
    /// consulting the interpretation's handoff map for conditional
    /// transitions.
    fn resolve_conditional(
        &self,
        current_step_id: &StepId,
        step: &crate::registry::Step,
        interpretation: &Interpretation,
        registry: &Registry,
    ) -> Result<RoutingResult> {
        let transition = step
            .transitions
            .get(&interpretation.intent)
            .ok_or_else(|| OrchestratorError::Routing {
                message: format!(
                    "step '{current_step_id}' has no transition for intent '{}'",
                    interpretation.intent.as_str()
                ),
            })?;

        self.resolve_transition(current_step_id, transition, &interpretation.handoff, registry)
    }

    fn resolve_transition(
        &self,
        current_step_id: &StepId,
        transition: &Transition,
        handoff: &std::collections::HashMap<String, serde_json::Value>,
        registry: &Registry,
    ) -> Result<RoutingResult> {
        match transition {
            Transition::Complete => Ok(RoutingResult {
                next_step_id: None,
                signal_completion: true,
                reason: String::new(),
            }),
            Transition::Concrete(target) => {
                if !registry.steps.contains_key(target) {
                    return Err(OrchestratorError::Routing {
                        message: format!("transition target '{target}' from '{current_step_id}' is not a known step"),
                    });
                }
                Ok(RoutingResult {
                    next_step_id: Some(target.clone()),
                    signal_completion: false,
                    reason: String::new(),
                })
            }
            Transition::Conditional { condition, targets, default } => {
                let value = handoff.get(condition).map(stringify_condition_value);
                let resolved = value
                    .as_ref()
                    .and_then(|v| targets.get(v))
                    .or(default.as_ref())
                    .ok_or_else(|| OrchestratorError::Routing {
                        message: format!(
                            "conditional transition on '{condition}' from '{current_step_id}' had no matching target and no default"
                        ),
                    })?;

                if !registry.steps.contains_key(resolved) {
                    return Err(OrchestratorError::Routing {
                        message: format!("conditional target '{resolved}' from '{current_step_id}' is not a known step"),
                    });
                }

                Ok(RoutingResult {
                    next_step_id: Some(resolved.clone()),
                    signal_completion: false,
                    reason: String::new(),
                })
            }
        }
    }
}

impl Default for WorkflowRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn stringify_condition_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
