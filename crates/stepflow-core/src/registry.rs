// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The step registry data model: steps, gates, transitions, and the JSON
//! document (`steps_registry.json`) they are loaded from.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// A step id of the form `<kind>.<domain>`, e.g. `initial.issue`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `<kind>` portion before the first `.`.
    pub fn kind_prefix(&self) -> Option<&str> {
        self.0.split('.').next()
    }

    /// The `<domain>` portion after the first `.`, if present.
    pub fn domain_suffix(&self) -> Option<&str> {
        self.0.split_once('.').map(|(_, rest)| rest)
    }

    /// Whether this is a template step (`section.*`), exempt from the
    /// structured-gate/transitions/schema-ref invariant.
    pub fn is_template(&self) -> bool {
        self.kind_prefix() == Some("section")
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StepId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The kind prefix of a step id. Governs which intents are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Initial,
    Continuation,
    Closure,
    Verification,
}

impl StepKind {
    /// Derives the kind from a step id's `<kind>` prefix. Unknown prefixes
    /// are treated as `Continuation` (a generic work step), matching
    /// `WorkflowRouter`'s "unknown-kind work" handling of `handoff`.
    pub fn from_step_id(id: &StepId) -> Self {
        match id.kind_prefix() {
            Some("initial") => Self::Initial,
            Some("closure") => Self::Closure,
            Some("verification") => Self::Verification,
            _ => Self::Continuation,
        }
    }
}

/// The bounded set of intents a gate may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Next,
    Repeat,
    Jump,
    Closing,
    Handoff,
    Abort,
    Escalate,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Next => "next",
            Self::Repeat => "repeat",
            Self::Jump => "jump",
            Self::Closing => "closing",
            Self::Handoff => "handoff",
            Self::Abort => "abort",
            Self::Escalate => "escalate",
        }
    }
}

/// A reference to a schema inside a schemas-base directory: a file and a
/// name/pointer within it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaRef {
    pub file: String,
    pub schema: String,
}

impl std::fmt::Display for SchemaRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.file, self.schema)
    }
}

/// Per-step gate configuration (spec §3 "Gate configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateConfig {
    pub allowed_intents: HashSet<Intent>,
    pub intent_field: String,
    pub intent_schema_ref: SchemaRef,
    #[serde(default)]
    pub target_field: Option<String>,
    #[serde(default)]
    pub handoff_fields: Vec<String>,
    #[serde(default = "default_true")]
    pub fail_fast: bool,
    #[serde(default)]
    pub fallback_intent: Option<Intent>,
}

fn default_true() -> bool {
    true
}

/// A transition target: either a concrete step, completion, or a
/// handoff-conditioned branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Transition {
    /// Signal completion (`null` target in the JSON document).
    Complete,
    /// A concrete next step.
    Concrete(StepId),
    /// Consult `handoff[condition]` to pick among `targets`, falling back
    /// to `default` when the value is unrecognized.
    Conditional {
        condition: String,
        targets: HashMap<String, StepId>,
        #[serde(default)]
        default: Option<StepId>,
    },
}

/// A single step definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub structured_gate: Option<GateConfig>,
    #[serde(default)]
    pub transitions: HashMap<Intent, Transition>,
    #[serde(default)]
    pub output_schema_ref: Option<SchemaRef>,
}

/// A closure-step completion-validation record consulted by `CompletionChain`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionStep {
    #[serde(default)]
    pub output_schema: Option<SchemaRef>,
    #[serde(default)]
    pub completion_conditions: Vec<String>,
}

/// The top-level step registry document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    pub agent_id: String,
    pub version: String,
    #[serde(default)]
    pub c1: serde_json::Value,
    pub steps: HashMap<StepId, Step>,
    #[serde(default)]
    pub schemas_base: Option<String>,
    #[serde(default)]
    pub entry_step: Option<StepId>,
    #[serde(default)]
    pub entry_step_mapping: Option<HashMap<String, StepId>>,
    #[serde(default)]
    pub completion_patterns: HashMap<String, String>,
    #[serde(default)]
    pub validators: Vec<String>,
    #[serde(default)]
    pub completion_steps: HashMap<StepId, CompletionStep>,
}

impl Registry {
    /// Loads and parses `<agent_dir>/steps_registry.json`.
    pub fn load(agent_dir: &Path) -> Result<Self> {
        let path = agent_dir.join("steps_registry.json");
        let content = std::fs::read_to_string(&path).map_err(|err| OrchestratorError::Environment {
            message: format!("failed to read registry at {}: {err}", path.display()),
        })?;

        serde_json::from_str(&content).map_err(|err| OrchestratorError::Environment {
            message: format!("failed to parse registry at {}: {err}", path.display()),
        })
    }

    /// Resolves the schemas directory: `schemasBase` if set, else
    /// `.agent/<agent_id>/schemas`, joined against `working_dir`.
    pub fn schemas_dir(&self, working_dir: &Path) -> PathBuf {
        match &self.schemas_base {
            Some(base) => working_dir.join(base),
            None => working_dir.join(".agent").join(&self.agent_id).join("schemas"),
        }
    }

    /// Looks up the entry step for iteration 1, consulting
    /// `entry_step_mapping[completion_type]` before falling back to
    /// `entry_step`.
    pub fn entry_step_for(&self, completion_type: Option<&str>) -> Result<StepId> {
        if let (Some(ty), Some(mapping)) = (completion_type, &self.entry_step_mapping) {
            if let Some(step) = mapping.get(ty) {
                return Ok(step.clone());
            }
        }

        self.entry_step.clone().ok_or_else(|| OrchestratorError::Environment {
            message: "registry has neither a matching entryStepMapping entry nor an entryStep".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "agentId": "issue-agent",
            "version": "1.0.0",
            "c1": {},
            "entryStep": "initial.test",
            "steps": {
                "initial.test": {
                    "name": "Initial",
                    "structuredGate": {
                        "allowedIntents": ["next", "handoff"],
                        "intentField": "next_action.action",
                        "intentSchemaRef": {"file": "steps.json", "schema": "Intent"}
                    },
                    "transitions": {},
                    "outputSchemaRef": {"file": "steps.json", "schema": "InitialOutput"}
                }
            }
        }"#
    }

    #[test]
    fn parses_registry_document() {
        let registry: Registry = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(registry.agent_id, "issue-agent");
        assert_eq!(registry.entry_step, Some(StepId::new("initial.test")));
        assert!(registry.steps.contains_key(&StepId::new("initial.test")));
    }

    #[test]
    fn step_id_kind_and_domain() {
        let id = StepId::new("continuation.issue");
        assert_eq!(id.kind_prefix(), Some("continuation"));
        assert_eq!(id.domain_suffix(), Some("issue"));
        assert!(!id.is_template());
        assert!(StepId::new("section.intro").is_template());
    }

    #[test]
    fn step_kind_from_step_id() {
        assert_eq!(StepKind::from_step_id(&StepId::new("initial.issue")), StepKind::Initial);
        assert_eq!(StepKind::from_step_id(&StepId::new("closure.issue")), StepKind::Closure);
        assert_eq!(
            StepKind::from_step_id(&StepId::new("verification.issue")),
            StepKind::Verification
        );
        assert_eq!(StepKind::from_step_id(&StepId::new("s_review")), StepKind::Continuation);
    }

    #[test]
    fn schemas_dir_defaults_under_dot_agent() {
        let registry: Registry = serde_json::from_str(sample_json()).unwrap();
        let dir = registry.schemas_dir(Path::new("/work"));
        assert_eq!(dir, PathBuf::from("/work/.agent/issue-agent/schemas"));
    }

    #[test]
    fn entry_step_mapping_takes_priority() {
        let mut registry: Registry = serde_json::from_str(sample_json()).unwrap();
        let mut mapping = HashMap::new();
        mapping.insert("bugfix".to_string(), StepId::new("initial.bugfix"));
        registry.entry_step_mapping = Some(mapping);

        assert_eq!(
            registry.entry_step_for(Some("bugfix")).unwrap(),
            StepId::new("initial.bugfix")
        );
        assert_eq!(
            registry.entry_step_for(Some("unknown")).unwrap(),
            StepId::new("initial.test")
        );
        assert_eq!(registry.entry_step_for(None).unwrap(), StepId::new("initial.test"));
    }
}
