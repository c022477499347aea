// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-step key→value accumulation across iterations (the handoff store).

use crate::registry::StepId;
use dashmap::DashMap;
use serde_json::Value;

/// Maps `stepId -> (key -> value)`, written once per iteration and read by
/// later steps. Entries accumulate monotonically; existing keys are
/// overwritten only by a later iteration recording the same step again
/// (e.g. after `repeat`).
#[derive(Default)]
pub struct StepContext {
    entries: DashMap<StepId, DashMap<String, Value>>,
}

impl StepContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `fields` into `step_id`'s entry, creating it if absent.
    pub fn record(&self, step_id: &StepId, fields: impl IntoIterator<Item = (String, Value)>) {
        let bucket = self.entries.entry(step_id.clone()).or_default();
        for (key, value) in fields {
            bucket.insert(key, value);
        }
    }

    /// Reads a single key from `step_id`'s entry, if both exist.
    pub fn get(&self, step_id: &StepId, key: &str) -> Option<Value> {
        self.entries.get(step_id).and_then(|bucket| bucket.get(key).map(|v| v.clone()))
    }

    /// Snapshots all keys recorded for `step_id`.
    pub fn snapshot(&self, step_id: &StepId) -> std::collections::HashMap<String, Value> {
        self.entries
            .get(step_id)
            .map(|bucket| bucket.iter().map(|entry| (entry.key().clone(), entry.value().clone())).collect())
            .unwrap_or_default()
    }

    pub fn contains_step(&self, step_id: &StepId) -> bool {
        self.entries.contains_key(step_id)
    }
}
