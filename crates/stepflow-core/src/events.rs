// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed observer hooks. Handler errors (including panics) are logged and
//! never propagated or allowed to reorder sibling handlers.

use crate::registry::StepId;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// One of the observable points in a run, per the runner's event contract.
#[derive(Debug, Clone)]
pub enum Event {
    Initialized,
    IterationStart { iteration: usize, step_id: StepId },
    IterationEnd { iteration: usize, step_id: StepId },
    PromptBuilt { iteration: usize, step_id: StepId },
    QueryExecuted { iteration: usize, step_id: StepId },
    CompletionChecked { step_id: StepId, valid: bool },
    StateChange { from: StepId, to: StepId },
    BoundaryHook { step_id: StepId, step_kind: String },
    Error { message: String, recoverable: bool },
    Completed { iterations: usize },
}

/// A registered handler. Boxed so [`EventEmitter`] can hold a
/// heterogeneous, append-only list.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Dispatches [`Event`]s to registered handlers in registration order,
/// sequentially, within a single-threaded run. A handler that errors or
/// panics is logged and does not stop the remaining handlers or abort the
/// caller.
#[derive(Default)]
pub struct EventEmitter {
    handlers: RwLock<Vec<Handler>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.handlers.write().push(Arc::new(handler));
    }

    pub fn emit(&self, event: &Event) {
        for handler in self.handlers.read().iter() {
            let handler = handler.clone();
            let result = catch_unwind(AssertUnwindSafe(|| handler(event)));
            if let Err(panic) = result {
                let message = panic_message(&panic);
                error!(%message, "event handler panicked; continuing");
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
