// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The single surface through which externally visible side effects
//! (closing an issue, merging a PR, publishing a release) are invoked.

use crate::error::Result;
use crate::events::{Event, EventEmitter};
use crate::registry::StepId;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Payload delivered to the injected boundary handler.
#[derive(Debug, Clone)]
pub struct BoundaryPayload {
    pub step_id: StepId,
    pub structured_output: Option<Value>,
}

/// The injected implementation of the actual external effect.
#[async_trait]
pub trait BoundaryHandler: Send + Sync {
    async fn handle(&self, payload: BoundaryPayload) -> Result<()>;
}

/// Fires only when a closure step's validated `closing` intent reaches it.
/// No other call path may trigger external side effects.
pub struct BoundaryHook {
    handler: Arc<dyn BoundaryHandler>,
}

impl BoundaryHook {
    pub fn new(handler: Arc<dyn BoundaryHandler>) -> Self {
        Self { handler }
    }

    /// Invokes the boundary handler, emitting `boundaryHook` on `events`
    /// first.
    pub async fn invoke(
        &self,
        step_id: &StepId,
        structured_output: Option<Value>,
        events: &EventEmitter,
    ) -> Result<()> {
        let payload = BoundaryPayload {
            step_id: step_id.clone(),
            structured_output,
        };

        events.emit(&Event::BoundaryHook {
            step_id: step_id.clone(),
            step_kind: "closure".to_string(),
        });

        self.handler.handle(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingHandler(AtomicBool);

    #[async_trait]
    impl BoundaryHandler for RecordingHandler {
        async fn handle(&self, payload: BoundaryPayload) -> Result<()> {
            self.0.store(true, Ordering::SeqCst);
            assert_eq!(payload.step_id, StepId::new("closure.issue"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn invoke_delegates_to_handler_and_emits_event() {
        let handler = Arc::new(RecordingHandler(AtomicBool::new(false)));
        let hook = BoundaryHook::new(handler.clone());
        let events = EventEmitter::new();

        hook.invoke(&StepId::new("closure.issue"), None, &events).await.unwrap();
        assert!(handler.0.load(Ordering::SeqCst));
    }
}
