// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The outer loop: builds prompts, invokes the executor, runs the
//! completion chain, and bounds iterations.

use crate::boundary::BoundaryHook;
use crate::completion::CompletionChain;
use crate::error::{OrchestratorError, Result};
use crate::events::{Event, EventEmitter};
use crate::executor::QueryExecutor;
use crate::orchestrator::FlowOrchestrator;
use crate::ports::PromptResolver;
use crate::registry::{Registry, StepId, StepKind};
use crate::schema::SchemaManager;
use std::sync::Arc;
use stepflow_providers::QueryRequest;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Configuration the runner needs beyond what the registry itself carries.
pub struct RunnerConfig {
    pub model: String,
    pub max_iterations: usize,
    pub completion_type: Option<String>,
    pub requested_tools: Vec<String>,
    pub routing_enabled: bool,
    pub max_rate_limit_retries: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            model: "default-model".to_string(),
            max_iterations: 50,
            completion_type: None,
            requested_tools: Vec::new(),
            routing_enabled: true,
            max_rate_limit_retries: 5,
        }
    }
}

/// The final outcome of a completed (or aborted) run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub iterations: usize,
    pub completed: bool,
    pub step_sequence: Vec<StepId>,
    pub completion_reason: Option<String>,
}

/// Ties every component together into the outer iteration loop.
pub struct Runner {
    registry: Registry,
    schema_manager: Arc<SchemaManager>,
    orchestrator: FlowOrchestrator,
    executor: QueryExecutor,
    completion_chain: CompletionChain,
    boundary_hook: Option<BoundaryHook>,
    events: EventEmitter,
    prompt_resolver: Arc<dyn PromptResolver>,
    config: RunnerConfig,
    cancellation: CancellationToken,
}

impl Runner {
    pub fn new(
        registry: Registry,
        schema_manager: Arc<SchemaManager>,
        executor: QueryExecutor,
        completion_chain: CompletionChain,
        boundary_hook: Option<BoundaryHook>,
        prompt_resolver: Arc<dyn PromptResolver>,
        config: RunnerConfig,
    ) -> Result<Self> {
        schema_manager.validate_flow_steps(&registry)?;

        Ok(Self {
            registry,
            schema_manager,
            orchestrator: FlowOrchestrator::new(),
            executor,
            completion_chain,
            boundary_hook,
            events: EventEmitter::new(),
            prompt_resolver,
            config,
            cancellation: CancellationToken::new(),
        })
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// A handle callers can use to abort an in-flight `run()` from outside
    /// the loop; cancelling it surfaces as a recoverable query error on the
    /// iteration in flight.
    pub fn cancellation_handle(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub async fn run(&self) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        self.events.emit(&Event::Initialized);

        let mut step_sequence = Vec::new();
        let mut session_id: Option<String> = None;
        let mut pending_retry_prompt: Option<String> = None;
        let mut iteration = 1usize;

        loop {
            if iteration > self.config.max_iterations {
                return Err(OrchestratorError::MaxIterations { max_iterations: self.config.max_iterations });
            }

            let step_id = self.orchestrator.get_step_id_for_iteration(
                iteration,
                &self.registry,
                self.config.completion_type.as_deref(),
            )?;
            step_sequence.push(step_id.clone());
            self.events.emit(&Event::IterationStart { iteration, step_id: step_id.clone() });

            let prompt = match pending_retry_prompt.take() {
                Some(retry_prompt) => retry_prompt,
                None => self.prompt_resolver.build_prompt(&step_id, iteration, self.orchestrator.context())?,
            };
            self.events.emit(&Event::PromptBuilt { iteration, step_id: step_id.clone() });

            let step_kind = StepKind::from_step_id(&step_id);
            let schema = self.schema_manager.load_schema_for_step(&self.registry, &step_id)?;
            let schema_resolution_failed = schema.is_none()
                && self.registry.steps.get(&step_id).and_then(|s| s.output_schema_ref.as_ref()).is_some();

            let request = QueryRequest {
                model: self.config.model.clone(),
                prompt,
                system: None,
                session_id: session_id.clone(),
                temperature: None,
                max_tokens: None,
                output_schema: None,
                extra: Default::default(),
            };

            let mut summary = self
                .executor
                .execute(
                    request,
                    iteration,
                    step_kind,
                    &self.config.requested_tools,
                    schema,
                    schema_resolution_failed,
                    &self.cancellation,
                )
                .await?;
            self.events.emit(&Event::QueryExecuted { iteration, step_id: step_id.clone() });

            if let Some(output) = summary.structured_output.as_mut() {
                self.orchestrator.normalize_structured_output_step_id(&step_id, output);
            }
            session_id = summary.session_id.clone().or(session_id);
            self.orchestrator.record_step_output(&step_id, &summary);

            if !summary.errors.is_empty() {
                for message in &summary.errors {
                    self.events.emit(&Event::Error { message: message.clone(), recoverable: true });
                }
            }

            let routing = self.orchestrator.handle_step_transition(
                &step_id,
                &summary,
                &self.registry,
                self.config.routing_enabled,
            )?;

            match routing {
                Some(result) if result.signal_completion => {
                    let outcome = self.completion_chain.validate(&step_id, &self.registry).await?;
                    self.events.emit(&Event::CompletionChecked { step_id: step_id.clone(), valid: outcome.valid });

                    if !outcome.valid {
                        pending_retry_prompt = outcome.retry_prompt;
                        iteration += 1;
                        continue;
                    }

                    if step_kind == StepKind::Closure {
                        if let Some(hook) = &self.boundary_hook {
                            hook.invoke(&step_id, summary.structured_output.clone(), &self.events).await?;
                        }
                    }

                    self.events.emit(&Event::IterationEnd { iteration, step_id: step_id.clone() });
                    self.events.emit(&Event::Completed { iterations: iteration });
                    return Ok(RunOutcome {
                        run_id,
                        iterations: iteration,
                        completed: true,
                        step_sequence,
                        completion_reason: result.reason.is_empty().then(|| None).unwrap_or(Some(result.reason)),
                    });
                }
                Some(result) => {
                    info!(%step_id, next = %result.next_step_id.as_ref().map(ToString::to_string).unwrap_or_default(), "routed");
                    if let Some(next) = &result.next_step_id {
                        if next != &step_id {
                            self.events.emit(&Event::StateChange { from: step_id.clone(), to: next.clone() });
                        }
                    }
                }
                None => {
                    if iteration > 1 && !summary.schema_resolution_failed && self.config.routing_enabled {
                        return Err(OrchestratorError::Routing {
                            message: format!(
                                "[StepFlow] No intent produced for iteration {iteration} on step \"{step_id}\""
                            ),
                        });
                    }
                }
            }

            self.events.emit(&Event::IterationEnd { iteration, step_id });
            iteration += 1;
        }
    }
}
