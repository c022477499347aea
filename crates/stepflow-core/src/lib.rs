// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The step-flow orchestration core: drives an LLM through a bounded
//! sequence of steps, from schema-constrained structured output through
//! gate interpretation, routing, completion validation, and the single
//! boundary-hook surface for externally visible effects.

pub mod boundary;
pub mod classify;
pub mod completion;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod gate;
pub mod orchestrator;
pub mod ports;
pub mod registry;
pub mod router;
pub mod runner;
pub mod schema;

pub use boundary::{BoundaryHandler, BoundaryHook, BoundaryPayload};
pub use completion::{CompletionChain, CompletionOutcome};
pub use context::StepContext;
pub use error::{OrchestratorError, Result};
pub use events::{Event, EventEmitter};
pub use executor::{IterationSummary, QueryExecutor, RateLimitRetry, ToolPolicies, ToolPolicy};
pub use gate::{GateInterpreter, Interpretation};
pub use orchestrator::FlowOrchestrator;
pub use ports::{CompletionValidator, PromptResolver, RetryHandler, ValidationOutcome};
pub use registry::{GateConfig, Intent, Registry, SchemaRef, Step, StepId, StepKind, Transition};
pub use router::{RoutingResult, WorkflowRouter};
pub use runner::{Runner, RunOutcome, RunnerConfig};
pub use schema::{SchemaManager, SchemaPointerError, SchemaResolver};

/// Crate version, re-exported for diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
