// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! StepFlow CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use stepflow_core::{
    CompletionChain, PromptResolver, QueryExecutor, Registry, Runner, RunnerConfig, SchemaManager,
    SchemaResolver, StepContext, StepId,
};
use stepflow_providers::{AnthropicProvider, OpenAIProvider, Transport};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "stepflow")]
#[command(version, about = "Step-flow orchestration runner for LLM agents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a step registry
    Validate {
        /// Path to the agent directory containing steps_registry.json
        #[arg(value_name = "AGENT_DIR")]
        agent_dir: PathBuf,
    },

    /// Run an agent's step flow to completion
    Run {
        /// Path to the agent directory containing steps_registry.json
        #[arg(value_name = "AGENT_DIR")]
        agent_dir: PathBuf,

        /// Working directory the schemas base is resolved against
        #[arg(long, default_value = ".")]
        working_dir: PathBuf,

        /// Model name to request from the transport
        #[arg(long, default_value = "claude-3-5-sonnet-20241022")]
        model: String,

        /// Transport to use: anthropic or openai
        #[arg(long, default_value = "anthropic")]
        provider: String,

        /// Maximum iterations before aborting
        #[arg(long, default_value_t = 50)]
        max_iterations: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("stepflow={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Validate { agent_dir } => validate(&agent_dir),
        Commands::Run { agent_dir, working_dir, model, provider, max_iterations } => {
            run(&agent_dir, &working_dir, &model, &provider, max_iterations).await
        }
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn validate(agent_dir: &std::path::Path) -> Result<()> {
    info!("Validating step registry in {}", agent_dir.display());
    println!("{} {}", "Validating step registry:".cyan().bold(), agent_dir.display());

    let registry = Registry::load(agent_dir).with_context(|| format!("failed to load registry from {}", agent_dir.display()))?;

    let resolver = SchemaResolver::new(registry.schemas_dir(agent_dir));
    let manager = SchemaManager::new(resolver);
    manager.validate_flow_steps(&registry).with_context(|| "step registry validation failed")?;

    println!("{}", "✓ Step registry is valid".green().bold());
    println!("  Agent: {}", registry.agent_id);
    println!("  Version: {}", registry.version);
    println!("  Steps: {}", registry.steps.len());

    Ok(())
}

async fn run(
    agent_dir: &std::path::Path,
    working_dir: &std::path::Path,
    model: &str,
    provider: &str,
    max_iterations: usize,
) -> Result<()> {
    info!("Running agent in {}", agent_dir.display());
    println!("{} {}", "Running agent:".cyan().bold(), agent_dir.display());

    let registry = Registry::load(agent_dir).with_context(|| format!("failed to load registry from {}", agent_dir.display()))?;

    let resolver = SchemaResolver::new(registry.schemas_dir(working_dir));
    let schema_manager = Arc::new(SchemaManager::new(resolver));

    let transport: Arc<dyn Transport> = match provider {
        "openai" => Arc::new(OpenAIProvider::from_env().with_context(|| "OPENAI_API_KEY not set")?),
        "anthropic" => Arc::new(AnthropicProvider::from_env().with_context(|| "ANTHROPIC_API_KEY not set")?),
        other => anyhow::bail!("unknown provider '{other}'; expected 'anthropic' or 'openai'"),
    };

    let executor = QueryExecutor::new(transport.clone(), Default::default(), 5);
    let completion_chain = CompletionChain::new(schema_manager.clone(), transport, model.to_string(), None, None);

    let config = RunnerConfig { model: model.to_string(), max_iterations, ..Default::default() };

    let runner = Runner::new(
        registry,
        schema_manager,
        executor,
        completion_chain,
        None,
        Arc::new(VariableSubstitutionPrompt::new(HashMap::new())),
        config,
    )
    .with_context(|| "failed to initialize runner")?;

    println!("{}", "Executing step flow...".cyan());
    let outcome = runner.run().await.with_context(|| "step flow execution failed")?;

    println!("{}", "✓ Step flow completed".green().bold());
    println!(
        "{}",
        serde_json::to_string_pretty(&outcome_to_json(&outcome)).unwrap_or_else(|_| format!("{outcome:?}"))
    );

    Ok(())
}

fn outcome_to_json(outcome: &stepflow_core::RunOutcome) -> Value {
    serde_json::json!({
        "runId": outcome.run_id.to_string(),
        "iterations": outcome.iterations,
        "completed": outcome.completed,
        "stepSequence": outcome.step_sequence.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "completionReason": outcome.completion_reason,
    })
}

/// Minimal [`PromptResolver`]: substitutes `${var}` placeholders from a
/// fixed variable map into a per-step template looked up by convention at
/// `<stepId>.prompt.txt` next to the binary's working directory, falling
/// back to a generic instruction when no template file exists.
struct VariableSubstitutionPrompt {
    variables: HashMap<String, String>,
}

impl VariableSubstitutionPrompt {
    fn new(variables: HashMap<String, String>) -> Self {
        Self { variables }
    }

    fn substitute(&self, template: &str) -> String {
        let mut rendered = template.to_string();
        for (key, value) in &self.variables {
            rendered = rendered.replace(&format!("${{{key}}}"), value);
        }
        rendered
    }
}

impl PromptResolver for VariableSubstitutionPrompt {
    fn build_prompt(&self, step_id: &StepId, iteration: usize, _context: &StepContext) -> stepflow_core::Result<String> {
        let template_path = format!("{step_id}.prompt.txt");
        let template = std::fs::read_to_string(&template_path)
            .unwrap_or_else(|_| format!("Continue the flow for step '{step_id}' (iteration {iteration})."));
        Ok(self.substitute(&template))
    }
}
