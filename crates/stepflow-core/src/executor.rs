// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One-shot LLM interaction: builds the request, enforces tool policy,
//! streams transport messages into an [`IterationSummary`], and retries
//! rate-limited requests with exponential backoff.

use crate::classify;
use crate::error::{OrchestratorError, Result};
use crate::registry::StepKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stepflow_providers::{ProviderError, QueryRequest, Transport, TransportMessage};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exponential backoff base delay for rate-limited retries.
pub const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_millis(5_000);
/// Exponential backoff cap for rate-limited retries.
pub const RATE_LIMIT_MAX_DELAY: Duration = Duration::from_millis(60_000);

/// A rate-limit retry the executor performed before returning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRetry {
    pub attempt: u32,
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub wait: Duration,
}

/// Per-iteration outcome of a single LLM request/response cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: usize,
    pub session_id: Option<String>,
    pub assistant_responses: Vec<String>,
    pub tools_used: Vec<String>,
    pub structured_output: Option<Value>,
    pub errors: Vec<String>,
    pub schema_resolution_failed: bool,
    pub rate_limit_retry: Option<RateLimitRetry>,
    pub cost_usd: f64,
    pub started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub duration: Duration,
}

impl IterationSummary {
    fn empty(iteration: usize) -> Self {
        Self {
            iteration,
            session_id: None,
            assistant_responses: Vec::new(),
            tools_used: Vec::new(),
            structured_output: None,
            errors: Vec::new(),
            schema_resolution_failed: false,
            rate_limit_retry: None,
            cost_usd: 0.0,
            started_at: Utc::now(),
            duration: Duration::from_millis(0),
        }
    }
}

/// Serializes a [`Duration`] as whole milliseconds, matching the teacher's
/// wire format for step durations.
fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// A step kind's tool capability set: which tools are allowed, and whether
/// boundary-affecting bash commands are denied outright.
#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
    pub allowed_tools: Vec<String>,
    pub block_boundary_bash: bool,
    pub denied_command_patterns: Vec<String>,
}

impl ToolPolicy {
    /// Returns a denial reason when `command` is blocked under this policy.
    pub fn check_bash_command(&self, command: &str) -> Option<String> {
        if !self.block_boundary_bash {
            return None;
        }
        self.denied_command_patterns
            .iter()
            .find(|pattern| command.contains(pattern.as_str()))
            .map(|pattern| format!("command '{command}' matches denied pattern '{pattern}'"))
    }
}

/// Registry of [`ToolPolicy`] by step kind.
#[derive(Debug, Clone, Default)]
pub struct ToolPolicies(HashMap<StepKind, ToolPolicy>);

impl ToolPolicies {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn insert(&mut self, kind: StepKind, policy: ToolPolicy) {
        self.0.insert(kind, policy);
    }

    pub fn for_kind(&self, kind: StepKind) -> Option<&ToolPolicy> {
        self.0.get(&kind)
    }

    /// Filters `requested` tools by `kind`'s allow-list; an unconfigured
    /// kind permits everything requested.
    pub fn filter_allowed(&self, kind: StepKind, requested: &[String]) -> Vec<String> {
        match self.for_kind(kind) {
            Some(policy) => requested
                .iter()
                .filter(|tool| policy.allowed_tools.iter().any(|allowed| allowed == *tool))
                .cloned()
                .collect(),
            None => requested.to_vec(),
        }
    }
}

/// Single request/response cycle with the LLM transport, not cancellable
/// mid-message.
pub struct QueryExecutor {
    transport: Arc<dyn Transport>,
    tool_policies: ToolPolicies,
    max_rate_limit_retries: u32,
}

impl QueryExecutor {
    pub fn new(transport: Arc<dyn Transport>, tool_policies: ToolPolicies, max_rate_limit_retries: u32) -> Self {
        Self {
            transport,
            tool_policies,
            max_rate_limit_retries,
        }
    }

    /// Runs one iteration: filters tools by `step_kind`'s policy, attaches
    /// `output_schema` if present, streams the reply, and retries on
    /// rate-limit errors with exponential backoff. `cancellation` aborts an
    /// in-flight query at the next cooperative point (the wait for the
    /// transport's reply, or a rate-limit backoff sleep); a cancelled query
    /// surfaces as a recoverable `QueryError` carrying whatever partial
    /// summary had accumulated.
    pub async fn execute(
        &self,
        mut request: QueryRequest,
        iteration: usize,
        step_kind: StepKind,
        requested_tools: &[String],
        output_schema: Option<Value>,
        schema_resolution_failed: bool,
        cancellation: &CancellationToken,
    ) -> Result<IterationSummary> {
        if schema_resolution_failed {
            let mut summary = IterationSummary::empty(iteration);
            summary.schema_resolution_failed = true;
            summary.errors.push("schema resolution failed; iteration proceeds unvalidated".to_string());
            return Ok(summary);
        }

        let effective_tools = self.tool_policies.filter_allowed(step_kind, requested_tools);
        request
            .extra
            .insert("allowedTools".to_string(), serde_json::json!(effective_tools));
        if let Some(policy) = self.tool_policies.for_kind(step_kind) {
            if policy.block_boundary_bash {
                request.extra.insert(
                    "boundaryBashDenyPatterns".to_string(),
                    serde_json::json!(policy.denied_command_patterns),
                );
            }
        }
        let had_schema = output_schema.is_some();
        request.output_schema = output_schema;

        let mut attempt: u32 = 0;
        let mut delay = RATE_LIMIT_BASE_DELAY;

        loop {
            if cancellation.is_cancelled() {
                return Err(self.cancelled(iteration));
            }

            let started = std::time::Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    return Err(self.cancelled(iteration));
                }
                result = self.transport.query(request.clone()) => result,
            };

            match outcome {
                Ok(messages) => {
                    let mut summary = self.summarize(messages, iteration, had_schema, step_kind);
                    summary.duration = started.elapsed();
                    if attempt > 0 {
                        summary.rate_limit_retry = Some(RateLimitRetry { attempt, wait: delay });
                    }
                    return Ok(summary);
                }
                Err(err) => {
                    if classify::is_rate_limit(&err.to_string()) {
                        attempt += 1;
                        if attempt > self.max_rate_limit_retries {
                            return Err(OrchestratorError::RateLimit { retry_after: delay });
                        }
                        warn!(%attempt, wait_ms = delay.as_millis(), "rate limited, backing off");
                        tokio::select! {
                            biased;
                            _ = cancellation.cancelled() => return Err(self.cancelled(iteration)),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        delay = (delay * 2).min(RATE_LIMIT_MAX_DELAY);
                        continue;
                    }
                    return Err(self.classify_transport_error(err));
                }
            }
        }
    }

    /// Builds the recoverable, partial-summary-carrying error returned when
    /// `cancellation` fires mid-iteration.
    fn cancelled(&self, iteration: usize) -> OrchestratorError {
        let mut summary = IterationSummary::empty(iteration);
        summary.errors.push("query aborted via cancellation token".to_string());
        warn!(iteration, "query cancelled mid-flight; surfacing partial summary");
        OrchestratorError::Query {
            message: "query cancelled".to_string(),
            partial: Some(Box::new(summary)),
        }
    }

    fn classify_transport_error(&self, err: ProviderError) -> OrchestratorError {
        let message = err.to_string();
        let classification = classify::classify(&message);
        info!(
            category = classification.category.as_str(),
            recoverable = classification.recoverable,
            %message,
            "transport error classified"
        );
        OrchestratorError::Query { message, partial: None }
    }

    fn summarize(
        &self,
        messages: Vec<TransportMessage>,
        iteration: usize,
        had_schema: bool,
        step_kind: StepKind,
    ) -> IterationSummary {
        let mut summary = IterationSummary::empty(iteration);
        let policy = self.tool_policies.for_kind(step_kind);

        for message in messages {
            match message {
                TransportMessage::Assistant { text } => summary.assistant_responses.push(text),
                TransportMessage::ToolUse { name, input } => {
                    if let Some(policy) = policy {
                        if let Some(command) = input.get("command").and_then(Value::as_str) {
                            if let Some(reason) = policy.check_bash_command(command) {
                                warn!(%name, %command, "boundary bash command denied by tool policy");
                                summary.errors.push(format!("denied tool use '{name}': {reason}"));
                            }
                        }
                    }
                    summary.tools_used.push(name);
                }
                TransportMessage::Result {
                    session_id,
                    structured_output,
                    cost_usd,
                    duration_ms,
                    ..
                } => {
                    summary.session_id = Some(session_id);
                    summary.cost_usd = cost_usd.unwrap_or(0.0);
                    summary.duration = Duration::from_millis(duration_ms);
                    summary.structured_output = structured_output;
                }
                TransportMessage::Error { message } => summary.errors.push(message),
            }
        }

        if had_schema && summary.structured_output.is_none() {
            warn!(iteration, "result message carried no structuredOutput though an output schema was attached");
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_request() -> QueryRequest {
        QueryRequest {
            model: "test-model".to_string(),
            prompt: "hi".to_string(),
            system: None,
            session_id: None,
            temperature: None,
            max_tokens: None,
            output_schema: None,
            extra: HashMap::new(),
        }
    }

    struct FlakyTransport {
        calls: AtomicUsize,
        fail_times: usize,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn query(&self, _request: QueryRequest) -> std::result::Result<Vec<TransportMessage>, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                return Err(ProviderError::RateLimitExceeded);
            }
            Ok(vec![TransportMessage::Result {
                session_id: "sess-1".to_string(),
                structured_output: Some(serde_json::json!({"next_action": {"action": "next"}})),
                cost_usd: Some(0.01),
                num_turns: 1,
                duration_ms: 5,
            }])
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    struct StallingTransport;

    #[async_trait]
    impl Transport for StallingTransport {
        async fn query(&self, _request: QueryRequest) -> std::result::Result<Vec<TransportMessage>, ProviderError> {
            std::future::pending::<()>().await;
            unreachable!("pending future never resolves")
        }

        fn name(&self) -> &str {
            "stalling"
        }
    }

    struct BashToolTransport;

    #[async_trait]
    impl Transport for BashToolTransport {
        async fn query(&self, _request: QueryRequest) -> std::result::Result<Vec<TransportMessage>, ProviderError> {
            Ok(vec![
                TransportMessage::ToolUse {
                    name: "bash".to_string(),
                    input: serde_json::json!({"command": "rm -rf /tmp/work"}),
                },
                TransportMessage::Result {
                    session_id: "sess-1".to_string(),
                    structured_output: Some(serde_json::json!({"next_action": {"action": "closing"}})),
                    cost_usd: Some(0.0),
                    num_turns: 1,
                    duration_ms: 1,
                },
            ])
        }

        fn name(&self) -> &str {
            "bash-tool"
        }
    }

    #[tokio::test]
    async fn short_circuits_when_schema_resolution_failed() {
        let transport = Arc::new(FlakyTransport { calls: AtomicUsize::new(0), fail_times: 0 });
        let executor = QueryExecutor::new(transport, ToolPolicies::new(), 3);
        let summary = executor
            .execute(sample_request(), 1, StepKind::Initial, &[], None, true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(summary.schema_resolution_failed);
        assert!(summary.structured_output.is_none());
    }

    #[tokio::test]
    async fn retries_rate_limit_then_succeeds() {
        let transport = Arc::new(FlakyTransport { calls: AtomicUsize::new(0), fail_times: 1 });
        let executor = QueryExecutor::new(transport, ToolPolicies::new(), 3);
        let summary = executor
            .execute(sample_request(), 1, StepKind::Initial, &[], None, false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(summary.rate_limit_retry.is_some());
        assert_eq!(summary.session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn exhausting_retries_raises_rate_limit_error() {
        let transport = Arc::new(FlakyTransport { calls: AtomicUsize::new(0), fail_times: 10 });
        let executor = QueryExecutor::new(transport, ToolPolicies::new(), 1);
        let err = executor
            .execute(sample_request(), 1, StepKind::Initial, &[], None, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::RateLimit { .. }));
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_query_with_partial_summary() {
        let transport = Arc::new(StallingTransport);
        let executor = QueryExecutor::new(transport, ToolPolicies::new(), 3);
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let err = executor
            .execute(sample_request(), 1, StepKind::Initial, &[], None, false, &cancellation)
            .await
            .unwrap_err();

        match err {
            OrchestratorError::Query { partial: Some(summary), .. } => {
                assert_eq!(summary.iteration, 1);
                assert!(!summary.errors.is_empty());
            }
            other => panic!("expected a cancelled Query error with a partial summary, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn boundary_bash_command_is_denied_and_recorded_as_error() {
        let mut policies = ToolPolicies::new();
        policies.insert(
            StepKind::Closure,
            ToolPolicy {
                allowed_tools: vec!["bash".to_string()],
                block_boundary_bash: true,
                denied_command_patterns: vec!["rm -rf".to_string()],
            },
        );
        let transport = Arc::new(BashToolTransport);
        let executor = QueryExecutor::new(transport, policies, 3);

        let summary = executor
            .execute(
                sample_request(),
                1,
                StepKind::Closure,
                &["bash".to_string()],
                None,
                false,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(summary.tools_used.contains(&"bash".to_string()));
        assert!(summary.errors.iter().any(|e| e.contains("denied tool use 'bash'")));
    }

    #[test]
    fn tool_policy_filters_disallowed_tools() {
        let mut policies = ToolPolicies::new();
        policies.insert(
            StepKind::Closure,
            ToolPolicy {
                allowed_tools: vec!["read_file".to_string()],
                block_boundary_bash: true,
                denied_command_patterns: vec!["rm -rf".to_string()],
            },
        );
        let filtered = policies.filter_allowed(
            StepKind::Closure,
            &["read_file".to_string(), "bash".to_string()],
        );
        assert_eq!(filtered, vec!["read_file".to_string()]);

        let policy = policies.for_kind(StepKind::Closure).unwrap();
        assert!(policy.check_bash_command("rm -rf /").is_some());
        assert!(policy.check_bash_command("ls").is_none());
    }
}
