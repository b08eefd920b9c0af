//! ABOUTME: Batch-parallel execution engine driving a built Workflow to completion
//! ABOUTME: condition gating, MCP/custom dispatch, per-step timeout + retry, stop-on-error

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mcpflow_context::WorkflowContext;
use mcpflow_core::condition::{evaluate, evaluate_value, Environment};
use mcpflow_core::{serializable, RetryPolicy, Value};
use mcpflow_session::SessionManager;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

use crate::builder::Workflow;
use crate::model::{StepKind, WorkflowResult, WorkflowStatus, WorkflowStep};

/// Runtime status of one step within a single execution. Kept out of
/// [`WorkflowStep`] itself, per the immutability contract documented on that
/// type: one built workflow can be driven through [`ExecutionEngine::execute`]
/// any number of times, including concurrently, without state bleeding
/// between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Per-run outcome of one step, keyed by step id in a transient map that dies
/// with the `execute` call that produced it.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Drives an immutable [`Workflow`] to completion against a shared
/// [`WorkflowContext`], routing MCP tool calls through a [`SessionManager`].
/// Never panics out of [`ExecutionEngine::execute`] on step failure: every
/// failure is recorded into the returned [`WorkflowResult`] instead.
pub struct ExecutionEngine {
    session_manager: Arc<SessionManager>,
}

impl ExecutionEngine {
    #[must_use]
    pub fn new(session_manager: Arc<SessionManager>) -> Self {
        Self { session_manager }
    }

    /// Runs every execution batch of `workflow` in sequence, dispatching up
    /// to `config.max_parallel_steps` steps concurrently within one batch.
    /// When `config.stop_on_error` is set and a batch contains a failure, no
    /// further batches are started; steps already in flight run to
    /// completion first (no already-started step is cancelled mid-flight).
    pub async fn execute(&self, workflow: &Workflow, context: Arc<WorkflowContext>) -> WorkflowResult {
        let config = workflow.config().clone();
        let start_time = Utc::now();
        let outcomes: Arc<DashMap<String, StepOutcome>> = Arc::new(DashMap::new());

        let mut errors: Vec<String> = Vec::new();
        let mut failed_step_ids: Vec<String> = Vec::new();

        'batches: for batch in workflow.execution_batches() {
            let permits = config.max_parallel_steps.min(batch.len()).max(1);
            let semaphore = Arc::new(Semaphore::new(permits));
            let mut joinset: JoinSet<(String, StepOutcome)> = JoinSet::new();

            for step_id in batch {
                let step = workflow
                    .step_by_id(step_id)
                    .expect("execution batches are derived from this workflow's own steps")
                    .clone();
                let semaphore = semaphore.clone();
                let context = context.clone();
                let outcomes = outcomes.clone();
                let session_manager = self.session_manager.clone();
                let base_delay_seconds = config.retry_base_delay_seconds;

                joinset.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed while its batch runs");
                    let id = step.id.clone();
                    let outcome = run_step(&step, &context, &outcomes, &session_manager, base_delay_seconds).await;
                    (id, outcome)
                });
            }

            let mut batch_failed = false;
            while let Some(joined) = joinset.join_next().await {
                let (step_id, outcome) = match joined {
                    Ok(pair) => pair,
                    Err(join_err) => {
                        error!(error = %join_err, "step task panicked");
                        continue;
                    }
                };
                if outcome.status == StepStatus::Failed {
                    batch_failed = true;
                    let message = outcome.error.clone().unwrap_or_default();
                    errors.push(format!("{step_id}: {message}"));
                    failed_step_ids.push(step_id.clone());
                }
                outcomes.insert(step_id, outcome);
            }

            if config.stop_on_error && batch_failed {
                break 'batches;
            }
        }

        finalize(workflow, &outcomes, errors, failed_step_ids, start_time)
    }
}

/// Executes one step: condition gate, dispatch by kind under the step's
/// timeout, then a serializability check on the result.
async fn run_step(
    step: &WorkflowStep,
    context: &Arc<WorkflowContext>,
    outcomes: &DashMap<String, StepOutcome>,
    session_manager: &Arc<SessionManager>,
    retry_base_delay_seconds: u64,
) -> StepOutcome {
    let start_time = Utc::now();

    if let Some(expression) = &step.condition {
        let env = condition_environment(outcomes, context);
        let passes = evaluate(expression, &env).unwrap_or_else(|err| {
            error!(step = %step.id, condition = %expression, error = %err, "condition evaluation failed, treating as false");
            false
        });
        if !passes {
            return StepOutcome {
                status: StepStatus::Skipped,
                result: Some(json!("Condition not met")),
                error: None,
                start_time,
                end_time: Some(Utc::now()),
            };
        }
    }

    let timeout = Duration::from_secs(step.timeout_seconds.max(1));
    let env = condition_environment(outcomes, context);
    let policy = RetryPolicy::new(step.retry_count, Duration::from_secs(retry_base_delay_seconds.max(1)), Duration::from_secs(30));

    let dispatched = dispatch(step, context.clone(), session_manager.clone(), policy, &env, timeout).await;

    match dispatched {
        Ok(value) if serializable::probe(&value) => StepOutcome {
            status: StepStatus::Completed,
            result: Some(value),
            error: None,
            start_time,
            end_time: Some(Utc::now()),
        },
        Ok(_non_serializable) => StepOutcome {
            status: StepStatus::Failed,
            result: None,
            error: Some("step result is not serializable".to_string()),
            start_time,
            end_time: Some(Utc::now()),
        },
        Err(message) => StepOutcome {
            status: StepStatus::Failed,
            result: None,
            error: Some(message),
            start_time,
            end_time: Some(Utc::now()),
        },
    }
}

/// Dispatches by step kind. `timeout` is the step's per-attempt deadline: for
/// an MCP call it is handed straight through to the transport read, so a
/// retried call gets a fresh deadline each attempt rather than sharing one
/// budget across every attempt and backoff delay. Custom steps have no
/// natural per-attempt boundary, so the engine enforces the deadline around
/// the whole call.
async fn dispatch(
    step: &WorkflowStep,
    context: Arc<WorkflowContext>,
    session_manager: Arc<SessionManager>,
    policy: RetryPolicy,
    env: &Environment,
    timeout: Duration,
) -> Result<Value, String> {
    match &step.kind {
        StepKind::Conditional { expression } => evaluate(expression, env).map(Value::Bool).map_err(|e| e.to_string()),
        StepKind::Custom { function, params } => {
            let resolved = resolve_template(params, env);
            match tokio::time::timeout(timeout, function(context, resolved)).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(message),
                Err(_elapsed) => Err(format!("step timed out after {}s", timeout.as_secs())),
            }
        }
        StepKind::McpTool {
            server_name,
            tool_name,
            arguments,
        } => {
            let resolved = resolve_template(arguments, env);
            session_manager
                .call_tool_with_retry(server_name, tool_name, resolved, policy, Some(timeout))
                .await
                .map_err(|e| e.to_string())
        }
    }
}

/// Builds the identifier environment a step's `condition` (and `${...}`
/// argument templates) may reference: every previously recorded step result
/// by step id, the shared context's data and metadata under dedicated
/// `context`/`metadata` identifiers, and a `result` identifier exposing a
/// read-only snapshot of the accumulating run's counters (per §4.7's third
/// identifier source, "a read-only view of the accumulating WorkflowResult").
fn condition_environment(outcomes: &DashMap<String, StepOutcome>, context: &WorkflowContext) -> Environment {
    let mut env = Environment::new();
    let (mut completed, mut failed, mut skipped) = (0u64, 0u64, 0u64);
    for entry in outcomes.iter() {
        let value = entry.value().result.clone().unwrap_or(Value::Null);
        match entry.value().status {
            StepStatus::Completed => completed += 1,
            StepStatus::Failed => failed += 1,
            StepStatus::Skipped => skipped += 1,
            StepStatus::Running => {}
        }
        env.insert(entry.key().clone(), value);
    }
    let snapshot = context.to_map();
    env.insert("context", json!(snapshot.data));
    env.insert("metadata", json!(snapshot.metadata));
    env.insert(
        "result",
        json!({
            "steps_completed": completed,
            "steps_failed": failed,
            "steps_skipped": skipped,
        }),
    );
    env
}

/// Resolves `${expr}` string templates inside step arguments/params against
/// `env`, the same restricted grammar used by step conditions. Mirrors the
/// exact-match `$NAME`/`${NAME}` convention `mcpflow-config` uses for
/// environment-variable references: only a whole-string template is
/// substituted, partial interpolation inside a larger string is left as-is.
fn resolve_template(value: &Value, env: &Environment) -> Value {
    match value {
        Value::String(s) => s
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
            .and_then(|expr| evaluate_value(expr, env).ok())
            .unwrap_or_else(|| value.clone()),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_template(v, env)).collect()),
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), resolve_template(v, env))).collect()),
        other => other.clone(),
    }
}

/// Collapses per-step runtime outcomes into the final [`WorkflowResult`].
/// `step_results` and `final_result` follow original builder (insertion)
/// order, so `final_result` ends up holding the last-in-definition-order
/// completed step's value; `errors`/`failed_step_ids` retain completion
/// order as accumulated by [`ExecutionEngine::execute`].
fn finalize(workflow: &Workflow, outcomes: &DashMap<String, StepOutcome>, errors: Vec<String>, failed_step_ids: Vec<String>, start_time: DateTime<Utc>) -> WorkflowResult {
    let mut step_results = Vec::new();
    let mut final_result = None;
    let mut steps_completed = 0u32;
    let mut steps_failed = 0u32;
    let mut steps_skipped = 0u32;

    for step in workflow.steps() {
        let Some(outcome) = outcomes.get(&step.id) else {
            continue;
        };
        match outcome.status {
            StepStatus::Completed => {
                steps_completed += 1;
                if let Some(value) = &outcome.result {
                    step_results.push((step.id.clone(), value.clone()));
                    final_result = Some(value.clone());
                }
            }
            StepStatus::Failed => steps_failed += 1,
            StepStatus::Skipped => steps_skipped += 1,
            StepStatus::Running => {}
        }
    }

    let total_steps = workflow.steps().len() as u32;
    let status = if steps_failed == 0 {
        WorkflowStatus::Completed
    } else if steps_completed == 0 {
        WorkflowStatus::Failed
    } else {
        WorkflowStatus::Partial
    };

    WorkflowResult {
        workflow_name: workflow.config().name.clone(),
        status,
        step_results,
        steps_completed,
        steps_failed,
        steps_skipped,
        total_steps,
        errors,
        failed_step_ids,
        start_time,
        end_time: Utc::now(),
        final_result,
    }
}
