//! ABOUTME: Workflow step, config, and result types
//! ABOUTME: runtime execution state lives in the engine, not on these immutable values

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use mcpflow_core::Value;
use mcpflow_context::WorkflowContext;

/// A custom step's function body. Receives the shared context and its own
/// parameter mapping, returns a JSON result or a human-readable error.
pub type CustomStepFuture = BoxFuture<'static, Result<Value, String>>;
pub type CustomStepFn = Arc<dyn Fn(Arc<WorkflowContext>, Value) -> CustomStepFuture + Send + Sync>;

/// What a step does when dispatched.
#[derive(Clone)]
pub enum StepKind {
    McpTool { server_name: String, tool_name: String, arguments: Value },
    Custom { function: CustomStepFn, params: Value },
    Conditional { expression: String },
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::McpTool { server_name, tool_name, .. } => {
                f.debug_struct("McpTool").field("server_name", server_name).field("tool_name", tool_name).finish()
            }
            Self::Custom { params, .. } => f.debug_struct("Custom").field("params", params).finish(),
            Self::Conditional { expression } => f.debug_struct("Conditional").field("expression", expression).finish(),
        }
    }
}

/// A single node in a workflow's dependency graph. Immutable once built;
/// per-execution runtime state (status, result, timestamps) is tracked by
/// the engine in a separate per-run map, so one built [`crate::Workflow`]
/// can be executed any number of times, including concurrently.
#[derive(Debug, Clone)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub kind: StepKind,
    pub depends_on: Vec<String>,
    pub condition: Option<String>,
    pub retry_count: u32,
    pub timeout_seconds: u64,
}

const DEFAULT_RETRY_COUNT: u32 = 3;
const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

impl WorkflowStep {
    #[must_use]
    pub fn mcp_tool(id: impl Into<String>, name: impl Into<String>, server_name: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self::new(
            id,
            name,
            StepKind::McpTool {
                server_name: server_name.into(),
                tool_name: tool_name.into(),
                arguments,
            },
        )
    }

    #[must_use]
    pub fn custom(id: impl Into<String>, name: impl Into<String>, function: CustomStepFn, params: Value) -> Self {
        Self::new(id, name, StepKind::Custom { function, params })
    }

    #[must_use]
    pub fn conditional(id: impl Into<String>, name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::new(
            id,
            name,
            StepKind::Conditional {
                expression: expression.into(),
            },
        )
    }

    fn new(id: impl Into<String>, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            kind,
            depends_on: Vec::new(),
            condition: None,
            retry_count: DEFAULT_RETRY_COUNT,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn depends_on(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.condition = Some(expression.into());
        self
    }

    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count.max(1);
        self
    }

    #[must_use]
    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }
}

/// Workflow-level knobs, separate from any one step.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub name: String,
    pub description: Option<String>,
    pub max_parallel_steps: usize,
    pub default_timeout_seconds: u64,
    pub stop_on_error: bool,
    pub default_retry_count: u32,
    pub retry_base_delay_seconds: u64,
}

impl WorkflowConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            max_parallel_steps: 5,
            default_timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            stop_on_error: true,
            default_retry_count: DEFAULT_RETRY_COUNT,
            retry_base_delay_seconds: 1,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_max_parallel_steps(mut self, max_parallel_steps: usize) -> Self {
        self.max_parallel_steps = max_parallel_steps.max(1);
        self
    }

    #[must_use]
    pub fn with_default_timeout_seconds(mut self, seconds: u64) -> Self {
        self.default_timeout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }

    #[must_use]
    pub fn with_default_retry_count(mut self, retry_count: u32) -> Self {
        self.default_retry_count = retry_count.max(1);
        self
    }

    #[must_use]
    pub fn with_retry_base_delay_seconds(mut self, seconds: u64) -> Self {
        self.retry_base_delay_seconds = seconds;
        self
    }
}

/// Terminal outcome of one `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Completed,
    Partial,
    Failed,
}

/// Everything produced by one execution of a [`crate::Workflow`].
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub step_results: Vec<(String, Value)>,
    pub steps_completed: u32,
    pub steps_failed: u32,
    pub steps_skipped: u32,
    pub total_steps: u32,
    pub errors: Vec<String>,
    pub failed_step_ids: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub final_result: Option<Value>,
}

impl WorkflowResult {
    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        (self.end_time - self.start_time).num_milliseconds() as f64 / 1000.0
    }

    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_steps == 0 {
            return 1.0;
        }
        f64::from(self.steps_completed) / f64::from(self.total_steps)
    }

    #[must_use]
    pub fn step_result(&self, id: &str) -> Option<&Value> {
        self.step_results.iter().find(|(k, _)| k == id).map(|(_, v)| v)
    }
}
