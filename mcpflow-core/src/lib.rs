//! ABOUTME: Foundational types shared by every mcpflow crate
//! ABOUTME: retry primitive, the JSON value alias, and the condition evaluator

pub mod condition;
pub mod retry;
pub mod serializable;
pub mod telemetry;
pub mod value;

pub use condition::{evaluate, evaluate_value, is_truthy, ConditionError, Environment};
pub use retry::{with_retry, with_retry_and_cleanup, ErrorClassifier, RetryDecision, RetryError, RetryPolicy, RetryStats, TimedRetry};
pub use telemetry::init_tracing;
pub use value::Value;
