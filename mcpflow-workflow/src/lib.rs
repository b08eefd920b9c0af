//! ABOUTME: Workflow builder, DAG model, and execution engine
//! ABOUTME: ties configuration, transport, session, and context crates together

pub mod builder;
pub mod engine;
pub mod model;

pub use builder::{Workflow, WorkflowBuilder, WorkflowValidationError};
pub use engine::{ExecutionEngine, StepOutcome, StepStatus};
pub use model::{CustomStepFn, CustomStepFuture, StepKind, WorkflowConfig, WorkflowResult, WorkflowStatus, WorkflowStep};
