//! ABOUTME: Fluent workflow builder, DAG validation, and topological batching
//! ABOUTME: batches are computed once at build() and cached on the built Workflow

use std::collections::{HashMap, HashSet};

use crate::model::{WorkflowConfig, WorkflowStep};

/// Errors raised while building a [`Workflow`].
#[derive(Debug, thiserror::Error)]
pub enum WorkflowValidationError {
    #[error("step id must not be empty")]
    EmptyId,
    #[error("duplicate step id: {id}")]
    DuplicateId { id: String },
    #[error("step '{step}' depends on unknown step '{depends_on}'")]
    MissingDependency { step: String, depends_on: String },
    #[error("dependency cycle detected among steps: {0:?}")]
    Cycle(Vec<String>),
}

/// Stateful fluent builder. Each [`WorkflowBuilder::add_step`] validates the
/// single step against everything added so far; [`WorkflowBuilder::build`]
/// then validates the whole graph and precomputes execution batches.
#[derive(Debug, Default)]
pub struct WorkflowBuilder {
    config: Option<WorkflowConfig>,
    steps: Vec<WorkflowStep>,
    ids: HashSet<String>,
}

impl WorkflowBuilder {
    #[must_use]
    pub fn new(config: WorkflowConfig) -> Self {
        Self {
            config: Some(config),
            steps: Vec::new(),
            ids: HashSet::new(),
        }
    }

    /// Validates `step.id` is non-empty and unique, and that every id in
    /// `step.depends_on` already belongs to a previously added step.
    pub fn add_step(mut self, step: WorkflowStep) -> Result<Self, WorkflowValidationError> {
        if step.id.is_empty() {
            return Err(WorkflowValidationError::EmptyId);
        }
        if self.ids.contains(&step.id) {
            return Err(WorkflowValidationError::DuplicateId { id: step.id });
        }
        for dep in &step.depends_on {
            if !self.ids.contains(dep) {
                return Err(WorkflowValidationError::MissingDependency {
                    step: step.id.clone(),
                    depends_on: dep.clone(),
                });
            }
        }
        self.ids.insert(step.id.clone());
        self.steps.push(step);
        Ok(self)
    }

    /// Validates the whole graph (duplicate ids, missing deps, cycles) and
    /// precomputes the topological execution batches.
    pub fn build(self) -> Result<Workflow, WorkflowValidationError> {
        let config = self.config.unwrap_or_else(|| WorkflowConfig::new("workflow"));
        let steps = self.steps;

        let mut seen = HashSet::with_capacity(steps.len());
        for step in &steps {
            if !seen.insert(step.id.as_str()) {
                return Err(WorkflowValidationError::DuplicateId { id: step.id.clone() });
            }
        }
        for step in &steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(WorkflowValidationError::MissingDependency {
                        step: step.id.clone(),
                        depends_on: dep.clone(),
                    });
                }
            }
        }

        if let Some(cycle) = detect_cycle(&steps) {
            return Err(WorkflowValidationError::Cycle(cycle));
        }

        let batches = compute_batches(&steps)?;
        let index = steps.iter().enumerate().map(|(i, s)| (s.id.clone(), i)).collect();

        Ok(Workflow {
            config,
            steps,
            index,
            batches,
        })
    }
}

/// Depth-first cycle detection with an explicit recursion stack. Kept as a
/// defended check even though `WorkflowBuilder::add_step`'s append-only,
/// deps-must-pre-exist discipline already makes cycles unreachable through
/// the builder alone.
fn detect_cycle(steps: &[WorkflowStep]) -> Option<Vec<String>> {
    let deps: HashMap<&str, &[String]> = steps.iter().map(|s| (s.id.as_str(), s.depends_on.as_slice())).collect();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: HashSet<&str> = HashSet::new();
    let mut path: Vec<String> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        deps: &HashMap<&'a str, &'a [String]>,
        visited: &mut HashSet<&'a str>,
        stack: &mut HashSet<&'a str>,
        path: &mut Vec<String>,
    ) -> bool {
        if stack.contains(node) {
            path.push(node.to_string());
            return true;
        }
        if visited.contains(node) {
            return false;
        }
        visited.insert(node);
        stack.insert(node);
        path.push(node.to_string());
        if let Some(dependencies) = deps.get(node) {
            for dep in dependencies.iter() {
                if visit(dep.as_str(), deps, visited, stack, path) {
                    return true;
                }
            }
        }
        stack.remove(node);
        path.pop();
        false
    }

    for step in steps {
        if visit(&step.id, &deps, &mut visited, &mut stack, &mut path) {
            return Some(path);
        }
    }
    None
}

/// Kahn-style topological layering: repeatedly collects every step whose
/// dependencies are all already placed into the next batch, until every
/// step is placed. Ties within a batch are broken by original builder
/// order for deterministic output.
fn compute_batches(steps: &[WorkflowStep]) -> Result<Vec<Vec<String>>, WorkflowValidationError> {
    let order: HashMap<&str, usize> = steps.iter().enumerate().map(|(i, s)| (s.id.as_str(), i)).collect();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut batches: Vec<Vec<String>> = Vec::new();

    while placed.len() < steps.len() {
        let mut ready: Vec<&str> = steps
            .iter()
            .filter(|s| !placed.contains(s.id.as_str()) && s.depends_on.iter().all(|d| placed.contains(d.as_str())))
            .map(|s| s.id.as_str())
            .collect();

        if ready.is_empty() {
            let stuck: Vec<String> = steps.iter().filter(|s| !placed.contains(s.id.as_str())).map(|s| s.id.clone()).collect();
            return Err(WorkflowValidationError::Cycle(stuck));
        }

        ready.sort_by_key(|id| order[id]);
        for id in &ready {
            placed.insert(id);
        }
        batches.push(ready.into_iter().map(str::to_string).collect());
    }

    Ok(batches)
}

/// An immutable, validated workflow graph with precomputed execution
/// batches. Safe to execute repeatedly, including concurrently, since all
/// runtime state lives outside this type (see [`crate::model::WorkflowStep`]).
#[derive(Debug)]
pub struct Workflow {
    config: WorkflowConfig,
    steps: Vec<WorkflowStep>,
    index: HashMap<String, usize>,
    batches: Vec<Vec<String>>,
}

impl Workflow {
    #[must_use]
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    #[must_use]
    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    #[must_use]
    pub fn step_by_id(&self, id: &str) -> Option<&WorkflowStep> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    #[must_use]
    pub fn execution_batches(&self) -> &[Vec<String>] {
        &self.batches
    }
}
