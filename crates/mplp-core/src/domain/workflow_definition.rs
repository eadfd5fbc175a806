//! Workflow definitions
//!
//! A [`WorkflowDefinition`] is a DAG of module steps. Definitions are checked
//! with [`WorkflowDefinition::validate`] before they are registered.

use crate::domain::workflow_instance::{StepId, WorkflowId};
use crate::types::ModuleCall;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// A registered workflow: a DAG of module operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// ID of the workflow
    pub id: WorkflowId,

    /// Human-readable name of the workflow
    pub name: String,

    /// Description of the workflow
    #[serde(default)]
    pub description: Option<String>,

    /// The steps in this workflow
    pub steps: Vec<WorkflowStep>,

    /// Deadline for a whole instance of this workflow
    #[serde(default)]
    pub timeout: Option<Duration>,

    /// Upper bound on concurrently executing steps (engine default when unset)
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

/// One step of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// ID of the step, unique within the definition
    pub id: StepId,

    /// Module that executes the step
    pub module: String,

    /// Operation invoked on the module
    pub operation: String,

    /// Opaque operation parameters
    #[serde(default)]
    pub parameters: Value,

    /// Steps that must complete before this one starts
    #[serde(default)]
    pub dependencies: Vec<StepId>,

    /// How to undo this step if the workflow rolls back
    #[serde(default)]
    pub compensation: Option<CompensationSpec>,

    /// Deadline for a single invocation of this step
    #[serde(default)]
    pub timeout: Option<Duration>,
}

/// Compensating operation for a step, invoked on the same module
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompensationSpec {
    /// Compensation operation name
    pub operation: String,

    /// Explicit compensation parameters
    #[serde(default)]
    pub parameters: Value,
}

impl WorkflowStep {
    /// Create a step without dependencies or compensation
    pub fn new(
        id: impl Into<String>,
        module: impl Into<String>,
        operation: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            id: StepId(id.into()),
            module: module.into(),
            operation: operation.into(),
            parameters,
            dependencies: Vec::new(),
            compensation: None,
            timeout: None,
        }
    }

    /// Create a step from a call envelope
    pub fn from_call(id: impl Into<String>, call: ModuleCall) -> Self {
        Self::new(id, call.module, call.operation, call.parameters)
    }

    /// Add dependencies
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(|d| StepId(d.into())));
        self
    }

    /// Set the compensating operation
    pub fn with_compensation(mut self, operation: impl Into<String>, parameters: Value) -> Self {
        self.compensation = Some(CompensationSpec {
            operation: operation.into(),
            parameters,
        });
        self
    }

    /// Set the per-invocation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl WorkflowDefinition {
    /// Create an empty definition
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: WorkflowId(id.into()),
            name: name.into(),
            description: None,
            steps: Vec::new(),
            timeout: None,
            max_concurrency: None,
        }
    }

    /// Append a step
    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Set the instance deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the concurrency bound
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    /// Look up a step by ID
    pub fn step(&self, step_id: &StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| &s.id == step_id)
    }

    /// Validate the workflow definition
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.steps.is_empty() {
            return Err(CoreError::ValidationError(format!(
                "Workflow {} must have at least one step",
                self.id
            )));
        }

        if self.max_concurrency == Some(0) {
            return Err(CoreError::ValidationError(format!(
                "Workflow {} has max_concurrency of 0",
                self.id
            )));
        }

        let mut step_ids = HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            if step.module.is_empty() || step.operation.is_empty() {
                return Err(CoreError::ValidationError(format!(
                    "Step {} must name a module and an operation",
                    step.id
                )));
            }
            if !step_ids.insert(&step.id) {
                return Err(CoreError::ValidationError(format!(
                    "Duplicate step ID: {}",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.dependencies {
                if !step_ids.contains(dep) {
                    return Err(CoreError::ValidationError(format!(
                        "Step {} references non-existent dependency: {}",
                        step.id, dep
                    )));
                }
            }
        }

        self.check_for_cycles()
    }

    /// Depth-first search over the dependency edges
    fn check_for_cycles(&self) -> Result<(), CoreError> {
        let edges: HashMap<&StepId, &Vec<StepId>> = self
            .steps
            .iter()
            .map(|s| (&s.id, &s.dependencies))
            .collect();
        let mut marks: HashMap<&StepId, Mark> = HashMap::with_capacity(self.steps.len());

        for step in &self.steps {
            if let Some(culprit) = visit(&step.id, &edges, &mut marks) {
                return Err(CoreError::ValidationError(format!(
                    "Cycle detected in step dependencies involving step: {}",
                    culprit
                )));
            }
        }

        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Returns the step that closes a cycle, if any
fn visit<'a>(
    step_id: &'a StepId,
    edges: &HashMap<&'a StepId, &'a Vec<StepId>>,
    marks: &mut HashMap<&'a StepId, Mark>,
) -> Option<&'a StepId> {
    match marks.get(step_id) {
        Some(Mark::Done) => return None,
        Some(Mark::InProgress) => return Some(step_id),
        None => {}
    }

    marks.insert(step_id, Mark::InProgress);
    if let Some(deps) = edges.get(step_id).copied() {
        for dep in deps {
            if let Some(culprit) = visit(dep, edges, marks) {
                return Some(culprit);
            }
        }
    }
    marks.insert(step_id, Mark::Done);
    None
}
