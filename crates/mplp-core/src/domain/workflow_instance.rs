use crate::domain::transaction::TransactionId;
use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Value object: Workflow definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

/// Value object: Workflow instance ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowInstanceId(pub String);

/// Value object: Step ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for WorkflowInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Workflow instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, not started
    Pending,

    /// Steps are executing
    Running,

    /// All steps completed and the transaction committed
    Completed,

    /// A step failed or the deadline passed
    Failed,

    /// Cancelled by a caller
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// Status of one step within an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Invocation in flight
    Running,
    /// Invocation succeeded and was recorded
    Completed,
    /// Invocation failed
    Failed,
    /// Finished after the instance had already ended; compensated directly
    Abandoned,
}

/// Outcome of one step execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionResult {
    /// Current status
    pub status: StepStatus,
    /// Output returned by the module
    pub output: Option<Value>,
    /// Error message if the step failed
    pub error: Option<String>,
    /// When the invocation started
    pub started_at: DateTime<Utc>,
    /// When the invocation finished
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepExecutionResult {
    /// Wall-clock duration of the invocation, once finished
    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// Aggregate: one execution of a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Unique identifier
    pub id: WorkflowInstanceId,

    /// Workflow definition ID
    pub definition_id: WorkflowId,

    /// Current status
    pub status: WorkflowStatus,

    /// Parameters supplied at start
    pub parameters: Value,

    /// Creation timestamp
    pub start_time: DateTime<Utc>,

    /// Set when a terminal state is reached
    pub end_time: Option<DateTime<Utc>>,

    /// Most recently started step
    pub current_step: Option<StepId>,

    /// Step outputs keyed by step ID, set on completion
    pub result: Option<Value>,

    /// Error message if the instance failed
    pub error: Option<String>,

    /// Per-step execution results
    pub step_results: HashMap<StepId, StepExecutionResult>,

    /// Transactions opened for this instance, in order
    pub transaction_ids: Vec<TransactionId>,
}

impl WorkflowInstance {
    /// Create a new pending instance
    pub fn new(definition_id: WorkflowId, parameters: Value) -> Self {
        Self {
            id: WorkflowInstanceId(Uuid::new_v4().to_string()),
            definition_id,
            status: WorkflowStatus::Pending,
            parameters,
            start_time: Utc::now(),
            end_time: None,
            current_step: None,
            result: None,
            error: None,
            step_results: HashMap::with_capacity(8),
            transaction_ids: Vec::with_capacity(1),
        }
    }

    /// Start the workflow execution
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.status != WorkflowStatus::Pending {
            return Err(self.illegal("start"));
        }
        self.status = WorkflowStatus::Running;
        Ok(())
    }

    /// Complete the workflow successfully
    pub fn complete(&mut self, result: Value) -> Result<(), CoreError> {
        if self.status != WorkflowStatus::Running {
            return Err(self.illegal("complete"));
        }
        self.status = WorkflowStatus::Completed;
        self.result = Some(result);
        self.end_time = Some(Utc::now());
        Ok(())
    }

    /// Set a running workflow as failed
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), CoreError> {
        if self.status != WorkflowStatus::Running {
            return Err(self.illegal("fail"));
        }
        self.status = WorkflowStatus::Failed;
        self.error = Some(error.into());
        self.end_time = Some(Utc::now());
        Ok(())
    }

    /// Cancel a running workflow
    pub fn cancel(&mut self) -> Result<(), CoreError> {
        if self.status != WorkflowStatus::Running {
            return Err(self.illegal("cancel"));
        }
        self.status = WorkflowStatus::Cancelled;
        self.end_time = Some(Utc::now());
        Ok(())
    }

    /// Record that a step invocation started
    pub fn begin_step(&mut self, step_id: &StepId) {
        self.current_step = Some(step_id.clone());
        self.step_results.insert(
            step_id.clone(),
            StepExecutionResult {
                status: StepStatus::Running,
                output: None,
                error: None,
                started_at: Utc::now(),
                finished_at: None,
            },
        );
    }

    /// Record a successful step
    pub fn complete_step(&mut self, step_id: &StepId, output: Value) {
        self.finish_step(step_id, StepStatus::Completed, Some(output), None);
    }

    /// Record a failed step
    pub fn fail_step(&mut self, step_id: &StepId, error: impl Into<String>) {
        self.finish_step(step_id, StepStatus::Failed, None, Some(error.into()));
    }

    /// Record a step that finished after the instance ended
    pub fn abandon_step(&mut self, step_id: &StepId, output: Option<Value>) {
        self.finish_step(step_id, StepStatus::Abandoned, output, None);
    }

    /// Whether a step has been recorded as completed
    pub fn is_step_completed(&self, step_id: &StepId) -> bool {
        self.step_results
            .get(step_id)
            .map(|r| r.status == StepStatus::Completed)
            .unwrap_or(false)
    }

    /// Outputs of all completed steps, keyed by step ID
    pub fn aggregate_outputs(&self) -> Value {
        let outputs = self
            .step_results
            .iter()
            .filter(|(_, r)| r.status == StepStatus::Completed)
            .map(|(id, r)| (id.0.clone(), r.output.clone().unwrap_or(Value::Null)))
            .collect::<serde_json::Map<String, Value>>();
        Value::Object(outputs)
    }

    fn finish_step(
        &mut self,
        step_id: &StepId,
        status: StepStatus,
        output: Option<Value>,
        error: Option<String>,
    ) {
        let now = Utc::now();
        let entry = self
            .step_results
            .entry(step_id.clone())
            .or_insert_with(|| StepExecutionResult {
                status,
                output: None,
                error: None,
                started_at: now,
                finished_at: None,
            });
        entry.status = status;
        entry.output = output;
        entry.error = error;
        entry.finished_at = Some(now);
    }

    fn illegal(&self, action: &str) -> CoreError {
        CoreError::InvalidStateTransition(format!(
            "Cannot {} workflow instance {} in state: {:?}",
            action, self.id, self.status
        ))
    }
}
