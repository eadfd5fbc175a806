//! Workflow execution service
//!
//! Instances run as background tasks. Each run schedules the steps whose
//! dependencies are recorded as completed in the [`StateStore`], keeps up to
//! the concurrency bound in flight, and settles the instance through the
//! [`TransactionCoordinator`]: commit when every step completed, abort on a
//! failure, a timeout or a cancellation.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::application::invoker::{invoke_guarded, ModuleInvoker};
use crate::application::state_store::StateStore;
use crate::application::transaction_coordinator::TransactionCoordinator;
use crate::config::{CoordinationConfig, TransactionScope};
use crate::domain::transaction::{TransactionId, TransactionOperation};
use crate::domain::workflow_definition::{WorkflowDefinition, WorkflowStep};
use crate::domain::workflow_instance::{
    StepId, WorkflowId, WorkflowInstance, WorkflowInstanceId, WorkflowStatus,
};
use crate::types::merge_parameters;
use crate::CoreError;

/// State-store module under which step completion is recorded
pub const WORKFLOW_STATE_MODULE: &str = "workflow";

/// Value recorded for a completed step
pub const STEP_COMPLETED: &str = "completed";

/// State key recording the completion of one step of one instance
pub fn step_state_key(instance_id: &WorkflowInstanceId, step_id: &StepId) -> String {
    format!("{}.{}", instance_id, step_id)
}

struct InstanceRecord {
    instance: Mutex<WorkflowInstance>,
    status: watch::Sender<WorkflowStatus>,
}

/// Everything a running instance and its steps share
struct Execution {
    instance_id: WorkflowInstanceId,
    definition: Arc<WorkflowDefinition>,
    record: Arc<InstanceRecord>,
    parameters: Value,
    /// The instance-wide transaction; `None` when steps own their transactions
    transaction: Option<TransactionId>,
}

enum StepOutcome {
    Completed,
    Failed(String),
    /// Finished after the instance had already ended
    Abandoned,
}

type StepFuture = BoxFuture<'static, (StepId, StepOutcome)>;

/// Service for registering and executing workflows
#[derive(Clone)]
pub struct WorkflowEngine {
    definitions: Arc<DashMap<WorkflowId, Arc<WorkflowDefinition>>>,
    instances: Arc<DashMap<WorkflowInstanceId, Arc<InstanceRecord>>>,
    invoker: Arc<dyn ModuleInvoker>,
    transactions: Arc<TransactionCoordinator>,
    state_store: Arc<StateStore>,
    scope: TransactionScope,
    max_concurrent_steps: usize,
    default_step_timeout: Option<Duration>,
}

impl WorkflowEngine {
    /// Create a new workflow engine
    pub fn new(
        invoker: Arc<dyn ModuleInvoker>,
        transactions: Arc<TransactionCoordinator>,
        state_store: Arc<StateStore>,
        config: &CoordinationConfig,
    ) -> Self {
        Self {
            definitions: Arc::new(DashMap::new()),
            instances: Arc::new(DashMap::new()),
            invoker,
            transactions,
            state_store,
            scope: config.transaction_scope,
            max_concurrent_steps: config.max_concurrent_steps.max(1),
            default_step_timeout: config.default_step_timeout(),
        }
    }

    /// Validate and register a workflow definition, replacing any with the same ID
    ///
    /// Running instances keep the definition they started with.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<(), CoreError> {
        definition.validate()?;
        info!(
            workflow_id = %definition.id,
            steps = definition.steps.len(),
            "Registered workflow definition"
        );
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    /// A registered definition
    pub fn get_workflow_definition(&self, id: &WorkflowId) -> Option<WorkflowDefinition> {
        self.definitions.get(id).map(|d| d.value().as_ref().clone())
    }

    /// All registered definitions, sorted by ID
    pub fn list_workflow_definitions(&self) -> Vec<WorkflowDefinition> {
        let mut definitions: Vec<WorkflowDefinition> = self
            .definitions
            .iter()
            .map(|d| d.value().as_ref().clone())
            .collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        definitions
    }

    /// Start an instance of a registered workflow
    ///
    /// Execution continues in the background; poll with
    /// [`get_workflow_status`](Self::get_workflow_status) or block with
    /// [`wait_for_completion`](Self::wait_for_completion).
    pub async fn start_workflow(
        &self,
        definition_id: &WorkflowId,
        parameters: Option<Value>,
    ) -> Result<WorkflowInstanceId, CoreError> {
        let definition = self
            .definitions
            .get(definition_id)
            .map(|d| d.value().clone())
            .ok_or_else(|| CoreError::WorkflowDefinitionNotFound(definition_id.to_string()))?;

        let parameters = parameters.unwrap_or(Value::Null);
        let mut instance = WorkflowInstance::new(definition_id.clone(), parameters.clone());

        let transaction = match self.scope {
            TransactionScope::PerInstance => {
                let tx = self.transactions.begin_transaction(definition.timeout);
                instance.transaction_ids.push(tx.clone());
                Some(tx)
            }
            TransactionScope::PerStep => None,
        };

        instance.start()?;
        let instance_id = instance.id.clone();

        let (status, _) = watch::channel(instance.status);
        let record = Arc::new(InstanceRecord {
            instance: Mutex::new(instance),
            status,
        });
        self.instances.insert(instance_id.clone(), record.clone());

        info!(
            workflow_id = %definition_id,
            instance_id = %instance_id,
            scope = ?self.scope,
            "Workflow instance started"
        );

        let execution = Arc::new(Execution {
            instance_id: instance_id.clone(),
            definition,
            record,
            parameters,
            transaction,
        });
        tokio::spawn(self.clone().run(execution));

        Ok(instance_id)
    }

    /// Snapshot of an instance
    pub async fn get_workflow_status(
        &self,
        instance_id: &WorkflowInstanceId,
    ) -> Option<WorkflowInstance> {
        let record = self.instances.get(instance_id).map(|r| r.value().clone())?;
        let instance = record.instance.lock().await;
        Some(instance.clone())
    }

    /// Snapshots of all instances, optionally filtered by status, oldest first
    pub async fn list_instances(&self, status: Option<WorkflowStatus>) -> Vec<WorkflowInstance> {
        let records: Vec<Arc<InstanceRecord>> =
            self.instances.iter().map(|r| r.value().clone()).collect();

        let mut result = Vec::with_capacity(records.len());
        for record in records {
            let instance = record.instance.lock().await;
            if status.map_or(true, |s| instance.status == s) {
                result.push(instance.clone());
            }
        }
        result.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        result
    }

    /// Wait until an instance reaches a terminal status
    pub async fn wait_for_completion(
        &self,
        instance_id: &WorkflowInstanceId,
        timeout: Duration,
    ) -> Result<WorkflowInstance, CoreError> {
        let record = self
            .instances
            .get(instance_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| CoreError::WorkflowInstanceNotFound(instance_id.to_string()))?;

        let reached = {
            let mut status = record.status.subscribe();
            tokio::time::timeout(timeout, status.wait_for(|s| s.is_terminal()))
                .await
                .map(|r| r.is_ok())
        };
        match reached {
            Ok(true) => {}
            Ok(false) => {
                return Err(CoreError::Other(format!(
                    "Status channel of instance {} closed",
                    instance_id
                )))
            }
            Err(_) => {
                return Err(CoreError::Timeout(format!(
                    "Instance {} did not finish within {:?}",
                    instance_id, timeout
                )))
            }
        }

        let instance = record.instance.lock().await;
        Ok(instance.clone())
    }

    /// Cancel a running instance
    ///
    /// Returns `false` for unknown or already finished instances. Steps in
    /// flight are not interrupted; when they finish their work is compensated.
    pub async fn cancel_workflow(&self, instance_id: &WorkflowInstanceId) -> bool {
        let Some(record) = self.instances.get(instance_id).map(|r| r.value().clone()) else {
            return false;
        };

        let mut instance = record.instance.lock().await;
        if instance.status != WorkflowStatus::Running {
            return false;
        }

        if self.scope == TransactionScope::PerInstance {
            if let Some(tx) = instance.transaction_ids.first().cloned() {
                if let Err(e) = self
                    .transactions
                    .abort_transaction_with_reason(&tx, "Workflow cancelled")
                    .await
                {
                    warn!(instance_id = %instance_id, error = %e, "Failed to abort transaction");
                }
            }
        }

        if let Err(e) = instance.cancel() {
            warn!(instance_id = %instance_id, error = %e, "Cancel rejected");
            return false;
        }
        record.status.send_replace(WorkflowStatus::Cancelled);
        info!(instance_id = %instance_id, "Workflow instance cancelled");
        true
    }

    /// Number of instances still running
    pub async fn active_instance_count(&self) -> usize {
        self.list_instances(Some(WorkflowStatus::Running)).await.len()
    }

    /// Health check
    pub fn health_check(&self) -> bool {
        self.transactions.health_check() && self.state_store.health_check()
    }

    async fn run(self, execution: Arc<Execution>) {
        let limit = execution
            .definition
            .max_concurrency
            .unwrap_or(self.max_concurrent_steps)
            .max(1);
        let deadline = execution.definition.timeout.map(|t| Instant::now() + t);
        let expiry = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);

        let mut status = execution.record.status.subscribe();
        let mut started: HashSet<StepId> = HashSet::new();
        let mut in_flight: FuturesUnordered<StepFuture> = FuturesUnordered::new();

        loop {
            let terminal = status.borrow_and_update().is_terminal();
            if terminal {
                break;
            }

            for step in self.ready_steps(&execution, &started) {
                if in_flight.len() >= limit {
                    break;
                }
                debug!(
                    instance_id = %execution.instance_id,
                    step_id = %step.id,
                    "Starting step"
                );
                started.insert(step.id.clone());
                execution.record.instance.lock().await.begin_step(&step.id);
                in_flight.push(self.clone().execute_step(execution.clone(), step).boxed());
            }

            if in_flight.is_empty() {
                if started.len() == execution.definition.steps.len() {
                    self.finish(&execution).await;
                } else {
                    self.fail_instance(&execution, "No runnable steps remain".to_string())
                        .await;
                }
                break;
            }

            tokio::select! {
                Some((step_id, outcome)) = in_flight.next() => match outcome {
                    StepOutcome::Completed => {
                        debug!(instance_id = %execution.instance_id, step_id = %step_id, "Step completed");
                    }
                    StepOutcome::Failed(message) => {
                        let message = format!("Step {} failed: {}", step_id, message);
                        self.fail_instance(&execution, message).await;
                        break;
                    }
                    StepOutcome::Abandoned => {
                        // Settled already unless the transaction ended on its own, e.g. by timeout
                        if let Some(tx) = &execution.transaction {
                            let message = self.transaction_failure(tx).await;
                            self.fail_instance(&execution, message).await;
                        }
                        break;
                    }
                },
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = &mut expiry => {
                    let message = CoreError::Timeout(format!(
                        "Workflow instance {} exceeded its timeout of {:?}",
                        execution.instance_id,
                        execution.definition.timeout.unwrap_or_default()
                    ))
                    .to_string();
                    self.fail_instance(&execution, message).await;
                    break;
                }
            }
        }

        if !in_flight.is_empty() {
            debug!(
                instance_id = %execution.instance_id,
                steps = in_flight.len(),
                "Instance ended with steps in flight"
            );
            // Steps keep running to completion; each settles its own result
            tokio::spawn(async move { while in_flight.next().await.is_some() {} });
        }
    }

    /// Steps not yet started whose dependencies are all recorded as completed
    fn ready_steps(&self, execution: &Execution, started: &HashSet<StepId>) -> Vec<WorkflowStep> {
        execution
            .definition
            .steps
            .iter()
            .filter(|step| !started.contains(&step.id))
            .filter(|step| {
                step.dependencies
                    .iter()
                    .all(|dep| self.is_step_recorded(&execution.instance_id, dep))
            })
            .cloned()
            .collect()
    }

    fn is_step_recorded(&self, instance_id: &WorkflowInstanceId, step_id: &StepId) -> bool {
        self.state_store
            .get_state(WORKFLOW_STATE_MODULE, &step_state_key(instance_id, step_id))
            .as_ref()
            .and_then(Value::as_str)
            == Some(STEP_COMPLETED)
    }

    async fn execute_step(self, execution: Arc<Execution>, step: WorkflowStep) -> (StepId, StepOutcome) {
        let parameters = merge_parameters(&execution.parameters, &step.parameters);
        let mut operation = TransactionOperation::new(&step.module, &step.operation, parameters);
        if let Some(compensation) = &step.compensation {
            operation =
                operation.with_compensation(&compensation.operation, compensation.parameters.clone());
        }
        let timeout = step.timeout.or(self.default_step_timeout);

        let outcome = match &execution.transaction {
            Some(tx) => {
                self.run_in_instance_transaction(&execution, tx, &step, operation, timeout)
                    .await
            }
            None => {
                self.run_in_own_transaction(&execution, &step, operation, timeout)
                    .await
            }
        };
        (step.id, outcome)
    }

    /// Invoke directly, then record the applied operation in the instance transaction
    async fn run_in_instance_transaction(
        &self,
        execution: &Execution,
        tx: &TransactionId,
        step: &WorkflowStep,
        operation: TransactionOperation,
        timeout: Option<Duration>,
    ) -> StepOutcome {
        let call = operation.call();
        let invocation = invoke_guarded(self.invoker.as_ref(), &call);
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, invocation)
                .await
                .unwrap_or_else(|_| {
                    Err(CoreError::Timeout(format!(
                        "Step {} exceeded its timeout of {:?}",
                        step.id, limit
                    )))
                }),
            None => invocation.await,
        };

        let output = match result {
            Ok(output) => output,
            Err(e) => return self.record_failure(execution, step, e.to_string()).await,
        };

        match self
            .transactions
            .add_applied_operation(tx, operation.clone(), output.clone())
            .await
        {
            Ok(true) => self.record_completion(execution, step, output).await,
            Ok(false) | Err(_) => {
                // The transaction already ended, so nothing else will undo this step
                info!(
                    instance_id = %execution.instance_id,
                    step_id = %step.id,
                    "Step finished after its transaction ended, compensating"
                );
                self.transactions.compensate_operation(&operation).await;
                execution
                    .record
                    .instance
                    .lock()
                    .await
                    .abandon_step(&step.id, Some(output));
                StepOutcome::Abandoned
            }
        }
    }

    /// Run the step as a single-operation transaction committed on its own
    async fn run_in_own_transaction(
        &self,
        execution: &Execution,
        step: &WorkflowStep,
        operation: TransactionOperation,
        timeout: Option<Duration>,
    ) -> StepOutcome {
        let tx = self.transactions.begin_transaction(timeout);
        execution
            .record
            .instance
            .lock()
            .await
            .transaction_ids
            .push(tx.clone());

        match self.transactions.add_operation(&tx, operation).await {
            Ok(true) => {}
            Ok(false) => {
                let message = format!("Transaction {} rejected the operation", tx);
                return self.record_failure(execution, step, message).await;
            }
            Err(e) => return self.record_failure(execution, step, e.to_string()).await,
        }

        let committed = match self.transactions.commit_transaction(&tx).await {
            Ok(committed) => committed,
            Err(e) => return self.record_failure(execution, step, e.to_string()).await,
        };

        let snapshot = self.transactions.get_transaction(&tx).await;
        if committed {
            let output = snapshot
                .and_then(|t| t.operations.into_iter().next())
                .and_then(|o| o.result)
                .unwrap_or(Value::Null);
            self.record_completion(execution, step, output).await
        } else {
            let message = snapshot
                .and_then(|t| t.failure)
                .unwrap_or_else(|| format!("Transaction {} aborted", tx));
            self.record_failure(execution, step, message).await
        }
    }

    async fn record_completion(
        &self,
        execution: &Execution,
        step: &WorkflowStep,
        output: Value,
    ) -> StepOutcome {
        {
            let mut instance = execution.record.instance.lock().await;
            if instance.status != WorkflowStatus::Running {
                instance.abandon_step(&step.id, Some(output));
                return StepOutcome::Abandoned;
            }
            instance.complete_step(&step.id, output);
        }

        let key = step_state_key(&execution.instance_id, &step.id);
        match self
            .state_store
            .set_state(WORKFLOW_STATE_MODULE, &key, json!(STEP_COMPLETED))
            .await
        {
            Ok(_) => StepOutcome::Completed,
            Err(e) => StepOutcome::Failed(e.to_string()),
        }
    }

    async fn record_failure(
        &self,
        execution: &Execution,
        step: &WorkflowStep,
        message: String,
    ) -> StepOutcome {
        warn!(
            instance_id = %execution.instance_id,
            step_id = %step.id,
            module = %step.module,
            operation = %step.operation,
            error = %message,
            "Step failed"
        );
        execution
            .record
            .instance
            .lock()
            .await
            .fail_step(&step.id, message.clone());
        StepOutcome::Failed(message)
    }

    /// Commit and complete, or fail when the commit does not go through
    async fn finish(&self, execution: &Execution) {
        let mut instance = execution.record.instance.lock().await;
        if instance.status != WorkflowStatus::Running {
            return;
        }

        if let Some(tx) = &execution.transaction {
            let failure = match self.transactions.commit_transaction(tx).await {
                Ok(true) => None,
                Ok(false) => Some(self.transaction_failure(tx).await),
                Err(e) => Some(e.to_string()),
            };
            if let Some(message) = failure {
                error!(instance_id = %execution.instance_id, error = %message, "Workflow commit failed");
                if instance.fail(message).is_ok() {
                    execution.record.status.send_replace(WorkflowStatus::Failed);
                }
                return;
            }
        }

        let result = instance.aggregate_outputs();
        match instance.complete(result) {
            Ok(()) => {
                info!(instance_id = %execution.instance_id, "Workflow instance completed");
                execution.record.status.send_replace(WorkflowStatus::Completed);
            }
            Err(e) => warn!(instance_id = %execution.instance_id, error = %e, "Completion rejected"),
        }
    }

    async fn transaction_failure(&self, tx: &TransactionId) -> String {
        self.transactions
            .get_transaction(tx)
            .await
            .and_then(|t| t.failure)
            .unwrap_or_else(|| format!("Transaction {} aborted", tx))
    }

    /// Abort the instance transaction and mark the instance failed
    async fn fail_instance(&self, execution: &Execution, message: String) {
        let mut instance = execution.record.instance.lock().await;
        if instance.status != WorkflowStatus::Running {
            return;
        }

        if let Some(tx) = &execution.transaction {
            if let Err(e) = self
                .transactions
                .abort_transaction_with_reason(tx, message.clone())
                .await
            {
                warn!(instance_id = %execution.instance_id, error = %e, "Failed to abort transaction");
            }
        }

        error!(instance_id = %execution.instance_id, error = %message, "Workflow instance failed");
        if instance.fail(message).is_ok() {
            execution.record.status.send_replace(WorkflowStatus::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transaction::TransactionStatus;
    use crate::domain::workflow_instance::StepStatus;
    use crate::testing::ScriptedInvoker;

    const WAIT: Duration = Duration::from_secs(5);

    fn engine_with(invoker: Arc<ScriptedInvoker>, config: CoordinationConfig) -> WorkflowEngine {
        let transactions = Arc::new(TransactionCoordinator::new(invoker.clone()));
        WorkflowEngine::new(invoker, transactions, Arc::new(StateStore::new()), &config)
    }

    fn engine(invoker: Arc<ScriptedInvoker>) -> WorkflowEngine {
        engine_with(invoker, CoordinationConfig::default())
    }

    fn step(id: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep::new(id, "plan", id, json!({"step": id}))
            .depends_on(deps.iter().copied())
            .with_compensation(format!("undo_{}", id), json!({"step": id}))
    }

    fn wf(id: &str) -> WorkflowId {
        WorkflowId(id.to_string())
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_definitions() {
        let engine = engine(ScriptedInvoker::new());
        let cyclic = WorkflowDefinition::new("cyclic", "Cyclic")
            .with_step(step("a", &["b"]))
            .with_step(step("b", &["a"]));

        assert!(matches!(
            engine.register_workflow(cyclic),
            Err(CoreError::ValidationError(_))
        ));
        assert!(engine.get_workflow_definition(&wf("cyclic")).is_none());
        assert!(engine.list_workflow_definitions().is_empty());
    }

    #[tokio::test]
    async fn test_start_unknown_workflow() {
        let engine = engine(ScriptedInvoker::new());
        assert!(matches!(
            engine.start_workflow(&wf("missing"), None).await,
            Err(CoreError::WorkflowDefinitionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_parameters_are_merged_into_steps() {
        let invoker = ScriptedInvoker::new();
        let engine = engine(invoker.clone());
        engine
            .register_workflow(
                WorkflowDefinition::new("wf", "Merge")
                    .with_step(WorkflowStep::new("s1", "context", "create", json!({"kind": "step"}))),
            )
            .unwrap();

        let id = engine
            .start_workflow(&wf("wf"), Some(json!({"kind": "start", "user": "u1"})))
            .await
            .unwrap();
        let instance = engine.wait_for_completion(&id, WAIT).await.unwrap();

        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert_eq!(
            invoker.calls_to("create")[0].parameters,
            json!({"kind": "step", "user": "u1"})
        );
    }

    #[tokio::test]
    async fn test_concurrency_bound_is_respected() {
        let invoker = ScriptedInvoker::new();
        let gate = invoker.gate("plan", "a");
        let engine = engine(invoker.clone());
        engine
            .register_workflow(
                WorkflowDefinition::new("wf", "Bounded")
                    .with_step(step("a", &[]))
                    .with_step(step("b", &[]))
                    .with_max_concurrency(1),
            )
            .unwrap();

        let id = engine.start_workflow(&wf("wf"), None).await.unwrap();
        invoker.wait_for_call("plan", "a").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!invoker.was_called("plan", "b"));

        gate.open();
        let instance = engine.wait_for_completion(&id, WAIT).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert!(invoker.was_called("plan", "b"));
    }

    #[tokio::test]
    async fn test_independent_steps_run_concurrently() {
        let invoker = ScriptedInvoker::new();
        let gate_a = invoker.gate("plan", "a");
        let engine = engine(invoker.clone());
        engine
            .register_workflow(
                WorkflowDefinition::new("wf", "Parallel")
                    .with_step(step("a", &[]))
                    .with_step(step("b", &[]))
                    .with_step(step("join", &["a", "b"])),
            )
            .unwrap();

        let id = engine.start_workflow(&wf("wf"), None).await.unwrap();
        // b starts while a is still held
        invoker.wait_for_call("plan", "b").await;
        assert!(!invoker.was_called("plan", "join"));

        gate_a.open();
        let instance = engine.wait_for_completion(&id, WAIT).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Completed);
        let order: Vec<String> = invoker.calls().into_iter().map(|c| c.operation).collect();
        assert_eq!(order.last().map(String::as_str), Some("join"));
    }

    #[tokio::test]
    async fn test_step_timeout_fails_instance() {
        let invoker = ScriptedInvoker::new();
        invoker.delay("plan", "slow", Duration::from_millis(500));
        let engine = engine(invoker.clone());
        engine
            .register_workflow(
                WorkflowDefinition::new("wf", "Slow").with_step(
                    step("slow", &[]).with_timeout(Duration::from_millis(20)),
                ),
            )
            .unwrap();

        let id = engine.start_workflow(&wf("wf"), None).await.unwrap();
        let instance = engine.wait_for_completion(&id, WAIT).await.unwrap();

        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert!(instance.error.unwrap().contains("Timeout"));
        assert_eq!(
            instance.step_results[&StepId("slow".to_string())].status,
            StepStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_workflow_deadline_aborts_instance() {
        let invoker = ScriptedInvoker::new();
        let gate = invoker.gate("plan", "b");
        let engine = engine(invoker.clone());
        engine
            .register_workflow(
                WorkflowDefinition::new("wf", "Deadline")
                    .with_step(step("a", &[]))
                    .with_step(step("b", &["a"]))
                    .with_timeout(Duration::from_millis(100)),
            )
            .unwrap();

        let id = engine.start_workflow(&wf("wf"), None).await.unwrap();
        let instance = engine.wait_for_completion(&id, WAIT).await.unwrap();

        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert!(instance.error.unwrap().contains("exceeded its timeout"));
        assert!(invoker.was_called("plan", "undo_a"));
        gate.open();
    }

    #[tokio::test]
    async fn test_per_step_scope_keeps_committed_steps() {
        let invoker = ScriptedInvoker::new();
        invoker.fail("plan", "b", "declined");
        let config = CoordinationConfig {
            transaction_scope: TransactionScope::PerStep,
            ..Default::default()
        };
        let engine = engine_with(invoker.clone(), config);
        engine
            .register_workflow(
                WorkflowDefinition::new("wf", "Per step")
                    .with_step(step("a", &[]))
                    .with_step(step("b", &["a"])),
            )
            .unwrap();

        let id = engine.start_workflow(&wf("wf"), None).await.unwrap();
        let instance = engine.wait_for_completion(&id, WAIT).await.unwrap();

        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert_eq!(instance.transaction_ids.len(), 2);
        assert!(!invoker.was_called("plan", "undo_a"));

        let committed = engine
            .transactions
            .get_transaction(&instance.transaction_ids[0])
            .await
            .unwrap();
        assert_eq!(committed.status, TransactionStatus::Committed);
    }

    #[tokio::test]
    async fn test_list_instances_and_cancel_finished() {
        let invoker = ScriptedInvoker::new();
        let engine = engine(invoker);
        engine
            .register_workflow(WorkflowDefinition::new("wf", "One").with_step(step("a", &[])))
            .unwrap();

        let id = engine.start_workflow(&wf("wf"), None).await.unwrap();
        engine.wait_for_completion(&id, WAIT).await.unwrap();

        assert!(!engine.cancel_workflow(&id).await);
        assert!(!engine
            .cancel_workflow(&WorkflowInstanceId("missing".to_string()))
            .await);
        assert_eq!(
            engine
                .list_instances(Some(WorkflowStatus::Completed))
                .await
                .len(),
            1
        );
        assert_eq!(engine.active_instance_count().await, 0);
        assert!(engine.health_check());
    }

    #[tokio::test]
    async fn test_wait_for_completion_times_out() {
        let invoker = ScriptedInvoker::new();
        let gate = invoker.gate("plan", "a");
        let engine = engine(invoker.clone());
        engine
            .register_workflow(WorkflowDefinition::new("wf", "Held").with_step(step("a", &[])))
            .unwrap();

        let id = engine.start_workflow(&wf("wf"), None).await.unwrap();
        assert!(matches!(
            engine.wait_for_completion(&id, Duration::from_millis(20)).await,
            Err(CoreError::Timeout(_))
        ));
        gate.open();
        assert!(matches!(
            engine
                .wait_for_completion(&WorkflowInstanceId("missing".to_string()), WAIT)
                .await,
            Err(CoreError::WorkflowInstanceNotFound(_))
        ));
    }
}
