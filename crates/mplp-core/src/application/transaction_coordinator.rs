//! Saga transaction coordinator
//!
//! Transactions live in a map of per-transaction mutexes. Every mutation of a
//! transaction, including the module calls made during commit and abort,
//! happens under its mutex, so concurrent appends, commits and aborts of the
//! same transaction are serialized while different transactions proceed
//! independently.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::invoker::{invoke_guarded, ModuleInvoker};
use crate::domain::transaction::{
    CompensationFailureRecord, OperationStatus, Transaction, TransactionId, TransactionOperation,
    TransactionStatus,
};
use crate::CoreError;

type TransactionHandle = Arc<Mutex<Transaction>>;

/// Coordinates saga transactions over module operations
pub struct TransactionCoordinator {
    transactions: DashMap<TransactionId, TransactionHandle>,
    invoker: Arc<dyn ModuleInvoker>,
    compensator: Arc<dyn ModuleInvoker>,
    default_timeout: Option<Duration>,
}

impl TransactionCoordinator {
    /// Create a coordinator that invokes forward and compensating operations
    /// through the same invoker
    pub fn new(invoker: Arc<dyn ModuleInvoker>) -> Self {
        Self {
            transactions: DashMap::new(),
            compensator: invoker.clone(),
            invoker,
            default_timeout: None,
        }
    }

    /// Route compensating operations through a separate invoker
    pub fn with_compensator(mut self, compensator: Arc<dyn ModuleInvoker>) -> Self {
        self.compensator = compensator;
        self
    }

    /// Timeout applied to transactions begun without one
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Open a new active transaction
    pub fn begin_transaction(&self, timeout: Option<Duration>) -> TransactionId {
        let transaction = Transaction::new(timeout.or(self.default_timeout));
        let id = transaction.id.clone();
        debug!(transaction_id = %id, timeout = ?transaction.timeout, "Transaction started");
        self.transactions
            .insert(id.clone(), Arc::new(Mutex::new(transaction)));
        id
    }

    /// Append a pending operation, invoked at commit
    ///
    /// Returns `false` when the transaction no longer accepts operations.
    pub async fn add_operation(
        &self,
        id: &TransactionId,
        mut operation: TransactionOperation,
    ) -> Result<bool, CoreError> {
        operation.status = OperationStatus::Pending;
        operation.result = None;
        self.append(id, operation).await
    }

    /// Append an operation the caller already performed
    ///
    /// Commit will not invoke it again; abort compensates it like any other
    /// applied operation.
    pub async fn add_applied_operation(
        &self,
        id: &TransactionId,
        mut operation: TransactionOperation,
        result: serde_json::Value,
    ) -> Result<bool, CoreError> {
        operation.status = OperationStatus::Applied;
        operation.result = Some(result);
        self.append(id, operation).await
    }

    /// Invoke pending operations in order and commit
    ///
    /// Returns `true` once committed, including for a transaction that was
    /// already committed. Returns `false` when an operation failed or the
    /// deadline passed; the transaction is then aborted and compensated.
    pub async fn commit_transaction(&self, id: &TransactionId) -> Result<bool, CoreError> {
        let handle = self.handle(id)?;
        let mut tx = handle.lock().await;

        match tx.status {
            TransactionStatus::Committed => return Ok(true),
            TransactionStatus::Aborted => return Ok(false),
            _ => {}
        }

        tx.begin_prepare()?;
        for index in 0..tx.operations.len() {
            if tx.is_expired_at(Utc::now()) {
                let reason = timeout_reason(&tx);
                warn!(transaction_id = %id, "Transaction deadline passed during commit");
                self.abort_locked(&mut tx, reason).await;
                return Ok(false);
            }
            if tx.operations[index].status != OperationStatus::Pending {
                continue;
            }

            let call = tx.operations[index].call();
            match invoke_guarded(self.invoker.as_ref(), &call).await {
                Ok(result) => {
                    let operation = &mut tx.operations[index];
                    operation.status = OperationStatus::Applied;
                    operation.result = Some(result);
                }
                Err(e) => {
                    warn!(
                        transaction_id = %id,
                        module = %call.module,
                        operation = %call.operation,
                        error = %e,
                        "Operation failed, aborting transaction"
                    );
                    tx.operations[index].status = OperationStatus::Failed;
                    self.abort_locked(&mut tx, e.to_string()).await;
                    return Ok(false);
                }
            }
        }

        tx.mark_prepared()?;
        tx.mark_committed()?;
        info!(
            transaction_id = %id,
            operations = tx.operations.len(),
            "Transaction committed"
        );
        Ok(true)
    }

    /// Abort and compensate applied operations in reverse order
    ///
    /// Returns `true` once aborted, including for a transaction that was
    /// already aborted, and `false` for a committed one.
    pub async fn abort_transaction(&self, id: &TransactionId) -> Result<bool, CoreError> {
        self.abort_transaction_with_reason(id, "Aborted by caller")
            .await
    }

    /// [`abort_transaction`](Self::abort_transaction) recording why
    pub async fn abort_transaction_with_reason(
        &self,
        id: &TransactionId,
        reason: impl Into<String>,
    ) -> Result<bool, CoreError> {
        let handle = self.handle(id)?;
        let mut tx = handle.lock().await;

        match tx.status {
            TransactionStatus::Aborted => Ok(true),
            TransactionStatus::Committed => Ok(false),
            _ => {
                self.abort_locked(&mut tx, reason.into()).await;
                Ok(true)
            }
        }
    }

    /// Compensate an operation that finished after its transaction ended
    ///
    /// Returns whether a compensation ran and succeeded.
    pub async fn compensate_operation(&self, operation: &TransactionOperation) -> bool {
        let Some(call) = operation.compensation_call() else {
            return false;
        };
        match invoke_guarded(self.compensator.as_ref(), &call).await {
            Ok(_) => {
                info!(
                    module = %call.module,
                    operation = %call.operation,
                    "Compensated late operation"
                );
                true
            }
            Err(e) => {
                error!(
                    module = %call.module,
                    operation = %call.operation,
                    error = %e,
                    "Compensation of late operation failed"
                );
                false
            }
        }
    }

    /// Snapshot of a transaction
    pub async fn get_transaction(&self, id: &TransactionId) -> Option<Transaction> {
        let handle = self.transactions.get(id).map(|h| h.value().clone())?;
        let tx = handle.lock().await;
        Some(tx.clone())
    }

    /// Snapshots of all transactions, optionally filtered by status
    pub async fn list_transactions(&self, status: Option<TransactionStatus>) -> Vec<Transaction> {
        let mut result = Vec::new();
        for handle in self.handles() {
            let tx = handle.lock().await;
            if status.map_or(true, |s| tx.status == s) {
                result.push(tx.clone());
            }
        }
        result.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        result
    }

    /// Abort every non-terminal transaction past its deadline
    ///
    /// Transactions busy committing are skipped; commit checks the deadline
    /// itself. Returns how many were aborted.
    pub async fn abort_expired_transactions(&self) -> usize {
        let mut aborted = 0;
        for handle in self.handles() {
            let Ok(mut tx) = handle.try_lock() else {
                continue;
            };
            if tx.is_expired_at(Utc::now()) {
                let reason = timeout_reason(&tx);
                warn!(transaction_id = %tx.id, "Transaction timed out");
                self.abort_locked(&mut tx, reason).await;
                aborted += 1;
            }
        }
        aborted
    }

    /// Start a background task sweeping expired transactions
    ///
    /// The task stops once the coordinator is dropped.
    pub fn spawn_timeout_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                let aborted = coordinator.abort_expired_transactions().await;
                if aborted > 0 {
                    info!(aborted, "Aborted expired transactions");
                }
            }
        })
    }

    /// Number of tracked transactions
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Health check
    pub fn health_check(&self) -> bool {
        true
    }

    async fn append(
        &self,
        id: &TransactionId,
        operation: TransactionOperation,
    ) -> Result<bool, CoreError> {
        let handle = self.handle(id)?;
        let mut tx = handle.lock().await;

        if tx.is_expired_at(Utc::now()) {
            let reason = timeout_reason(&tx);
            warn!(transaction_id = %id, "Rejecting operation, transaction timed out");
            self.abort_locked(&mut tx, reason).await;
            return Ok(false);
        }
        if tx.status != TransactionStatus::Active {
            debug!(
                transaction_id = %id,
                status = ?tx.status,
                "Rejecting operation on inactive transaction"
            );
            return Ok(false);
        }

        debug!(
            transaction_id = %id,
            module = %operation.module,
            operation = %operation.operation,
            "Operation added"
        );
        tx.push_operation(operation)?;
        Ok(true)
    }

    /// Runs compensations of applied operations, newest first, then marks the
    /// transaction aborted. Failed compensations are recorded and skipped.
    async fn abort_locked(&self, tx: &mut Transaction, reason: String) {
        for index in tx.applied_in_reverse() {
            let Some(call) = tx.operations[index].compensation_call() else {
                continue;
            };

            match invoke_guarded(self.compensator.as_ref(), &call).await {
                Ok(_) => {
                    tx.operations[index].status = OperationStatus::Compensated;
                }
                Err(e) => {
                    error!(
                        transaction_id = %tx.id,
                        module = %call.module,
                        operation = %call.operation,
                        error = %e,
                        "Compensation failed"
                    );
                    tx.operations[index].status = OperationStatus::CompensationFailed;
                    let record = CompensationFailureRecord {
                        operation_id: tx.operations[index].id.clone(),
                        module: call.module,
                        operation: call.operation,
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    };
                    tx.compensation_failures.push(record);
                }
            }
        }

        if let Err(e) = tx.mark_aborted(Some(reason)) {
            warn!(transaction_id = %tx.id, error = %e, "Abort of terminal transaction ignored");
            return;
        }
        info!(
            transaction_id = %tx.id,
            compensation_failures = tx.compensation_failures.len(),
            "Transaction aborted"
        );
    }

    fn handle(&self, id: &TransactionId) -> Result<TransactionHandle, CoreError> {
        self.transactions
            .get(id)
            .map(|h| h.value().clone())
            .ok_or_else(|| CoreError::TransactionNotFound(id.to_string()))
    }

    fn handles(&self) -> Vec<TransactionHandle> {
        self.transactions.iter().map(|e| e.value().clone()).collect()
    }
}

fn timeout_reason(tx: &Transaction) -> String {
    CoreError::Timeout(format!(
        "Transaction {} exceeded its timeout of {:?}",
        tx.id,
        tx.timeout.unwrap_or_default()
    ))
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::invoker::MockModuleInvoker;
    use crate::testing::ScriptedInvoker;
    use serde_json::json;

    fn op(module: &str, name: &str) -> TransactionOperation {
        TransactionOperation::new(module, name, json!({"name": name}))
            .with_compensation(format!("undo_{}", name), json!({"name": name}))
    }

    #[tokio::test]
    async fn test_commit_invokes_pending_operations_in_order() {
        let invoker = ScriptedInvoker::new();
        let coordinator = TransactionCoordinator::new(invoker.clone());
        let tx = coordinator.begin_transaction(None);

        assert!(coordinator.add_operation(&tx, op("context", "a")).await.unwrap());
        assert!(coordinator.add_operation(&tx, op("plan", "b")).await.unwrap());
        assert!(coordinator.commit_transaction(&tx).await.unwrap());

        let operations: Vec<String> = invoker.calls().into_iter().map(|c| c.operation).collect();
        assert_eq!(operations, vec!["a".to_string(), "b".to_string()]);

        let snapshot = coordinator.get_transaction(&tx).await.unwrap();
        assert_eq!(snapshot.status, TransactionStatus::Committed);
        assert!(snapshot
            .operations
            .iter()
            .all(|o| o.status == OperationStatus::Applied && o.result.is_some()));
    }

    #[tokio::test]
    async fn test_applied_operations_are_not_reinvoked() {
        let mut invoker = MockModuleInvoker::new();
        invoker.expect_invoke().never();
        let coordinator = TransactionCoordinator::new(Arc::new(invoker));

        let tx = coordinator.begin_transaction(None);
        assert!(coordinator
            .add_applied_operation(&tx, op("plan", "a"), json!({"done": true}))
            .await
            .unwrap());
        assert!(coordinator.commit_transaction(&tx).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_operation_aborts_and_compensates() {
        let invoker = ScriptedInvoker::new();
        invoker.fail("role", "c", "role service unavailable");
        let coordinator = TransactionCoordinator::new(invoker.clone());
        let tx = coordinator.begin_transaction(None);

        for operation in [op("context", "a"), op("plan", "b"), op("role", "c")] {
            coordinator.add_operation(&tx, operation).await.unwrap();
        }
        assert!(!coordinator.commit_transaction(&tx).await.unwrap());

        let compensations: Vec<String> = invoker
            .calls()
            .into_iter()
            .filter(|c| c.operation.starts_with("undo_"))
            .map(|c| c.operation)
            .collect();
        assert_eq!(compensations, vec!["undo_b".to_string(), "undo_a".to_string()]);

        let snapshot = coordinator.get_transaction(&tx).await.unwrap();
        assert_eq!(snapshot.status, TransactionStatus::Aborted);
        assert_eq!(snapshot.operations[2].status, OperationStatus::Failed);
        assert!(snapshot
            .failure
            .as_deref()
            .unwrap()
            .contains("role service unavailable"));
    }

    #[tokio::test]
    async fn test_commit_and_abort_are_idempotent() {
        let invoker = ScriptedInvoker::new();
        let coordinator = TransactionCoordinator::new(invoker.clone());

        let committed = coordinator.begin_transaction(None);
        coordinator.add_operation(&committed, op("plan", "a")).await.unwrap();
        assert!(coordinator.commit_transaction(&committed).await.unwrap());
        assert!(coordinator.commit_transaction(&committed).await.unwrap());
        assert_eq!(invoker.calls().len(), 1);
        assert!(!coordinator.abort_transaction(&committed).await.unwrap());

        let aborted = coordinator.begin_transaction(None);
        assert!(coordinator.abort_transaction(&aborted).await.unwrap());
        assert!(coordinator.abort_transaction(&aborted).await.unwrap());
        assert!(!coordinator.commit_transaction(&aborted).await.unwrap());
        assert!(!coordinator
            .add_operation(&aborted, op("plan", "late"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unknown_transaction() {
        let coordinator = TransactionCoordinator::new(ScriptedInvoker::new());
        let missing = TransactionId("missing".to_string());
        assert!(matches!(
            coordinator.commit_transaction(&missing).await,
            Err(CoreError::TransactionNotFound(_))
        ));
        assert!(matches!(
            coordinator.abort_transaction(&missing).await,
            Err(CoreError::TransactionNotFound(_))
        ));
        assert!(coordinator.get_transaction(&missing).await.is_none());
    }

    #[tokio::test]
    async fn test_compensation_failure_is_recorded_and_skipped() {
        let invoker = ScriptedInvoker::new();
        invoker.fail("plan", "undo_b", "cannot undo");
        let coordinator = TransactionCoordinator::new(invoker.clone());
        let tx = coordinator.begin_transaction(None);

        coordinator
            .add_applied_operation(&tx, op("context", "a"), json!({}))
            .await
            .unwrap();
        coordinator
            .add_applied_operation(&tx, op("plan", "b"), json!({}))
            .await
            .unwrap();
        assert!(coordinator.abort_transaction(&tx).await.unwrap());

        let snapshot = coordinator.get_transaction(&tx).await.unwrap();
        assert_eq!(snapshot.operations[0].status, OperationStatus::Compensated);
        assert_eq!(
            snapshot.operations[1].status,
            OperationStatus::CompensationFailed
        );
        assert_eq!(snapshot.compensation_failures.len(), 1);
        assert_eq!(snapshot.compensation_failures[0].operation, "undo_b");
        assert!(invoker.was_called("context", "undo_a"));
    }

    #[tokio::test]
    async fn test_separate_compensator() {
        let forward = ScriptedInvoker::new();
        let compensator = ScriptedInvoker::new();
        let coordinator =
            TransactionCoordinator::new(forward.clone()).with_compensator(compensator.clone());

        let tx = coordinator.begin_transaction(None);
        coordinator
            .add_applied_operation(&tx, op("plan", "a"), json!({}))
            .await
            .unwrap();
        coordinator.abort_transaction(&tx).await.unwrap();

        assert!(forward.calls().is_empty());
        assert_eq!(compensator.calls_to("undo_a").len(), 1);
    }

    #[tokio::test]
    async fn test_expired_transaction_rejects_operations() {
        let invoker = ScriptedInvoker::new();
        let coordinator = TransactionCoordinator::new(invoker.clone());
        let tx = coordinator.begin_transaction(Some(Duration::from_millis(20)));

        coordinator
            .add_applied_operation(&tx, op("plan", "a"), json!({}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!coordinator.add_operation(&tx, op("plan", "b")).await.unwrap());
        let snapshot = coordinator.get_transaction(&tx).await.unwrap();
        assert_eq!(snapshot.status, TransactionStatus::Aborted);
        assert!(snapshot.failure.unwrap().contains("Timeout"));
        assert!(invoker.was_called("plan", "undo_a"));
    }

    #[tokio::test]
    async fn test_sweep_aborts_expired_transactions() {
        let coordinator = TransactionCoordinator::new(ScriptedInvoker::new())
            .with_default_timeout(Some(Duration::from_millis(10)));
        let expiring = coordinator.begin_transaction(None);
        let durable = coordinator.begin_transaction(Some(Duration::from_secs(60)));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(coordinator.abort_expired_transactions().await, 1);

        let aborted = coordinator
            .list_transactions(Some(TransactionStatus::Aborted))
            .await;
        assert_eq!(aborted.len(), 1);
        assert_eq!(aborted[0].id, expiring);
        assert_eq!(
            coordinator.get_transaction(&durable).await.unwrap().status,
            TransactionStatus::Active
        );
    }

    #[tokio::test]
    async fn test_reaper_task() {
        let coordinator = Arc::new(TransactionCoordinator::new(ScriptedInvoker::new()));
        let tx = coordinator.begin_transaction(Some(Duration::from_millis(10)));
        let reaper = coordinator.spawn_timeout_reaper(Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            coordinator.get_transaction(&tx).await.unwrap().status,
            TransactionStatus::Aborted
        );
        reaper.abort();
    }

    #[tokio::test]
    async fn test_late_operation_compensation() {
        let invoker = ScriptedInvoker::new();
        let coordinator = TransactionCoordinator::new(invoker.clone());

        assert!(coordinator.compensate_operation(&op("trace", "a")).await);
        assert!(
            !coordinator
                .compensate_operation(&TransactionOperation::new("trace", "b", json!({})))
                .await
        );
        assert_eq!(invoker.calls_to("undo_a").len(), 1);
    }
}
