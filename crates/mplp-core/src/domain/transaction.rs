//! Saga-style transaction aggregate
//!
//! A [`Transaction`] is an ordered log of module operations. Operations are
//! either pending (invoked at commit) or already applied by the caller.
//! Aborting runs the compensations of applied operations in reverse order.

use crate::types::ModuleCall;
use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Value object: Transaction ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Accepting operations
    Active,
    /// Commit requested, pending operations being invoked
    Preparing,
    /// Every operation applied, not yet finalized
    Prepared,
    /// Terminal success
    Committed,
    /// Terminal failure, compensations have run
    Aborted,
}

impl TransactionStatus {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Committed | TransactionStatus::Aborted)
    }
}

/// Lifecycle of a single operation inside a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Not yet invoked
    Pending,
    /// Forward call succeeded
    Applied,
    /// Forward call failed
    Failed,
    /// Compensation succeeded
    Compensated,
    /// Compensation failed
    CompensationFailed,
}

/// One module operation within a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionOperation {
    /// Operation ID
    pub id: String,
    /// Target module
    pub module: String,
    /// Forward operation name
    pub operation: String,
    /// Forward parameters
    pub parameters: Value,
    /// Compensation operation name on the same module
    pub compensation_operation: Option<String>,
    /// Explicit compensation parameters
    pub compensation_parameters: Option<Value>,
    /// Current status
    pub status: OperationStatus,
    /// Result of the forward call
    pub result: Option<Value>,
}

impl TransactionOperation {
    /// Create a pending operation without compensation
    pub fn new(module: impl Into<String>, operation: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            module: module.into(),
            operation: operation.into(),
            parameters,
            compensation_operation: None,
            compensation_parameters: None,
            status: OperationStatus::Pending,
            result: None,
        }
    }

    /// Create a pending operation from a call envelope
    pub fn from_call(call: ModuleCall) -> Self {
        Self::new(call.module, call.operation, call.parameters)
    }

    /// Attach a compensation
    pub fn with_compensation(mut self, operation: impl Into<String>, parameters: Value) -> Self {
        self.compensation_operation = Some(operation.into());
        self.compensation_parameters = Some(parameters);
        self
    }

    /// The forward call
    pub fn call(&self) -> ModuleCall {
        ModuleCall::new(&self.module, &self.operation, self.parameters.clone())
    }

    /// The compensation call, if one is defined
    pub fn compensation_call(&self) -> Option<ModuleCall> {
        self.compensation_operation.as_ref().map(|op| {
            ModuleCall::new(
                &self.module,
                op,
                self.compensation_parameters.clone().unwrap_or(Value::Null),
            )
        })
    }
}

/// A compensation that failed during an abort
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompensationFailureRecord {
    /// Operation whose compensation failed
    pub operation_id: String,
    /// Module of the operation
    pub module: String,
    /// Compensation operation name
    pub operation: String,
    /// Error message
    pub error: String,
    /// When the failure was observed
    pub timestamp: DateTime<Utc>,
}

/// Aggregate: transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique identifier
    pub id: TransactionId,
    /// Current status
    pub status: TransactionStatus,
    /// Operations in insertion order
    pub operations: Vec<TransactionOperation>,
    /// Creation timestamp
    pub start_time: DateTime<Utc>,
    /// Set once terminal
    pub end_time: Option<DateTime<Utc>>,
    /// Deadline relative to `start_time`
    pub timeout: Option<Duration>,
    /// Why the transaction aborted
    pub failure: Option<String>,
    /// Compensations that failed during the abort
    pub compensation_failures: Vec<CompensationFailureRecord>,
}

impl Transaction {
    /// Create a new active transaction
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            id: TransactionId(Uuid::new_v4().to_string()),
            status: TransactionStatus::Active,
            operations: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            timeout,
            failure: None,
            compensation_failures: Vec::new(),
        }
    }

    /// Absolute deadline, if a timeout was set
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let timeout = chrono::Duration::from_std(self.timeout?).ok()?;
        Some(self.start_time + timeout)
    }

    /// Whether the deadline has passed at `now` without the transaction finishing
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.deadline().map(|d| now >= d).unwrap_or(false)
    }

    /// Append an operation; only legal while active
    pub fn push_operation(&mut self, operation: TransactionOperation) -> Result<(), CoreError> {
        if self.status != TransactionStatus::Active {
            return Err(self.illegal("add an operation to"));
        }
        self.operations.push(operation);
        Ok(())
    }

    /// `active -> preparing`
    pub fn begin_prepare(&mut self) -> Result<(), CoreError> {
        if self.status != TransactionStatus::Active {
            return Err(self.illegal("prepare"));
        }
        self.status = TransactionStatus::Preparing;
        Ok(())
    }

    /// `preparing -> prepared`
    pub fn mark_prepared(&mut self) -> Result<(), CoreError> {
        if self.status != TransactionStatus::Preparing {
            return Err(self.illegal("mark prepared"));
        }
        self.status = TransactionStatus::Prepared;
        Ok(())
    }

    /// `prepared -> committed`
    pub fn mark_committed(&mut self) -> Result<(), CoreError> {
        if self.status != TransactionStatus::Prepared {
            return Err(self.illegal("commit"));
        }
        self.status = TransactionStatus::Committed;
        self.end_time = Some(Utc::now());
        Ok(())
    }

    /// Any non-terminal state -> `aborted`
    pub fn mark_aborted(&mut self, reason: Option<String>) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(self.illegal("abort"));
        }
        self.status = TransactionStatus::Aborted;
        if self.failure.is_none() {
            self.failure = reason;
        }
        self.end_time = Some(Utc::now());
        Ok(())
    }

    /// Indices of applied operations, most recent first
    pub fn applied_in_reverse(&self) -> Vec<usize> {
        self.operations
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, op)| op.status == OperationStatus::Applied)
            .map(|(i, _)| i)
            .collect()
    }

    fn illegal(&self, action: &str) -> CoreError {
        CoreError::InvalidStateTransition(format!(
            "Cannot {} transaction {} in state: {:?}",
            action, self.id, self.status
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_happy_path_transitions() {
        let mut tx = Transaction::new(None);
        assert_eq!(tx.status, TransactionStatus::Active);

        tx.push_operation(TransactionOperation::new("plan", "create", json!({})))
            .unwrap();
        tx.begin_prepare().unwrap();
        tx.mark_prepared().unwrap();
        tx.mark_committed().unwrap();

        assert_eq!(tx.status, TransactionStatus::Committed);
        assert!(tx.end_time.is_some());
    }

    #[test]
    fn test_no_appends_outside_active() {
        let mut tx = Transaction::new(None);
        tx.begin_prepare().unwrap();
        let result = tx.push_operation(TransactionOperation::new("plan", "create", json!({})));
        assert!(matches!(result, Err(CoreError::InvalidStateTransition(_))));
        assert!(tx.operations.is_empty());
    }

    #[test]
    fn test_abort_from_any_non_terminal_state() {
        for steps in 0..3 {
            let mut tx = Transaction::new(None);
            if steps >= 1 {
                tx.begin_prepare().unwrap();
            }
            if steps >= 2 {
                tx.mark_prepared().unwrap();
            }
            tx.mark_aborted(Some("boom".to_string())).unwrap();
            assert_eq!(tx.status, TransactionStatus::Aborted);
            assert_eq!(tx.failure.as_deref(), Some("boom"));
        }
    }

    #[test]
    fn test_terminal_states_never_change() {
        let mut committed = Transaction::new(None);
        committed.begin_prepare().unwrap();
        committed.mark_prepared().unwrap();
        committed.mark_committed().unwrap();
        assert!(committed.mark_aborted(None).is_err());
        assert!(committed.begin_prepare().is_err());
        assert_eq!(committed.status, TransactionStatus::Committed);

        let mut aborted = Transaction::new(None);
        aborted.mark_aborted(None).unwrap();
        assert!(aborted.mark_aborted(None).is_err());
        assert!(aborted.begin_prepare().is_err());
    }

    #[test]
    fn test_deadline_and_expiry() {
        let tx = Transaction::new(None);
        assert!(tx.deadline().is_none());
        assert!(!tx.is_expired_at(Utc::now()));

        let tx = Transaction::new(Some(Duration::from_millis(100)));
        let deadline = tx.deadline().unwrap();
        assert!(!tx.is_expired_at(tx.start_time));
        assert!(tx.is_expired_at(deadline));
    }

    #[test]
    fn test_compensation_call_and_reverse_order() {
        let mut tx = Transaction::new(None);
        let mut a = TransactionOperation::new("context", "create", json!({"id": "a"}))
            .with_compensation("delete", json!({"id": "a"}));
        a.status = OperationStatus::Applied;
        let b = TransactionOperation::new("plan", "create", json!({}));
        let mut c = TransactionOperation::new("role", "grant", json!({}));
        c.status = OperationStatus::Applied;

        tx.push_operation(a).unwrap();
        tx.push_operation(b).unwrap();
        tx.push_operation(c).unwrap();

        assert_eq!(tx.applied_in_reverse(), vec![2, 0]);

        let compensation = tx.operations[0].compensation_call().unwrap();
        assert_eq!(compensation.module, "context");
        assert_eq!(compensation.operation, "delete");
        assert_eq!(compensation.parameters, json!({"id": "a"}));
        assert!(tx.operations[2].compensation_call().is_none());
    }
}
