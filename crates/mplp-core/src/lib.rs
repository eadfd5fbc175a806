//!
//! MPLP Core - Module coordination for the MPLP platform
//!
//! This crate coordinates work across independent modules (context, plan,
//! confirm, trace, role, ...). It provides three services that share one
//! module invocation seam:
//!
//! - [`StateStore`]: versioned cross-module state with change notification
//! - [`TransactionCoordinator`]: saga transactions with reverse-order compensation
//! - [`WorkflowEngine`]: DAG workflows executed over module operations
//!
//! [`CoordinationRuntime`] builds all three from a [`CoordinationConfig`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - core models, entities, and rules
pub mod domain;

/// Application services - coordination logic
pub mod application;

/// Core types and traits
pub mod types;

/// Error types
pub mod error;

/// Runtime configuration
pub mod config;

/// Test doubles for module invocation
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export key types
pub use config::{CoordinationConfig, TransactionScope};
pub use error::{CoreError, ErrorKind};
pub use types::{merge_parameters, ModuleCall, ModuleOperation};

// Application services
pub use application::invoker::{ModuleInvoker, ModuleRegistry};
pub use application::runtime::CoordinationRuntime;
pub use application::state_store::StateStore;
pub use application::transaction_coordinator::TransactionCoordinator;
pub use application::workflow_engine::{
    step_state_key, WorkflowEngine, STEP_COMPLETED, WORKFLOW_STATE_MODULE,
};

// Re-export main API types for easy use
pub use domain::state_sync::{
    FnSubscriber, StateEntry, StateKey, StateSubscriber, StateSyncEvent, SubscriptionId,
    SyncEventFilter, WILDCARD_KEY,
};
pub use domain::transaction::{
    CompensationFailureRecord, OperationStatus, Transaction, TransactionId, TransactionOperation,
    TransactionStatus,
};
pub use domain::workflow_definition::{CompensationSpec, WorkflowDefinition, WorkflowStep};
pub use domain::workflow_instance::{
    StepExecutionResult, StepId, StepStatus, WorkflowId, WorkflowInstance, WorkflowInstanceId,
    WorkflowStatus,
};
