/// Module invocation seam and registry
pub mod invoker;

/// Versioned state store with change notification
pub mod state_store;

/// Saga transaction coordinator
pub mod transaction_coordinator;

/// Workflow execution service
pub mod workflow_engine;

/// Wiring of the coordination components
pub mod runtime;
