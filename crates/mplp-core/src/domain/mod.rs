/// Workflow definition domain models
pub mod workflow_definition;

/// Workflow instance domain models
pub mod workflow_instance;

/// Transaction domain models
pub mod transaction;

/// Versioned state entries and sync events
pub mod state_sync;
