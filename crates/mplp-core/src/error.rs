use thiserror::Error;

/// Core error type for the coordination engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid workflow definition (cycle, dangling dependency, duplicate step)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Workflow definition not found
    #[error("Workflow definition not found: {0}")]
    WorkflowDefinitionNotFound(String),

    /// Workflow instance not found
    #[error("Workflow instance not found: {0}")]
    WorkflowInstanceNotFound(String),

    /// Transaction not found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// No handler registered for a module
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    /// A module operation failed
    #[error("Operation {module}.{operation} failed: {message}")]
    OperationFailure {
        /// Target module
        module: String,
        /// Operation name
        operation: String,
        /// Failure description
        message: String,
    },

    /// A compensating operation failed during rollback
    #[error("Compensation {module}.{operation} failed: {message}")]
    CompensationFailure {
        /// Target module
        module: String,
        /// Compensation operation name
        operation: String,
        /// Failure description
        message: String,
    },

    /// A transaction, workflow or step exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Illegal state machine transition
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of [`CoreError`] used for propagation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, returned synchronously and never retried
    Validation,
    /// Unknown id
    NotFound,
    /// Module call failed; triggers an abort
    OperationFailure,
    /// Rollback step failed; recorded only
    CompensationFailure,
    /// Deadline exceeded; triggers an abort
    Timeout,
    /// Illegal state transition
    InvalidState,
    /// Configuration problem
    Configuration,
    /// Anything else
    Internal,
}

impl CoreError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::ValidationError(_) => ErrorKind::Validation,
            CoreError::WorkflowDefinitionNotFound(_)
            | CoreError::WorkflowInstanceNotFound(_)
            | CoreError::TransactionNotFound(_) => ErrorKind::NotFound,
            // An unroutable module call is a failed operation from the caller's view
            CoreError::ModuleNotFound(_) | CoreError::OperationFailure { .. } => {
                ErrorKind::OperationFailure
            }
            CoreError::CompensationFailure { .. } => ErrorKind::CompensationFailure,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::InvalidStateTransition(_) => ErrorKind::InvalidState,
            CoreError::ConfigurationError(_) => ErrorKind::Configuration,
            CoreError::SerializationError(_) | CoreError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Shorthand for an [`CoreError::OperationFailure`]
    pub fn operation_failure(
        module: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CoreError::OperationFailure {
            module: module.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
