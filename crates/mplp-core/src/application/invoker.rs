//! Module invocation seam
//!
//! The coordination core never talks to modules directly. Forward operations
//! and compensations both go through a [`ModuleInvoker`], which the excluded
//! plumbing (per-module services, adapters) implements.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::types::ModuleCall;
use crate::CoreError;

/// Invokes an operation on a module
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModuleInvoker: Send + Sync {
    /// Invoke `operation` on `module` with opaque `parameters`
    async fn invoke(
        &self,
        module: &str,
        operation: &str,
        parameters: &Value,
    ) -> Result<Value, CoreError>;
}

/// Invoke a call, turning a panicking invoker into an [`CoreError::OperationFailure`]
pub(crate) async fn invoke_guarded(
    invoker: &dyn ModuleInvoker,
    call: &ModuleCall,
) -> Result<Value, CoreError> {
    let fut = invoker.invoke(&call.module, &call.operation, &call.parameters);
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            error!(
                module = %call.module,
                operation = %call.operation,
                "Module invoker panicked"
            );
            Err(CoreError::operation_failure(
                &call.module,
                &call.operation,
                "invoker panicked",
            ))
        }
    }
}

/// Routes calls to the invoker registered for each module
#[derive(Default)]
pub struct ModuleRegistry {
    handlers: DashMap<String, Arc<dyn ModuleInvoker>>,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a module, returning the one it replaces
    pub fn register(
        &self,
        module: impl Into<String>,
        handler: Arc<dyn ModuleInvoker>,
    ) -> Option<Arc<dyn ModuleInvoker>> {
        let module = module.into();
        info!(module = %module, "Registering module handler");
        self.handlers.insert(module, handler)
    }

    /// Remove a module handler
    pub fn unregister(&self, module: &str) -> bool {
        self.handlers.remove(module).is_some()
    }

    /// Whether a module has a handler
    pub fn is_registered(&self, module: &str) -> bool {
        self.handlers.contains_key(module)
    }

    /// Registered module names, sorted
    pub fn modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        modules.sort();
        modules
    }
}

#[async_trait]
impl ModuleInvoker for ModuleRegistry {
    async fn invoke(
        &self,
        module: &str,
        operation: &str,
        parameters: &Value,
    ) -> Result<Value, CoreError> {
        // Clone the handler out so no map guard is held across the await
        let handler = self
            .handlers
            .get(module)
            .map(|h| h.value().clone())
            .ok_or_else(|| CoreError::ModuleNotFound(module.to_string()))?;

        debug!(module = %module, operation = %operation, "Dispatching module operation");
        handler.invoke(module, operation, parameters).await
    }
}
