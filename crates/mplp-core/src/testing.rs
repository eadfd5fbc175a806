//! Test doubles for the module invocation seam

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

use crate::application::invoker::ModuleInvoker;
use crate::types::ModuleCall;
use crate::CoreError;

#[derive(Clone)]
enum Behaviour {
    Respond(Value),
    Fail(String),
    Delay(Duration),
    Gate(Arc<Semaphore>),
}

/// Handle that releases calls held by [`ScriptedInvoker::gate`]
#[derive(Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    /// Let every held and future call through
    pub fn open(&self) {
        // A closed semaphore fails every acquire, which releases the waiters
        self.0.close();
    }
}

/// Invoker that records every call and answers from a script
///
/// Unscripted calls succeed with `{"module", "operation", "status": "ok"}`.
#[derive(Default)]
pub struct ScriptedInvoker {
    calls: Mutex<Vec<ModuleCall>>,
    script: Mutex<HashMap<(String, String), Behaviour>>,
    called: Notify,
}

impl ScriptedInvoker {
    /// Create an invoker with an empty script
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer `module.operation` with a fixed value
    pub fn respond(&self, module: &str, operation: &str, value: Value) {
        self.set(module, operation, Behaviour::Respond(value));
    }

    /// Fail `module.operation` with a message
    pub fn fail(&self, module: &str, operation: &str, message: &str) {
        self.set(module, operation, Behaviour::Fail(message.to_string()));
    }

    /// Sleep before answering `module.operation`
    pub fn delay(&self, module: &str, operation: &str, delay: Duration) {
        self.set(module, operation, Behaviour::Delay(delay));
    }

    /// Hold `module.operation` until the returned gate opens
    pub fn gate(&self, module: &str, operation: &str) -> Gate {
        let semaphore = Arc::new(Semaphore::new(0));
        self.set(module, operation, Behaviour::Gate(semaphore.clone()));
        Gate(semaphore)
    }

    /// Every call so far, in arrival order
    pub fn calls(&self) -> Vec<ModuleCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Calls of one operation name, in arrival order
    pub fn calls_to(&self, operation: &str) -> Vec<ModuleCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.operation == operation)
            .collect()
    }

    /// Whether `module.operation` has been called
    pub fn was_called(&self, module: &str, operation: &str) -> bool {
        self.calls()
            .iter()
            .any(|c| c.module == module && c.operation == operation)
    }

    /// Wait until `module.operation` has been called
    pub async fn wait_for_call(&self, module: &str, operation: &str) {
        loop {
            // Register before checking so a call between the two is not missed
            let notified = self.called.notified();
            if self.was_called(module, operation) {
                return;
            }
            notified.await;
        }
    }

    fn set(&self, module: &str, operation: &str, behaviour: Behaviour) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((module.to_string(), operation.to_string()), behaviour);
    }
}

#[async_trait]
impl ModuleInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        module: &str,
        operation: &str,
        parameters: &Value,
    ) -> Result<Value, CoreError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ModuleCall::new(module, operation, parameters.clone()));
        self.called.notify_waiters();

        let behaviour = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(module.to_string(), operation.to_string()))
            .cloned();

        let ok = json!({"module": module, "operation": operation, "status": "ok"});
        match behaviour {
            None => Ok(ok),
            Some(Behaviour::Respond(value)) => Ok(value),
            Some(Behaviour::Fail(message)) => {
                Err(CoreError::operation_failure(module, operation, message))
            }
            Some(Behaviour::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(ok)
            }
            Some(Behaviour::Gate(semaphore)) => {
                // Only ever closed, never given permits
                let _ = semaphore.acquire().await;
                Ok(ok)
            }
        }
    }
}
