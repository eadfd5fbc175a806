//! Wiring of the coordination components

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::invoker::ModuleInvoker;
use crate::application::state_store::StateStore;
use crate::application::transaction_coordinator::TransactionCoordinator;
use crate::application::workflow_engine::WorkflowEngine;
use crate::config::CoordinationConfig;
use crate::CoreError;

/// The state store, transaction coordinator and workflow engine built from
/// one configuration and sharing one module invoker
pub struct CoordinationRuntime {
    config: CoordinationConfig,
    state_store: Arc<StateStore>,
    transactions: Arc<TransactionCoordinator>,
    engine: WorkflowEngine,
    reaper: Option<JoinHandle<()>>,
}

impl CoordinationRuntime {
    /// Build a runtime that compensates through the forward invoker
    ///
    /// When a sweep interval is configured and a Tokio runtime is available,
    /// a background task aborts expired transactions.
    pub fn new(
        config: CoordinationConfig,
        invoker: Arc<dyn ModuleInvoker>,
    ) -> Result<Self, CoreError> {
        Self::with_compensator(config, invoker.clone(), invoker)
    }

    /// Build a runtime with a separate compensation invoker
    pub fn with_compensator(
        config: CoordinationConfig,
        invoker: Arc<dyn ModuleInvoker>,
        compensator: Arc<dyn ModuleInvoker>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let state_store = Arc::new(StateStore::new());
        let transactions = Arc::new(
            TransactionCoordinator::new(invoker.clone())
                .with_compensator(compensator)
                .with_default_timeout(config.default_transaction_timeout()),
        );
        let engine = WorkflowEngine::new(
            invoker,
            transactions.clone(),
            state_store.clone(),
            &config,
        );

        let reaper = match config.timeout_sweep_interval() {
            Some(interval) if tokio::runtime::Handle::try_current().is_ok() => {
                Some(transactions.spawn_timeout_reaper(interval))
            }
            Some(_) => {
                warn!("No Tokio runtime available, expired transactions are only aborted on access");
                None
            }
            None => None,
        };

        info!(
            scope = ?config.transaction_scope,
            max_concurrent_steps = config.max_concurrent_steps,
            "Coordination runtime initialized"
        );

        Ok(Self {
            config,
            state_store,
            transactions,
            engine,
            reaper,
        })
    }

    /// Configuration the runtime was built with
    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// Shared state store
    pub fn state_store(&self) -> Arc<StateStore> {
        self.state_store.clone()
    }

    /// Transaction coordinator
    pub fn transactions(&self) -> Arc<TransactionCoordinator> {
        self.transactions.clone()
    }

    /// Workflow engine
    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Whether every component reports healthy
    pub fn health_check(&self) -> bool {
        let reaper_alive = self.reaper.as_ref().map_or(true, |h| !h.is_finished());
        self.state_store.health_check()
            && self.transactions.health_check()
            && self.engine.health_check()
            && reaper_alive
    }
}

impl Drop for CoordinationRuntime {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
    }
}
