use std::sync::Arc;

use crate::backend::CheckpointBackend;
use crate::branch::BranchManager;
use crate::config::CheckpointConfig;
use crate::history::HistoryQuery;
use crate::runner::StepRunner;
use crate::store::CheckpointStore;

/// The store, branch manager and history engine over one shared backend.
#[derive(Clone)]
pub struct Checkpointer {
    store: CheckpointStore,
    branches: BranchManager,
    history: HistoryQuery,
}

impl Checkpointer {
    pub fn new(backend: impl CheckpointBackend + 'static) -> Self {
        Self::with_config(Arc::new(backend), CheckpointConfig::default())
    }

    pub fn with_config(backend: Arc<dyn CheckpointBackend>, config: CheckpointConfig) -> Self {
        Self {
            store: CheckpointStore::new(backend.clone(), config.clone()),
            branches: BranchManager::new(backend.clone(), config.clone()),
            history: HistoryQuery::new(backend, config),
        }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn branches(&self) -> &BranchManager {
        &self.branches
    }

    pub fn history(&self) -> &HistoryQuery {
        &self.history
    }

    pub fn runner(&self) -> StepRunner {
        StepRunner::new(self.store.clone())
    }
}
