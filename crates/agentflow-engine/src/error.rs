//! Error type for the engine crate: store failures plus a handful of
//! engine-local conditions the store can't express on its own.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] agentflow_store::StoreError),

    #[error("no workflow named {0}")]
    WorkflowNotFound(String),

    #[error("no task found for step {0}")]
    NoTaskForStep(Uuid),
}
