//! Error type for the runner service.

use uuid::Uuid;

pub use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum RunnerServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] agentflow_engine::EngineError),

    #[error(transparent)]
    Store(#[from] agentflow_store::StoreError),

    #[error("the runner service is already running")]
    AlreadyRunning,

    #[error("the runner service is not running")]
    NotRunning,

    #[error("graceful shutdown timed out with tasks still in flight")]
    ShutdownTimeout,

    #[error("no flow found for runner {0}")]
    FlowNotFound(Uuid),
}
