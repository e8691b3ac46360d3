//! Error type for store operations

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("flow not found: {0}")]
    FlowNotFound(Uuid),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("runner not found: {0}")]
    RunnerNotFound(Uuid),

    #[error("step not found: {0}")]
    StepNotFound(Uuid),

    #[error("event not found: {0}")]
    EventNotFound(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("server not found: {0}")]
    ServerNotFound(Uuid),

    /// A conditional update (transition / claim) found the row already in a
    /// different state, or a partial-unique index rejected a second running
    /// record for the same step. The caller should re-read and retry; this
    /// is a normal signal, not an I/O failure.
    #[error("contention: {0}")]
    Contention(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            // Postgres unique_violation
            if db_err.code().as_deref() == Some("23505") {
                return StoreError::Contention(db_err.message().to_string());
            }
        }
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
