//! Mirrors terminal step/runner errors into the append-only log collection
//! for audit (§7): "Logs with `note_type=\"error\"` mirror [terminal
//! step/runner errors] for audit."
//!
//! `order` has no dedicated counter in the store; it's derived by reading
//! the runner's current max and adding one. This is a failure-path-only
//! write (at most once per terminal step/runner), so the extra read is
//! cheap relative to the conditional state transition it accompanies.

use agentflow_core::{AflError, Log, LogOriginator, LogSeverity};
use agentflow_store::Store;
use chrono::Utc;
use uuid::Uuid;

use crate::error::EngineError;

async fn next_order<S: Store>(store: &S, runner_id: Uuid) -> Result<i64, EngineError> {
    Ok(store
        .list_logs_for_runner(runner_id)
        .await?
        .last()
        .map(|l| l.order + 1)
        .unwrap_or(0))
}

/// Append an error log mirroring a step's failure.
pub async fn log_step_error<S: Store>(
    store: &S,
    runner_id: Uuid,
    step_id: Uuid,
    error: &AflError,
) -> Result<(), EngineError> {
    let order = next_order(store, runner_id).await?;
    store
        .append_log(&Log {
            uuid: Uuid::now_v7(),
            runner_id,
            object_id: Some(step_id),
            order,
            originator: LogOriginator::Workflow,
            severity: LogSeverity::Error,
            importance: 0,
            message: error.message.clone(),
            created: Utc::now(),
        })
        .await?;
    Ok(())
}

/// Append an error log mirroring a runner's terminal failure.
pub async fn log_runner_error<S: Store>(
    store: &S,
    runner_id: Uuid,
    error: &AflError,
) -> Result<(), EngineError> {
    let order = next_order(store, runner_id).await?;
    store
        .append_log(&Log {
            uuid: Uuid::now_v7(),
            runner_id,
            object_id: None,
            order,
            originator: LogOriginator::Workflow,
            severity: LogSeverity::Error,
            importance: 0,
            message: error.message.clone(),
            created: Utc::now(),
        })
        .await?;
    Ok(())
}
