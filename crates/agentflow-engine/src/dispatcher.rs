//! The event/task dispatcher: enqueue, complete, fail, and the stale-task
//! watchdog (§4.4).
//!
//! An event is written directly into `running` state: unlike a task, it has
//! no separate claim step, so "running" simply means "a request is in
//! flight". The partial-unique index on `(step_id) WHERE state = 'running'`
//! is the actual duplicate-enqueue guard; the `list_tasks_for_step` check
//! below is just a cheap fast path that avoids the round trip in the common
//! case.

use std::time::Duration;

use agentflow_core::{AflError, Event, EventPurpose, Flow, RecordState, Task};
use agentflow_store::{Store, StoreError};
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::state_machine::advance_and_bubble;

/// Hand an event-facet step off to the task queue. A no-op if a task is
/// already pending or running for this step (idempotent re-entry after a
/// crash between `advance_step` emitting and this call completing).
pub async fn enqueue<S: Store>(
    store: &S,
    runner_id: Uuid,
    step_id: Uuid,
    topic: &str,
    handler: &str,
    params: Value,
) -> Result<(), EngineError> {
    let existing = store.list_tasks_for_step(step_id).await?;
    if existing
        .iter()
        .any(|t| matches!(t.state, RecordState::Pending | RecordState::Running))
    {
        tracing::debug!(%step_id, "task already enqueued for step, skipping duplicate emit");
        return Ok(());
    }

    let now = Utc::now();
    let event = Event {
        uuid: Uuid::now_v7(),
        runner_id,
        step_id,
        topic: topic.to_string(),
        handler: handler.to_string(),
        purpose: EventPurpose::Workflow,
        partition_key: None,
        correlation_id: None,
        payload: params.clone(),
        state: RecordState::Running,
        created: now,
        updated: now,
    };
    match store.save_event(&event).await {
        Ok(()) => {}
        Err(StoreError::Contention(_)) => {
            tracing::debug!(%step_id, "event already in flight for step, skipping duplicate emit");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    let task = Task {
        uuid: Uuid::now_v7(),
        runner_id,
        step_id,
        name: handler.to_string(),
        task_list_name: topic.to_string(),
        data: params,
        state: RecordState::Pending,
        server_id: None,
        created: now,
        updated: now,
    };
    store.save_task(&task).await?;
    Ok(())
}

/// Apply an agent's successful result: complete the task, its matching
/// event, and the owning step, then let the step's ancestors re-evaluate.
///
/// Each write is independently conditional (`running -> completed`), so a
/// crash at any point leaves a state recovery can resume from rather than
/// one it must unwind (§4.3, §8 scenario 2).
pub async fn complete<S: Store>(
    store: &S,
    flow: &Flow,
    task_uuid: Uuid,
    result: Value,
) -> Result<(), EngineError> {
    let task = store.get_task(task_uuid).await?;
    if task.state != RecordState::Running {
        return Ok(());
    }
    if !store.complete_task(task.uuid, result.clone()).await? {
        return Ok(());
    }

    if let Some(event) = store
        .list_events_for_step(task.step_id)
        .await?
        .into_iter()
        .find(|e| e.state == RecordState::Running)
    {
        store
            .update_event_state(event.uuid, RecordState::Running, RecordState::Completed)
            .await?;
    }

    finish_step(store, flow, &task, true, result, None).await
}

/// Apply an agent's failure: symmetric to [`complete`].
pub async fn fail<S: Store>(
    store: &S,
    flow: &Flow,
    task_uuid: Uuid,
    error: AflError,
) -> Result<(), EngineError> {
    let task = store.get_task(task_uuid).await?;
    if task.state != RecordState::Running {
        return Ok(());
    }
    if !store.fail_task(task.uuid, error.clone()).await? {
        return Ok(());
    }

    if let Some(event) = store
        .list_events_for_step(task.step_id)
        .await?
        .into_iter()
        .find(|e| e.state == RecordState::Running)
    {
        store
            .update_event_state(event.uuid, RecordState::Running, RecordState::Failed)
            .await?;
    }

    finish_step(store, flow, &task, false, Value::Null, Some(error)).await
}

async fn finish_step<S: Store>(
    store: &S,
    flow: &Flow,
    task: &Task,
    succeeded: bool,
    returns: Value,
    error: Option<AflError>,
) -> Result<(), EngineError> {
    let step = store.get_step(task.step_id).await?;

    let applied = if succeeded {
        store.complete_step(task.step_id, returns.clone()).await?
    } else {
        store
            .fail_step(task.step_id, error.clone().expect("error present on failure path"))
            .await?
    };
    if !applied {
        return Ok(());
    }

    if !succeeded {
        let error = error.as_ref().expect("error present on failure path");
        crate::audit::log_step_error(store, task.runner_id, task.step_id, error).await?;
    }

    if step.is_starting_step {
        if succeeded {
            store.complete_runner(task.runner_id, returns).await?;
        } else {
            let error = error.expect("error present on failure path");
            if store.fail_runner(task.runner_id, error.clone()).await? {
                crate::audit::log_runner_error(store, task.runner_id, &error).await?;
            }
        }
    } else if let Some(parent_id) = step.container_id {
        advance_and_bubble(store, flow, task.runner_id, parent_id).await?;
    }
    Ok(())
}

/// Move every task stale past `stale_threshold` back to `pending` so
/// another runner can claim it. Driven periodically by the runner service,
/// independent of any particular runner's startup recovery scan (§4.4).
pub async fn reclaim_stale_tasks<S: Store>(store: &S, stale_threshold: Duration) -> Result<u64, EngineError> {
    Ok(store.requeue_stale_tasks(stale_threshold).await?)
}
