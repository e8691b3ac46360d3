//! The step state machine: drives a single step forward by calling the pure
//! interpreter, then applies whatever actions it returns through the
//! `Store` (§4.3).
//!
//! `advance_step` only ever recurses *downward*, into children it just
//! created. It never re-advances its own container — that would let a
//! child completing synchronously (e.g. a `VariableAssignment`) re-enter
//! this same container's in-flight action loop and duplicate a sibling's
//! `CreateChildStep`, since an `AndMap` batch can propose several new
//! children in one call. Upward propagation (a child's completion letting
//! its container progress) happens exactly once, after all of this call's
//! new children have been driven as far as they can go synchronously.
//!
//! Propagating a *dispatcher*-driven completion (an external agent posting
//! a result) up through ancestors that already returned from their own
//! `advance_step` call uses [`advance_and_bubble`] instead.

use agentflow_core::{Action, ChildOutcome, Cursor, FacetKind, Flow, ImplicitDecl, LockStatus, Statement, Step, StepState};
use agentflow_store::Store;
use chrono::Utc;
use uuid::Uuid;

use crate::error::EngineError;
use crate::scope::resolve_scope;

async fn load_children<S: Store>(store: &S, container_id: Uuid) -> Result<Vec<ChildOutcome>, EngineError> {
    let mut steps = store.list_steps_for_container(container_id).await?;
    steps.sort_by_key(|s| s.statement_id.parse::<usize>().unwrap_or(0));
    Ok(steps
        .into_iter()
        .map(|s| ChildOutcome {
            index: s.statement_id.parse().unwrap_or(0),
            completed: s.state == StepState::Completed,
            failed: s.state == StepState::Failed,
            cancelled: s.state == StepState::Cancelled,
            returns: s.returns,
            error: s.error,
        })
        .collect())
}

/// A new child inherits its parent's `block_id` (the enclosing facet's
/// name) unless the parent statement is itself a `Facet` invocation, in
/// which case the child is that facet's body root and takes the facet's
/// own name instead.
fn child_block_id(parent: &Step) -> String {
    match &parent.statement {
        Statement::Facet { name, kind: FacetKind::Facet, .. } => name.clone(),
        _ => parent.block_id.clone(),
    }
}

/// Re-evaluate `step_uuid` against its current persisted state, applying
/// whatever the interpreter proposes. Idempotent and safe to call
/// repeatedly: a step already in a terminal state, or one the caller lost
/// the `pending -> running` race for, is a cheap no-op.
pub async fn advance_step<S: Store>(
    store: &S,
    flow: &Flow,
    runner_id: Uuid,
    step_uuid: Uuid,
) -> Result<(), EngineError> {
    let step = store.get_step(step_uuid).await?;
    if step.state.is_terminal() {
        return Ok(());
    }

    if step.state == StepState::Pending {
        let transitioned = store
            .update_step_state(step.uuid, StepState::Pending, StepState::Running)
            .await?;
        if !transitioned {
            return Ok(());
        }
    } else if step.state != StepState::Running {
        return Ok(());
    }

    let implicits: Vec<ImplicitDecl> = flow.program.implicits().into_iter().cloned().collect();
    let resolved = resolve_scope(store, &step, &implicits).await?;
    let scope = resolved.as_interpreter_scope(&implicits);
    let children = load_children(store, step.uuid).await?;

    let cursor = Cursor {
        program: &flow.program,
        statement: &step.statement,
        is_root: step.is_starting_step,
    };
    let actions = agentflow_core::step(cursor, &scope, &children);
    if actions.is_empty() {
        return Ok(());
    }

    let block_id = child_block_id(&step);
    let mut created_any = false;

    for action in actions {
        match action {
            Action::CreateChildStep { index, statement, params } => {
                created_any = true;
                let now = Utc::now();
                let child = Step {
                    uuid: Uuid::now_v7(),
                    runner_id,
                    container_id: Some(step.uuid),
                    block_id: block_id.clone(),
                    statement_id: index.to_string(),
                    is_starting_step: false,
                    state: StepState::Pending,
                    lock_status: LockStatus::Unlocked,
                    statement,
                    params,
                    returns: None,
                    error: None,
                    created: now,
                    updated: now,
                };
                store.save_step(&child).await?;
                Box::pin(advance_step(store, flow, runner_id, child.uuid)).await?;
            }
            Action::EmitEvent { topic, handler, params } => {
                crate::dispatcher::enqueue(store, runner_id, step.uuid, &topic, &handler, params).await?;
                return Ok(());
            }
            Action::MarkComplete { returns } => {
                store.complete_step(step.uuid, returns).await?;
                return Ok(());
            }
            Action::YieldOutputs { outputs } => {
                if store.complete_step(step.uuid, outputs.clone()).await? {
                    store.complete_runner(runner_id, outputs).await?;
                }
                return Ok(());
            }
            Action::Fail { error } => {
                let step_failed = store.fail_step(step.uuid, error.clone()).await?;
                if step_failed {
                    crate::audit::log_step_error(store, runner_id, step.uuid, &error).await?;
                    if step.is_starting_step && store.fail_runner(runner_id, error.clone()).await? {
                        crate::audit::log_runner_error(store, runner_id, &error).await?;
                    }
                }
                return Ok(());
            }
        }
    }

    if created_any {
        return Box::pin(advance_step(store, flow, runner_id, step.uuid)).await;
    }
    Ok(())
}

/// Advance `step_uuid`, then walk up `container_id` re-advancing every
/// ancestor in turn. Used when re-entering the tree from outside the
/// synchronous chain that originally created `step_uuid` — a dispatcher
/// callback, or a crash-recovery scan. Always walking to the root is
/// deliberately simple: every hop is a cheap no-op once nothing further can
/// progress, since `advance_step` itself is idempotent.
pub async fn advance_and_bubble<S: Store>(
    store: &S,
    flow: &Flow,
    runner_id: Uuid,
    step_uuid: Uuid,
) -> Result<(), EngineError> {
    let mut current = Some(step_uuid);
    while let Some(id) = current {
        let step = store.get_step(id).await?;
        let container_id = step.container_id;
        Box::pin(advance_step(store, flow, runner_id, id)).await?;
        current = container_id;
    }
    Ok(())
}
