//! `RunnerExecutor`: the façade the runner service drives. Composes the
//! interpreter (via `state_machine`), the dispatcher, and crash recovery
//! into the handful of operations an HTTP/MCP boundary or a recovery scan
//! actually needs to call (§4.5, §6).

use std::time::Duration;

use agentflow_core::{
    AflError, FacetKind, Flow, LockStatus, RecordState, Runner, RunnerState, Statement, Step,
    StepState, Task, Workflow,
};
use agentflow_store::Store;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::dispatcher;
use crate::error::EngineError;
use crate::state_machine::{advance_and_bubble, advance_step};

/// Owns a handle to the store; stateless beyond that. Cheap to clone the
/// underlying `Arc` and hand to multiple worker tasks in the runner
/// service, mirroring how the store itself is shared there.
pub struct RunnerExecutor<S: Store> {
    store: std::sync::Arc<S>,
}

impl<S: Store> RunnerExecutor<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self { store }
    }

    /// Start a new runner for `workflow` within `flow`, create its root
    /// step, and drive it forward synchronously until it either completes,
    /// fails, or parks on its first event-facet step.
    pub async fn start_workflow(
        &self,
        flow: &Flow,
        workflow: &Workflow,
        params: Value,
    ) -> Result<Runner, EngineError> {
        let (_decl, facet) = flow
            .program
            .find_workflow(&workflow.name)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow.name.clone()))?;

        let now = Utc::now();
        let runner = Runner {
            uuid: Uuid::now_v7(),
            workflow_id: workflow.uuid,
            state: RunnerState::Running,
            params: params.clone(),
            outputs: None,
            error: None,
            created: now,
            updated: now,
        };
        self.store.save_runner(&runner).await?;

        let root = Step {
            uuid: Uuid::now_v7(),
            runner_id: runner.uuid,
            container_id: None,
            block_id: facet.name.clone(),
            statement_id: "0".to_string(),
            is_starting_step: true,
            state: StepState::Pending,
            lock_status: LockStatus::Unlocked,
            statement: facet.body.clone(),
            params,
            returns: None,
            error: None,
            created: now,
            updated: now,
        };
        self.store.save_step(&root).await?;

        advance_step(self.store.as_ref(), flow, runner.uuid, root.uuid).await?;
        Ok(self.store.get_runner(runner.uuid).await?)
    }

    /// Apply a successful agent result for `task_uuid`.
    pub async fn on_task_completed(
        &self,
        flow: &Flow,
        task_uuid: Uuid,
        result: Value,
    ) -> Result<(), EngineError> {
        dispatcher::complete(self.store.as_ref(), flow, task_uuid, result).await
    }

    /// Apply an agent failure for `task_uuid`.
    pub async fn on_task_failed(
        &self,
        flow: &Flow,
        task_uuid: Uuid,
        error: AflError,
    ) -> Result<(), EngineError> {
        dispatcher::fail(self.store.as_ref(), flow, task_uuid, error).await
    }

    /// Cancel a runner and every non-terminal step under it. A task whose
    /// result arrives afterward still applies to the task row, but
    /// `complete_step`'s conditional `running -> completed` silently
    /// rejects it, since the step is no longer `running` (§8 scenario 4).
    pub async fn cancel_workflow(&self, runner_id: Uuid) -> Result<(), EngineError> {
        if self.store.cancel_runner(runner_id).await? {
            self.store.cancel_descendant_steps(runner_id).await?;
        }
        Ok(())
    }

    /// Startup recovery scan (§4.3): move stale tasks back to `pending`,
    /// then for every step still `running` on this runner, inspect its most
    /// recent task. One already `completed`/`failed` means a crash landed
    /// between the agent's reply and this step's own completion — reinject
    /// it directly rather than re-entering the interpreter, which has no
    /// way to know the task already resolved and would simply re-propose
    /// the same `EmitEvent`.
    pub async fn recover_runner(
        &self,
        flow: &Flow,
        runner_id: Uuid,
        stale_threshold: Duration,
    ) -> Result<(), EngineError> {
        self.store.requeue_stale_tasks(stale_threshold).await?;

        let running_steps = self.store.list_running_steps_for_runner(runner_id).await?;
        for step in running_steps {
            let mut tasks = self.store.list_tasks_for_step(step.uuid).await?;
            tasks.sort_by(|a, b| b.created.cmp(&a.created));
            let Some(latest) = tasks.into_iter().next() else {
                // A running container step (AndThen/AndMap/Facet) has no
                // task of its own; its children carry those. Only a running
                // event-facet leaf step is expected to own one.
                if matches!(step.statement, Statement::Facet { kind: FacetKind::EventFacet, .. }) {
                    return Err(EngineError::NoTaskForStep(step.uuid));
                }
                continue;
            };
            match latest.state {
                RecordState::Completed => {
                    reinject_completed(self.store.as_ref(), flow, &step, &latest).await?
                }
                RecordState::Failed => {
                    reinject_failed(self.store.as_ref(), flow, &step, &latest).await?
                }
                _ => {}
            }
        }
        Ok(())
    }
}

async fn reinject_completed<S: Store>(
    store: &S,
    flow: &Flow,
    step: &Step,
    task: &Task,
) -> Result<(), EngineError> {
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
    if !store.complete_step(step.uuid, task.data.clone()).await? {
        return Ok(());
    }
    if step.is_starting_step {
        store.complete_runner(task.runner_id, task.data.clone()).await?;
    } else if let Some(parent_id) = step.container_id {
        advance_and_bubble(store, flow, task.runner_id, parent_id).await?;
    }
    Ok(())
}

async fn reinject_failed<S: Store>(
    store: &S,
    flow: &Flow,
    step: &Step,
    task: &Task,
) -> Result<(), EngineError> {
    let error: AflError = serde_json::from_value(task.data.clone())
        .unwrap_or_else(|_| AflError::internal("agent reported failure with malformed payload"));

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
    if !store.fail_step(step.uuid, error.clone()).await? {
        return Ok(());
    }
    crate::audit::log_step_error(store, task.runner_id, step.uuid, &error).await?;
    if step.is_starting_step {
        if store.fail_runner(task.runner_id, error.clone()).await? {
            crate::audit::log_runner_error(store, task.runner_id, &error).await?;
        }
    } else if let Some(parent_id) = step.container_id {
        advance_and_bubble(store, flow, task.runner_id, parent_id).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::{Declaration, Expr, FacetDecl, FacetKind, Flow as CoreFlow, Program, Statement, WorkflowDecl};
    use agentflow_store::InMemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    /// `AddOne`: `r = IncrementEvent(n=$.n); m = r.out`, grounded on the
    /// canonical example threaded through the interpreter's own tests.
    fn add_one_flow() -> (CoreFlow, Workflow) {
        let body = Statement::AndThen {
            children: vec![
                Statement::Facet {
                    name: "r".into(),
                    kind: FacetKind::EventFacet,
                    topic: Some("increment".into()),
                    params: vec![("n".into(), Expr::Param { segments: vec!["n".into()] })],
                },
                Statement::VariableAssignment {
                    name: "m".into(),
                    expr: Expr::Path { segments: vec!["r".into(), "out".into()] },
                },
            ],
        };
        let program = Program {
            declarations: vec![
                Declaration::FacetDecl(FacetDecl {
                    name: "AddOne".into(),
                    params: vec!["n".into()],
                    returns: vec!["m".into()],
                    body,
                }),
                Declaration::WorkflowDecl(WorkflowDecl {
                    name: "AddOne".into(),
                    facet: "AddOne".into(),
                }),
            ],
        };
        let flow = CoreFlow {
            uuid: Uuid::now_v7(),
            namespace: "test".into(),
            name: "add_one".into(),
            program,
            created: Utc::now(),
        };
        let workflow = Workflow {
            uuid: Uuid::now_v7(),
            flow_id: flow.uuid,
            name: "AddOne".into(),
            version: 1,
            starting_step_id: "0".into(),
        };
        (flow, workflow)
    }

    /// `ReviewAll`: fans out `Review(persona=$item)` over `$.personas`.
    fn review_all_flow() -> (CoreFlow, Workflow) {
        let body = Statement::AndMap {
            source: Expr::Param { segments: vec!["personas".into()] },
            child: Box::new(Statement::Facet {
                name: "Review".into(),
                kind: FacetKind::EventFacet,
                topic: Some("review".into()),
                params: vec![("persona".into(), Expr::name("$item"))],
            }),
        };
        let program = Program {
            declarations: vec![
                Declaration::FacetDecl(FacetDecl {
                    name: "ReviewAll".into(),
                    params: vec!["personas".into()],
                    returns: vec!["reviews".into()],
                    body,
                }),
                Declaration::WorkflowDecl(WorkflowDecl {
                    name: "ReviewAll".into(),
                    facet: "ReviewAll".into(),
                }),
            ],
        };
        let flow = CoreFlow {
            uuid: Uuid::now_v7(),
            namespace: "test".into(),
            name: "review_all".into(),
            program,
            created: Utc::now(),
        };
        let workflow = Workflow {
            uuid: Uuid::now_v7(),
            flow_id: flow.uuid,
            name: "ReviewAll".into(),
            version: 1,
            starting_step_id: "0".into(),
        };
        (flow, workflow)
    }

    #[tokio::test]
    async fn test_add_one_round_trip() {
        let store = Arc::new(InMemoryStore::new());
        let executor = RunnerExecutor::new(store.clone());
        let (flow, workflow) = add_one_flow();

        let runner = executor
            .start_workflow(&flow, &workflow, json!({"n": 41}))
            .await
            .unwrap();
        assert_eq!(runner.state, RunnerState::Running);

        let claimed = store.claim_tasks(&[], Uuid::now_v7(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].name, "r");
        assert_eq!(claimed[0].data, json!({"n": 41}));

        executor
            .on_task_completed(&flow, claimed[0].uuid, json!({"out": 42}))
            .await
            .unwrap();

        let runner = store.get_runner(runner.uuid).await.unwrap();
        assert_eq!(runner.state, RunnerState::Completed);
        assert_eq!(runner.outputs, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_crash_recovery_reinjects_completed_task() {
        let store = Arc::new(InMemoryStore::new());
        let executor = RunnerExecutor::new(store.clone());
        let (flow, workflow) = add_one_flow();

        let runner = executor
            .start_workflow(&flow, &workflow, json!({"n": 1}))
            .await
            .unwrap();
        let claimed = store.claim_tasks(&[], Uuid::now_v7(), 10).await.unwrap();

        // Simulate a crash landing between the agent's reply and this
        // step's own completion: the task resolves, the step does not.
        store
            .complete_task(claimed[0].uuid, json!({"out": 2}))
            .await
            .unwrap();
        let event = store
            .list_events_for_step(claimed[0].step_id)
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.state == RecordState::Running)
            .unwrap();
        store
            .update_event_state(event.uuid, RecordState::Running, RecordState::Completed)
            .await
            .unwrap();

        let runner_before = store.get_runner(runner.uuid).await.unwrap();
        assert_eq!(runner_before.state, RunnerState::Running);

        executor
            .recover_runner(&flow, runner.uuid, Duration::from_secs(60))
            .await
            .unwrap();

        let runner_after = store.get_runner(runner.uuid).await.unwrap();
        assert_eq!(runner_after.state, RunnerState::Completed);
        assert_eq!(runner_after.outputs, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_fan_out_assembles_in_source_order_despite_out_of_order_completion() {
        let store = Arc::new(InMemoryStore::new());
        let executor = RunnerExecutor::new(store.clone());
        let (flow, workflow) = review_all_flow();

        let runner = executor
            .start_workflow(&flow, &workflow, json!({"personas": ["A", "B", "C"]}))
            .await
            .unwrap();

        let claimed = store.claim_tasks(&[], Uuid::now_v7(), 10).await.unwrap();
        assert_eq!(claimed.len(), 3);

        // Complete out of order: C, A, B.
        let by_persona = |p: &str| claimed.iter().find(|t| t.data["persona"] == p).unwrap().uuid;
        executor
            .on_task_completed(&flow, by_persona("C"), json!("C-review"))
            .await
            .unwrap();
        executor
            .on_task_completed(&flow, by_persona("A"), json!("A-review"))
            .await
            .unwrap();
        executor
            .on_task_completed(&flow, by_persona("B"), json!("B-review"))
            .await
            .unwrap();

        let runner = store.get_runner(runner.uuid).await.unwrap();
        assert_eq!(runner.state, RunnerState::Completed);
        assert_eq!(
            runner.outputs,
            Some(json!(["A-review", "B-review", "C-review"]))
        );
    }

    #[tokio::test]
    async fn test_cancellation_rejects_late_task_completion() {
        let store = Arc::new(InMemoryStore::new());
        let executor = RunnerExecutor::new(store.clone());
        let (flow, workflow) = add_one_flow();

        let runner = executor
            .start_workflow(&flow, &workflow, json!({"n": 1}))
            .await
            .unwrap();
        let claimed = store.claim_tasks(&[], Uuid::now_v7(), 10).await.unwrap();

        executor.cancel_workflow(runner.uuid).await.unwrap();
        let runner = store.get_runner(runner.uuid).await.unwrap();
        assert_eq!(runner.state, RunnerState::Cancelled);

        // The agent's reply still lands, but the step is no longer
        // `running`, so it cannot be applied.
        executor
            .on_task_completed(&flow, claimed[0].uuid, json!({"out": 2}))
            .await
            .unwrap();

        let runner = store.get_runner(runner.uuid).await.unwrap();
        assert_eq!(runner.state, RunnerState::Cancelled);
        assert_eq!(runner.outputs, None);
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_ignored() {
        let store = Arc::new(InMemoryStore::new());
        let executor = RunnerExecutor::new(store.clone());
        let (flow, workflow) = add_one_flow();

        executor
            .start_workflow(&flow, &workflow, json!({"n": 1}))
            .await
            .unwrap();
        let claimed = store.claim_tasks(&[], Uuid::now_v7(), 10).await.unwrap();

        executor
            .on_task_completed(&flow, claimed[0].uuid, json!({"out": 2}))
            .await
            .unwrap();
        // A second, racing completion for the same task is a silent no-op:
        // `complete_task`'s conditional update only fires from `running`.
        let result = executor
            .on_task_completed(&flow, claimed[0].uuid, json!({"out": 999}))
            .await;
        assert!(result.is_ok());

        let task = store.get_task(claimed[0].uuid).await.unwrap();
        assert_eq!(task.data, json!({"out": 2}));
    }

    #[tokio::test]
    async fn test_task_failure_mirrors_an_error_log() {
        let store = Arc::new(InMemoryStore::new());
        let executor = RunnerExecutor::new(store.clone());
        let (flow, workflow) = add_one_flow();

        let runner = executor
            .start_workflow(&flow, &workflow, json!({"n": 1}))
            .await
            .unwrap();
        let claimed = store.claim_tasks(&[], Uuid::now_v7(), 10).await.unwrap();

        executor
            .on_task_failed(&flow, claimed[0].uuid, AflError::agent("agent exploded"))
            .await
            .unwrap();

        let runner = store.get_runner(runner.uuid).await.unwrap();
        assert_eq!(runner.state, RunnerState::Failed);

        let logs = store.list_logs_for_runner(runner.uuid).await.unwrap();
        // One for the step, one for the runner (it's the starting step).
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.severity == agentflow_core::LogSeverity::Error));
        assert_eq!(logs[0].order, 0);
        assert_eq!(logs[1].order, 1);
        assert!(logs.iter().any(|l| l.message == "agent exploded"));
    }

    #[tokio::test]
    async fn test_lock_expiry_releases_for_reacquisition() {
        let store = InMemoryStore::new();
        let acquired = store
            .acquire_lock("runner:leader", Duration::from_millis(20), None)
            .await
            .unwrap();
        assert!(acquired);

        let blocked = store
            .acquire_lock("runner:leader", Duration::from_millis(20), None)
            .await
            .unwrap();
        assert!(!blocked);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let reacquired = store
            .acquire_lock("runner:leader", Duration::from_millis(20), None)
            .await
            .unwrap();
        assert!(reacquired);
    }
}
