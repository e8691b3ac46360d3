//! The `Store` facade trait
//!
//! One object-safe trait composing all nine collections, mirroring the
//! `durable` crate's single `WorkflowEventStore` rather than nine separate
//! trait objects threaded through every call site (§4.1.1).

use std::time::Duration;

use agentflow_core::{
    Event, Flow, Lock, Log, RecordState, Runner, RunnerState, Server, Step, StepState, Task,
    Workflow,
};
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

pub use crate::error::StoreError;

#[async_trait]
pub trait Store: Send + Sync + 'static {
    // -- flows --------------------------------------------------------
    async fn save_flow(&self, flow: &Flow) -> Result<(), StoreError>;
    async fn get_flow(&self, uuid: Uuid) -> Result<Flow, StoreError>;
    async fn find_flow_by_name(&self, namespace: &str, name: &str) -> Result<Option<Flow>, StoreError>;

    // -- workflows ------------------------------------------------------
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;
    async fn get_workflow(&self, uuid: Uuid) -> Result<Workflow, StoreError>;
    async fn find_workflow_by_name(
        &self,
        flow_id: Uuid,
        name: &str,
    ) -> Result<Option<Workflow>, StoreError>;

    // -- runners --------------------------------------------------------
    async fn save_runner(&self, runner: &Runner) -> Result<(), StoreError>;
    async fn get_runner(&self, uuid: Uuid) -> Result<Runner, StoreError>;
    /// Conditional transition: fires only if the runner's current state
    /// equals `from`. Returns whether it fired.
    async fn update_runner_state(
        &self,
        uuid: Uuid,
        from: RunnerState,
        to: RunnerState,
    ) -> Result<bool, StoreError>;
    async fn list_runners_by_workflow(
        &self,
        workflow_id: Uuid,
        state: Option<RunnerState>,
    ) -> Result<Vec<Runner>, StoreError>;
    /// Conditional `running -> completed`, recording the runner's final
    /// outputs in the same write.
    async fn complete_runner(&self, uuid: Uuid, outputs: Value) -> Result<bool, StoreError>;
    /// Conditional `running -> failed`, recording the error in the same
    /// write.
    async fn fail_runner(&self, uuid: Uuid, error: agentflow_core::AflError) -> Result<bool, StoreError>;
    /// Conditional `running -> cancelled`.
    async fn cancel_runner(&self, uuid: Uuid) -> Result<bool, StoreError>;

    // -- steps ------------------------------------------------------------
    async fn save_step(&self, step: &Step) -> Result<(), StoreError>;
    async fn get_step(&self, uuid: Uuid) -> Result<Step, StoreError>;
    async fn update_step_state(
        &self,
        uuid: Uuid,
        from: StepState,
        to: StepState,
    ) -> Result<bool, StoreError>;
    /// Conditional `running -> completed`, recording `returns` in the same
    /// write.
    async fn complete_step(&self, uuid: Uuid, returns: Value) -> Result<bool, StoreError>;
    /// Conditional `running -> failed`, recording the error in the same
    /// write.
    async fn fail_step(&self, uuid: Uuid, error: agentflow_core::AflError) -> Result<bool, StoreError>;
    async fn list_steps_for_runner(&self, runner_id: Uuid) -> Result<Vec<Step>, StoreError>;
    async fn list_steps_for_container(&self, container_id: Uuid) -> Result<Vec<Step>, StoreError>;
    async fn list_running_steps_for_runner(&self, runner_id: Uuid) -> Result<Vec<Step>, StoreError>;
    /// Cancel every non-terminal step belonging to `runner_id`, setting
    /// `error = Error(kind = cancelled)`. Returns the number cancelled.
    async fn cancel_descendant_steps(&self, runner_id: Uuid) -> Result<u64, StoreError>;

    // -- events -------------------------------------------------------------
    /// Insert a new event. Fails with `StoreError::Contention` if a
    /// `running` event already exists for this `step_id` (partial-unique
    /// index, §6).
    async fn save_event(&self, event: &Event) -> Result<(), StoreError>;
    async fn get_event(&self, uuid: Uuid) -> Result<Event, StoreError>;
    async fn update_event_state(
        &self,
        uuid: Uuid,
        from: RecordState,
        to: RecordState,
    ) -> Result<bool, StoreError>;
    async fn list_events_for_step(&self, step_id: Uuid) -> Result<Vec<Event>, StoreError>;

    // -- tasks -------------------------------------------------------------
    /// Insert a new task. Fails with `StoreError::Contention` if a
    /// `running` task already exists for this `step_id` (partial-unique
    /// index, §6).
    async fn save_task(&self, task: &Task) -> Result<(), StoreError>;
    async fn get_task(&self, uuid: Uuid) -> Result<Task, StoreError>;
    async fn update_task_state(
        &self,
        uuid: Uuid,
        from: RecordState,
        to: RecordState,
    ) -> Result<bool, StoreError>;
    async fn list_tasks_for_step(&self, step_id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// Conditional `running -> completed`, overwriting `data` with the
    /// agent's result in the same write. A crash between this call and the
    /// owning step's completion can still recover the result from the task
    /// row alone (§4.3 recovery protocol).
    async fn complete_task(&self, uuid: Uuid, result: Value) -> Result<bool, StoreError>;
    /// Conditional `running -> failed`, recording the error in the same
    /// write.
    async fn fail_task(&self, uuid: Uuid, error: agentflow_core::AflError) -> Result<bool, StoreError>;

    /// Atomically claim up to `limit` pending tasks whose `name` (handler)
    /// is in `topics` (empty means no topic filter), assigning `server_id`
    /// and flipping them to `running`. Topics are filtered first, then the
    /// claimable set is ordered by `task_list_name` then `created` (Open
    /// Question decision, §4.4/§6.1).
    async fn claim_tasks(
        &self,
        topics: &[String],
        server_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    /// Move every `running` task whose `updated` is older than
    /// `stale_threshold` back to `pending`, clearing `server_id`. Returns
    /// the number of tasks requeued.
    async fn requeue_stale_tasks(&self, stale_threshold: Duration) -> Result<u64, StoreError>;

    /// Unconditionally move every `running` task owned by `server_id` back
    /// to `pending`, clearing `server_id`. Used by a runner service's
    /// shutdown hook to release its claimed work immediately rather than
    /// waiting for the staleness watchdog (§4.5). Returns the number of
    /// tasks requeued.
    async fn requeue_tasks_by_server(&self, server_id: Uuid) -> Result<u64, StoreError>;

    // -- logs ---------------------------------------------------------------
    async fn append_log(&self, log: &Log) -> Result<(), StoreError>;
    async fn list_logs_for_runner(&self, runner_id: Uuid) -> Result<Vec<Log>, StoreError>;

    // -- servers --------------------------------------------------------------
    async fn save_server(&self, server: &Server) -> Result<(), StoreError>;
    async fn get_server(&self, uuid: Uuid) -> Result<Server, StoreError>;
    async fn heartbeat_server(&self, uuid: Uuid) -> Result<(), StoreError>;
    async fn list_stale_servers(&self, stale_threshold: Duration) -> Result<Vec<Server>, StoreError>;

    // -- locks ------------------------------------------------------------------
    /// Returns true iff no non-expired lock existed for `key`; on success
    /// the row's `acquired_at`/`expires_at` are (re)written.
    async fn acquire_lock(
        &self,
        key: &str,
        duration: Duration,
        meta: Option<Value>,
    ) -> Result<bool, StoreError>;
    /// Releases only if the caller's `meta` matches the held lock's `meta`
    /// (when `meta` is provided); returns whether it released.
    async fn release_lock(&self, key: &str, meta: Option<&Value>) -> Result<bool, StoreError>;
    /// Extends `expires_at` only if the lock is still held; returns whether
    /// it extended.
    async fn extend_lock(&self, key: &str, duration: Duration) -> Result<bool, StoreError>;
    async fn check_lock(&self, key: &str) -> Result<Option<Lock>, StoreError>;
}
