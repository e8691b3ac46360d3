//! In-process `Store` implementation for unit and integration tests.
//!
//! Guarded `HashMap`s per collection, mirroring the shape of the `durable`
//! crate's `InMemoryWorkflowEventStore`. The partial-unique-per-step-running
//! invariant and conditional-update semantics are enforced by hand here so
//! tests written against this store exercise real contention behavior
//! rather than a permissive stub.

use std::collections::HashMap;
use std::time::Duration;

use agentflow_core::{
    Event, Flow, Lock, Log, RecordState, Runner, RunnerState, Server, Step, StepState, Task,
    Workflow,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::Store;

#[derive(Default)]
pub struct InMemoryStore {
    flows: RwLock<HashMap<Uuid, Flow>>,
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    runners: RwLock<HashMap<Uuid, Runner>>,
    steps: RwLock<HashMap<Uuid, Step>>,
    events: RwLock<HashMap<Uuid, Event>>,
    tasks: RwLock<HashMap<Uuid, Task>>,
    logs: RwLock<HashMap<Uuid, Log>>,
    servers: RwLock<HashMap<Uuid, Server>>,
    locks: RwLock<HashMap<String, Lock>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runner_count(&self) -> usize {
        self.runners.read().len()
    }

    pub fn pending_task_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.state == RecordState::Pending)
            .count()
    }

    pub fn clear(&self) {
        self.flows.write().clear();
        self.workflows.write().clear();
        self.runners.write().clear();
        self.steps.write().clear();
        self.events.write().clear();
        self.tasks.write().clear();
        self.logs.write().clear();
        self.servers.write().clear();
        self.locks.write().clear();
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn save_flow(&self, flow: &Flow) -> Result<(), StoreError> {
        self.flows.write().insert(flow.uuid, flow.clone());
        Ok(())
    }

    async fn get_flow(&self, uuid: Uuid) -> Result<Flow, StoreError> {
        self.flows
            .read()
            .get(&uuid)
            .cloned()
            .ok_or(StoreError::FlowNotFound(uuid))
    }

    async fn find_flow_by_name(&self, namespace: &str, name: &str) -> Result<Option<Flow>, StoreError> {
        Ok(self
            .flows
            .read()
            .values()
            .find(|f| f.namespace == namespace && f.name == name)
            .cloned())
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.workflows.write().insert(workflow.uuid, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, uuid: Uuid) -> Result<Workflow, StoreError> {
        self.workflows
            .read()
            .get(&uuid)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(uuid))
    }

    async fn find_workflow_by_name(
        &self,
        flow_id: Uuid,
        name: &str,
    ) -> Result<Option<Workflow>, StoreError> {
        Ok(self
            .workflows
            .read()
            .values()
            .find(|w| w.flow_id == flow_id && w.name == name)
            .cloned())
    }

    async fn save_runner(&self, runner: &Runner) -> Result<(), StoreError> {
        self.runners.write().insert(runner.uuid, runner.clone());
        Ok(())
    }

    async fn get_runner(&self, uuid: Uuid) -> Result<Runner, StoreError> {
        self.runners
            .read()
            .get(&uuid)
            .cloned()
            .ok_or(StoreError::RunnerNotFound(uuid))
    }

    async fn update_runner_state(
        &self,
        uuid: Uuid,
        from: RunnerState,
        to: RunnerState,
    ) -> Result<bool, StoreError> {
        let mut runners = self.runners.write();
        let runner = runners.get_mut(&uuid).ok_or(StoreError::RunnerNotFound(uuid))?;
        if runner.state != from {
            return Ok(false);
        }
        runner.state = to;
        runner.updated = Utc::now();
        Ok(true)
    }

    async fn list_runners_by_workflow(
        &self,
        workflow_id: Uuid,
        state: Option<RunnerState>,
    ) -> Result<Vec<Runner>, StoreError> {
        Ok(self
            .runners
            .read()
            .values()
            .filter(|r| r.workflow_id == workflow_id && state.map_or(true, |s| r.state == s))
            .cloned()
            .collect())
    }

    async fn complete_runner(&self, uuid: Uuid, outputs: Value) -> Result<bool, StoreError> {
        let mut runners = self.runners.write();
        let runner = runners.get_mut(&uuid).ok_or(StoreError::RunnerNotFound(uuid))?;
        if runner.state != RunnerState::Running {
            return Ok(false);
        }
        runner.state = RunnerState::Completed;
        runner.outputs = Some(outputs);
        runner.updated = Utc::now();
        Ok(true)
    }

    async fn fail_runner(&self, uuid: Uuid, error: agentflow_core::AflError) -> Result<bool, StoreError> {
        let mut runners = self.runners.write();
        let runner = runners.get_mut(&uuid).ok_or(StoreError::RunnerNotFound(uuid))?;
        if runner.state != RunnerState::Running {
            return Ok(false);
        }
        runner.state = RunnerState::Failed;
        runner.error = Some(error);
        runner.updated = Utc::now();
        Ok(true)
    }

    async fn cancel_runner(&self, uuid: Uuid) -> Result<bool, StoreError> {
        let mut runners = self.runners.write();
        let runner = runners.get_mut(&uuid).ok_or(StoreError::RunnerNotFound(uuid))?;
        if runner.state.is_terminal() {
            return Ok(false);
        }
        runner.state = RunnerState::Cancelled;
        runner.updated = Utc::now();
        Ok(true)
    }

    async fn save_step(&self, step: &Step) -> Result<(), StoreError> {
        self.steps.write().insert(step.uuid, step.clone());
        Ok(())
    }

    async fn get_step(&self, uuid: Uuid) -> Result<Step, StoreError> {
        self.steps
            .read()
            .get(&uuid)
            .cloned()
            .ok_or(StoreError::StepNotFound(uuid))
    }

    async fn update_step_state(
        &self,
        uuid: Uuid,
        from: StepState,
        to: StepState,
    ) -> Result<bool, StoreError> {
        let mut steps = self.steps.write();
        let step = steps.get_mut(&uuid).ok_or(StoreError::StepNotFound(uuid))?;
        if step.state != from {
            return Ok(false);
        }
        step.state = to;
        step.updated = Utc::now();
        Ok(true)
    }

    async fn complete_step(&self, uuid: Uuid, returns: Value) -> Result<bool, StoreError> {
        let mut steps = self.steps.write();
        let step = steps.get_mut(&uuid).ok_or(StoreError::StepNotFound(uuid))?;
        if step.state != StepState::Running {
            return Ok(false);
        }
        step.state = StepState::Completed;
        step.returns = Some(returns);
        step.updated = Utc::now();
        Ok(true)
    }

    async fn fail_step(&self, uuid: Uuid, error: agentflow_core::AflError) -> Result<bool, StoreError> {
        let mut steps = self.steps.write();
        let step = steps.get_mut(&uuid).ok_or(StoreError::StepNotFound(uuid))?;
        if step.state != StepState::Running {
            return Ok(false);
        }
        step.state = StepState::Failed;
        step.error = Some(error);
        step.updated = Utc::now();
        Ok(true)
    }

    async fn list_steps_for_runner(&self, runner_id: Uuid) -> Result<Vec<Step>, StoreError> {
        Ok(self
            .steps
            .read()
            .values()
            .filter(|s| s.runner_id == runner_id)
            .cloned()
            .collect())
    }

    async fn list_steps_for_container(&self, container_id: Uuid) -> Result<Vec<Step>, StoreError> {
        let mut steps: Vec<Step> = self
            .steps
            .read()
            .values()
            .filter(|s| s.container_id == Some(container_id))
            .cloned()
            .collect();
        steps.sort_by(|a, b| a.created.cmp(&b.created));
        Ok(steps)
    }

    async fn list_running_steps_for_runner(&self, runner_id: Uuid) -> Result<Vec<Step>, StoreError> {
        Ok(self
            .steps
            .read()
            .values()
            .filter(|s| s.runner_id == runner_id && s.state == StepState::Running)
            .cloned()
            .collect())
    }

    async fn cancel_descendant_steps(&self, runner_id: Uuid) -> Result<u64, StoreError> {
        let mut steps = self.steps.write();
        let mut cancelled = 0;
        for step in steps.values_mut() {
            if step.runner_id == runner_id && !step.state.is_terminal() {
                step.state = StepState::Cancelled;
                step.error = Some(agentflow_core::AflError::cancelled("runner cancelled"));
                step.updated = Utc::now();
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn save_event(&self, event: &Event) -> Result<(), StoreError> {
        let mut events = self.events.write();
        if event.state == RecordState::Running {
            let already_running = events
                .values()
                .any(|e| e.step_id == event.step_id && e.state == RecordState::Running);
            if already_running {
                return Err(StoreError::Contention(format!(
                    "event already running for step {}",
                    event.step_id
                )));
            }
        }
        events.insert(event.uuid, event.clone());
        Ok(())
    }

    async fn get_event(&self, uuid: Uuid) -> Result<Event, StoreError> {
        self.events
            .read()
            .get(&uuid)
            .cloned()
            .ok_or(StoreError::EventNotFound(uuid))
    }

    async fn update_event_state(
        &self,
        uuid: Uuid,
        from: RecordState,
        to: RecordState,
    ) -> Result<bool, StoreError> {
        let mut events = self.events.write();
        if to == RecordState::Running {
            let step_id = events
                .get(&uuid)
                .ok_or(StoreError::EventNotFound(uuid))?
                .step_id;
            let already_running = events
                .values()
                .any(|e| e.uuid != uuid && e.step_id == step_id && e.state == RecordState::Running);
            if already_running {
                return Err(StoreError::Contention(format!(
                    "event already running for step {step_id}"
                )));
            }
        }
        let event = events.get_mut(&uuid).ok_or(StoreError::EventNotFound(uuid))?;
        if event.state != from {
            return Ok(false);
        }
        event.state = to;
        event.updated = Utc::now();
        Ok(true)
    }

    async fn list_events_for_step(&self, step_id: Uuid) -> Result<Vec<Event>, StoreError> {
        let mut events: Vec<Event> = self
            .events
            .read()
            .values()
            .filter(|e| e.step_id == step_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.created.cmp(&b.created).then(a.uuid.cmp(&b.uuid)));
        Ok(events)
    }

    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        self.tasks.write().insert(task.uuid, task.clone());
        Ok(())
    }

    async fn get_task(&self, uuid: Uuid) -> Result<Task, StoreError> {
        self.tasks
            .read()
            .get(&uuid)
            .cloned()
            .ok_or(StoreError::TaskNotFound(uuid))
    }

    async fn update_task_state(
        &self,
        uuid: Uuid,
        from: RecordState,
        to: RecordState,
    ) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write();
        if to == RecordState::Running {
            let step_id = tasks.get(&uuid).ok_or(StoreError::TaskNotFound(uuid))?.step_id;
            let already_running = tasks
                .values()
                .any(|t| t.uuid != uuid && t.step_id == step_id && t.state == RecordState::Running);
            if already_running {
                return Err(StoreError::Contention(format!(
                    "task already running for step {step_id}"
                )));
            }
        }
        let task = tasks.get_mut(&uuid).ok_or(StoreError::TaskNotFound(uuid))?;
        if task.state != from {
            return Ok(false);
        }
        task.state = to;
        task.updated = Utc::now();
        Ok(true)
    }

    async fn complete_task(&self, uuid: Uuid, result: Value) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(&uuid).ok_or(StoreError::TaskNotFound(uuid))?;
        if task.state != RecordState::Running {
            return Ok(false);
        }
        task.state = RecordState::Completed;
        task.data = result;
        task.updated = Utc::now();
        Ok(true)
    }

    async fn fail_task(&self, uuid: Uuid, error: agentflow_core::AflError) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(&uuid).ok_or(StoreError::TaskNotFound(uuid))?;
        if task.state != RecordState::Running {
            return Ok(false);
        }
        task.state = RecordState::Failed;
        task.data = serde_json::to_value(&error).map_err(StoreError::from)?;
        task.updated = Utc::now();
        Ok(true)
    }

    async fn list_tasks_for_step(&self, step_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.step_id == step_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created.cmp(&b.created));
        Ok(tasks)
    }

    async fn claim_tasks(
        &self,
        topics: &[String],
        server_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let mut tasks = self.tasks.write();

        let mut candidates: Vec<Uuid> = tasks
            .values()
            .filter(|t| t.state == RecordState::Pending)
            .filter(|t| topics.is_empty() || topics.contains(&t.name))
            .map(|t| t.uuid)
            .collect();
        candidates.sort_by_key(|uuid| {
            let t = &tasks[uuid];
            (t.task_list_name.clone(), t.created)
        });

        let mut claimed = Vec::new();
        for uuid in candidates.into_iter().take(limit) {
            let step_id = tasks[&uuid].step_id;
            let step_already_running = tasks
                .values()
                .any(|t| t.uuid != uuid && t.step_id == step_id && t.state == RecordState::Running);
            if step_already_running {
                continue;
            }
            let task = tasks.get_mut(&uuid).expect("candidate exists");
            task.state = RecordState::Running;
            task.server_id = Some(server_id);
            task.updated = Utc::now();
            claimed.push(task.clone());
        }
        Ok(claimed)
    }

    async fn requeue_stale_tasks(&self, stale_threshold: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(stale_threshold)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let mut tasks = self.tasks.write();
        let mut requeued = 0;
        for task in tasks.values_mut() {
            if task.state == RecordState::Running && task.updated < cutoff {
                task.state = RecordState::Pending;
                task.server_id = None;
                task.updated = Utc::now();
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn requeue_tasks_by_server(&self, server_id: Uuid) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.write();
        let mut requeued = 0;
        for task in tasks.values_mut() {
            if task.state == RecordState::Running && task.server_id == Some(server_id) {
                task.state = RecordState::Pending;
                task.server_id = None;
                task.updated = Utc::now();
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn append_log(&self, log: &Log) -> Result<(), StoreError> {
        self.logs.write().insert(log.uuid, log.clone());
        Ok(())
    }

    async fn list_logs_for_runner(&self, runner_id: Uuid) -> Result<Vec<Log>, StoreError> {
        let mut logs: Vec<Log> = self
            .logs
            .read()
            .values()
            .filter(|l| l.runner_id == runner_id)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.order);
        Ok(logs)
    }

    async fn save_server(&self, server: &Server) -> Result<(), StoreError> {
        self.servers.write().insert(server.uuid, server.clone());
        Ok(())
    }

    async fn get_server(&self, uuid: Uuid) -> Result<Server, StoreError> {
        self.servers
            .read()
            .get(&uuid)
            .cloned()
            .ok_or(StoreError::ServerNotFound(uuid))
    }

    async fn heartbeat_server(&self, uuid: Uuid) -> Result<(), StoreError> {
        let mut servers = self.servers.write();
        let server = servers.get_mut(&uuid).ok_or(StoreError::ServerNotFound(uuid))?;
        server.ping_time = Utc::now();
        Ok(())
    }

    async fn list_stale_servers(&self, stale_threshold: Duration) -> Result<Vec<Server>, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(stale_threshold)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(self
            .servers
            .read()
            .values()
            .filter(|s| s.ping_time < cutoff)
            .cloned()
            .collect())
    }

    async fn acquire_lock(
        &self,
        key: &str,
        duration: Duration,
        meta: Option<Value>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut locks = self.locks.write();
        if let Some(existing) = locks.get(key) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }
        let duration = chrono::Duration::from_std(duration).map_err(|e| StoreError::Database(e.to_string()))?;
        locks.insert(
            key.to_string(),
            Lock {
                key: key.to_string(),
                acquired_at: now,
                expires_at: now + duration,
                meta,
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, key: &str, meta: Option<&Value>) -> Result<bool, StoreError> {
        let mut locks = self.locks.write();
        match locks.get(key) {
            Some(lock) if meta.is_none() || lock.meta.as_ref() == meta => {
                locks.remove(key);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn extend_lock(&self, key: &str, duration: Duration) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut locks = self.locks.write();
        match locks.get_mut(key) {
            Some(lock) if !lock.is_expired(now) => {
                let duration =
                    chrono::Duration::from_std(duration).map_err(|e| StoreError::Database(e.to_string()))?;
                lock.expires_at = now + duration;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn check_lock(&self, key: &str) -> Result<Option<Lock>, StoreError> {
        Ok(self.locks.read().get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::{EventPurpose, LockStatus};
    use serde_json::json;

    fn sample_task(runner_id: Uuid, step_id: Uuid, name: &str) -> Task {
        let now = Utc::now();
        Task {
            uuid: Uuid::now_v7(),
            runner_id,
            step_id,
            name: name.to_string(),
            task_list_name: "default".to_string(),
            data: json!({}),
            state: RecordState::Pending,
            server_id: None,
            created: now,
            updated: now,
        }
    }

    fn sample_step(runner_id: Uuid) -> Step {
        let now = Utc::now();
        Step {
            uuid: Uuid::now_v7(),
            runner_id,
            container_id: None,
            block_id: "root".into(),
            statement_id: "0".into(),
            is_starting_step: true,
            state: StepState::Running,
            lock_status: LockStatus::Unlocked,
            statement: agentflow_core::Statement::AndThen { children: vec![] },
            params: json!({}),
            returns: None,
            error: None,
            created: now,
            updated: now,
        }
    }

    #[tokio::test]
    async fn test_claim_tasks_filters_by_topic_and_flips_state() {
        let store = InMemoryStore::new();
        let runner_id = Uuid::now_v7();
        let step = sample_step(runner_id);
        store.save_step(&step).await.unwrap();

        let wanted = sample_task(runner_id, step.uuid, "Review");
        let unwanted = sample_task(runner_id, Uuid::now_v7(), "OtherHandler");
        store.save_task(&wanted).await.unwrap();
        store.save_task(&unwanted).await.unwrap();

        let server_id = Uuid::now_v7();
        let claimed = store
            .claim_tasks(&["Review".to_string()], server_id, 10)
            .await
            .unwrap();

        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].uuid, wanted.uuid);
        assert_eq!(claimed[0].state, RecordState::Running);
        assert_eq!(claimed[0].server_id, Some(server_id));
    }

    #[tokio::test]
    async fn test_update_task_state_contention_on_duplicate_running() {
        let store = InMemoryStore::new();
        let runner_id = Uuid::now_v7();
        let step_id = Uuid::now_v7();
        let mut first = sample_task(runner_id, step_id, "Review");
        let second = sample_task(runner_id, step_id, "Review");
        first.state = RecordState::Running;
        store.save_task(&first).await.unwrap();
        store.save_task(&second).await.unwrap();

        let result = store
            .update_task_state(second.uuid, RecordState::Pending, RecordState::Running)
            .await;
        assert!(matches!(result, Err(StoreError::Contention(_))));
    }

    #[tokio::test]
    async fn test_complete_task_overwrites_data_and_requires_running() {
        let store = InMemoryStore::new();
        let runner_id = Uuid::now_v7();
        let step_id = Uuid::now_v7();
        let mut task = sample_task(runner_id, step_id, "IncrementEvent");
        task.state = RecordState::Pending;
        store.save_task(&task).await.unwrap();

        // not running yet: no-op
        let ok = store.complete_task(task.uuid, json!({"out": 42})).await.unwrap();
        assert!(!ok);

        store
            .update_task_state(task.uuid, RecordState::Pending, RecordState::Running)
            .await
            .unwrap();
        let ok = store.complete_task(task.uuid, json!({"out": 42})).await.unwrap();
        assert!(ok);

        let stored = store.get_task(task.uuid).await.unwrap();
        assert_eq!(stored.state, RecordState::Completed);
        assert_eq!(stored.data, json!({"out": 42}));
    }

    #[tokio::test]
    async fn test_fail_task_records_error_in_data() {
        let store = InMemoryStore::new();
        let runner_id = Uuid::now_v7();
        let step_id = Uuid::now_v7();
        let mut task = sample_task(runner_id, step_id, "IncrementEvent");
        task.state = RecordState::Running;
        store.save_task(&task).await.unwrap();

        let error = agentflow_core::AflError::agent("refused");
        let ok = store.fail_task(task.uuid, error.clone()).await.unwrap();
        assert!(ok);

        let stored = store.get_task(task.uuid).await.unwrap();
        assert_eq!(stored.state, RecordState::Failed);
        assert_eq!(stored.data, serde_json::to_value(&error).unwrap());
    }

    #[tokio::test]
    async fn test_update_runner_state_conditional() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let runner = Runner {
            uuid: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            state: RunnerState::Created,
            params: json!({}),
            outputs: None,
            error: None,
            created: now,
            updated: now,
        };
        store.save_runner(&runner).await.unwrap();

        let fired = store
            .update_runner_state(runner.uuid, RunnerState::Created, RunnerState::Running)
            .await
            .unwrap();
        assert!(fired);

        // stale expectation: runner is already Running, not Created
        let fired_again = store
            .update_runner_state(runner.uuid, RunnerState::Created, RunnerState::Running)
            .await
            .unwrap();
        assert!(!fired_again);
    }

    #[tokio::test]
    async fn test_lock_acquire_release_extend() {
        let store = InMemoryStore::new();
        let acquired = store
            .acquire_lock("flow-gc", Duration::from_millis(50), None)
            .await
            .unwrap();
        assert!(acquired);

        let reacquire = store
            .acquire_lock("flow-gc", Duration::from_millis(50), None)
            .await
            .unwrap();
        assert!(!reacquire);

        let extended = store
            .extend_lock("flow-gc", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(extended);

        let released = store.release_lock("flow-gc", None).await.unwrap();
        assert!(released);

        let reacquire_after_release = store
            .acquire_lock("flow-gc", Duration::from_millis(50), None)
            .await
            .unwrap();
        assert!(reacquire_after_release);
    }

    #[tokio::test]
    async fn test_lock_reclaimable_after_expiry() {
        let store = InMemoryStore::new();
        store
            .acquire_lock("expiring", Duration::from_millis(1), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reacquired = store
            .acquire_lock("expiring", Duration::from_millis(50), None)
            .await
            .unwrap();
        assert!(reacquired);
    }

    #[tokio::test]
    async fn test_event_purpose_roundtrip_through_store() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let event = Event {
            uuid: Uuid::now_v7(),
            runner_id: Uuid::now_v7(),
            step_id: Uuid::now_v7(),
            topic: "review".into(),
            handler: "Review".into(),
            purpose: EventPurpose::Workflow,
            partition_key: None,
            correlation_id: None,
            payload: json!({"persona": "skeptic"}),
            state: RecordState::Pending,
            created: now,
            updated: now,
        };
        store.save_event(&event).await.unwrap();
        let fetched = store.get_event(event.uuid).await.unwrap();
        assert_eq!(fetched.purpose, EventPurpose::Workflow);
    }
}
