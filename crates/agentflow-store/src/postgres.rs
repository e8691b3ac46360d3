//! PostgreSQL implementation of [`Store`]
//!
//! Conditional updates are plain `UPDATE ... WHERE uuid = $1 AND state = $2`
//! statements whose `rows_affected()` reports whether the transition fired.
//! The partial-unique indexes on `events`/`tasks` (`step_id` where
//! `state = 'running'`) are real Postgres indexes (see `migrations/`); a
//! violation surfaces through `StoreError::Contention`, never as a generic
//! database error (`From<sqlx::Error>` in `error.rs` makes that translation).

use std::time::Duration;

use agentflow_core::{
    AflError, Event, Flow, Lock, Log, LogOriginator, LogSeverity, RecordState, Runner,
    RunnerState, Server, ServerStatus, Step, StepState, Task, Workflow,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::Store;

/// Embedded migrations, applied by [`PostgresStore::connect`].
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// These enums serialize to a bare JSON string (`#[serde(rename_all =
/// "snake_case")]`); strip the quotes to get the TEXT column value.
fn enum_to_text<T: Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value)? {
        Value::String(s) => Ok(s),
        other => Err(StoreError::Serialization(format!(
            "expected string-like enum, got {other}"
        ))),
    }
}

fn text_to_enum<T: DeserializeOwned>(text: &str) -> Result<T, StoreError> {
    serde_json::from_value(Value::String(text.to_string())).map_err(Into::into)
}

fn opt_error_to_json(error: &Option<AflError>) -> Result<Option<Value>, StoreError> {
    error
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(Into::into)
}

fn json_to_opt_error(value: Option<Value>) -> Result<Option<AflError>, StoreError> {
    value.map(serde_json::from_value).transpose().map_err(Into::into)
}

#[async_trait]
impl Store for PostgresStore {
    #[instrument(skip(self, flow))]
    async fn save_flow(&self, flow: &Flow) -> Result<(), StoreError> {
        let program = serde_json::to_value(&flow.program)?;
        sqlx::query(
            r#"
            INSERT INTO agentflow_flows (uuid, namespace, name, program, created)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (uuid) DO UPDATE SET
                namespace = EXCLUDED.namespace, name = EXCLUDED.name, program = EXCLUDED.program
            "#,
        )
        .bind(flow.uuid)
        .bind(&flow.namespace)
        .bind(&flow.name)
        .bind(&program)
        .bind(flow.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_flow(&self, uuid: Uuid) -> Result<Flow, StoreError> {
        let row = sqlx::query(
            "SELECT uuid, namespace, name, program, created FROM agentflow_flows WHERE uuid = $1",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::FlowNotFound(uuid))?;
        Ok(Flow {
            uuid: row.get("uuid"),
            namespace: row.get("namespace"),
            name: row.get("name"),
            program: serde_json::from_value(row.get("program"))?,
            created: row.get("created"),
        })
    }

    #[instrument(skip(self))]
    async fn find_flow_by_name(&self, namespace: &str, name: &str) -> Result<Option<Flow>, StoreError> {
        let row = sqlx::query(
            "SELECT uuid, namespace, name, program, created FROM agentflow_flows WHERE namespace = $1 AND name = $2",
        )
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(Flow {
                uuid: row.get("uuid"),
                namespace: row.get("namespace"),
                name: row.get("name"),
                program: serde_json::from_value(row.get("program"))?,
                created: row.get("created"),
            })
        })
        .transpose()
    }

    #[instrument(skip(self, workflow))]
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO agentflow_workflows (uuid, flow_id, name, version, starting_step_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (uuid) DO UPDATE SET
                name = EXCLUDED.name, version = EXCLUDED.version, starting_step_id = EXCLUDED.starting_step_id
            "#,
        )
        .bind(workflow.uuid)
        .bind(workflow.flow_id)
        .bind(&workflow.name)
        .bind(workflow.version)
        .bind(&workflow.starting_step_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, uuid: Uuid) -> Result<Workflow, StoreError> {
        let row = sqlx::query(
            "SELECT uuid, flow_id, name, version, starting_step_id FROM agentflow_workflows WHERE uuid = $1",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::WorkflowNotFound(uuid))?;
        Ok(Workflow {
            uuid: row.get("uuid"),
            flow_id: row.get("flow_id"),
            name: row.get("name"),
            version: row.get("version"),
            starting_step_id: row.get("starting_step_id"),
        })
    }

    #[instrument(skip(self))]
    async fn find_workflow_by_name(
        &self,
        flow_id: Uuid,
        name: &str,
    ) -> Result<Option<Workflow>, StoreError> {
        let row = sqlx::query(
            "SELECT uuid, flow_id, name, version, starting_step_id FROM agentflow_workflows WHERE flow_id = $1 AND name = $2",
        )
        .bind(flow_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Workflow {
            uuid: row.get("uuid"),
            flow_id: row.get("flow_id"),
            name: row.get("name"),
            version: row.get("version"),
            starting_step_id: row.get("starting_step_id"),
        }))
    }

    #[instrument(skip(self, runner))]
    async fn save_runner(&self, runner: &Runner) -> Result<(), StoreError> {
        let state = enum_to_text(&runner.state)?;
        let error = opt_error_to_json(&runner.error)?;
        sqlx::query(
            r#"
            INSERT INTO agentflow_runners (uuid, workflow_id, state, params, outputs, error, created, updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (uuid) DO UPDATE SET
                state = EXCLUDED.state, params = EXCLUDED.params, outputs = EXCLUDED.outputs,
                error = EXCLUDED.error, updated = EXCLUDED.updated
            "#,
        )
        .bind(runner.uuid)
        .bind(runner.workflow_id)
        .bind(state)
        .bind(&runner.params)
        .bind(&runner.outputs)
        .bind(&error)
        .bind(runner.created)
        .bind(runner.updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_runner(&self, uuid: Uuid) -> Result<Runner, StoreError> {
        let row = sqlx::query(
            "SELECT uuid, workflow_id, state, params, outputs, error, created, updated FROM agentflow_runners WHERE uuid = $1",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::RunnerNotFound(uuid))?;
        Ok(Runner {
            uuid: row.get("uuid"),
            workflow_id: row.get("workflow_id"),
            state: text_to_enum(row.get("state"))?,
            params: row.get("params"),
            outputs: row.get("outputs"),
            error: json_to_opt_error(row.get("error"))?,
            created: row.get("created"),
            updated: row.get("updated"),
        })
    }

    #[instrument(skip(self))]
    async fn update_runner_state(
        &self,
        uuid: Uuid,
        from: RunnerState,
        to: RunnerState,
    ) -> Result<bool, StoreError> {
        let from = enum_to_text(&from)?;
        let to = enum_to_text(&to)?;
        let result = sqlx::query(
            "UPDATE agentflow_runners SET state = $1, updated = now() WHERE uuid = $2 AND state = $3",
        )
        .bind(to)
        .bind(uuid)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, outputs))]
    async fn complete_runner(&self, uuid: Uuid, outputs: Value) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE agentflow_runners SET state = 'completed', outputs = $1, updated = now() WHERE uuid = $2 AND state = 'running'",
        )
        .bind(&outputs)
        .bind(uuid)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error))]
    async fn fail_runner(&self, uuid: Uuid, error: AflError) -> Result<bool, StoreError> {
        let error = serde_json::to_value(&error)?;
        let result = sqlx::query(
            "UPDATE agentflow_runners SET state = 'failed', error = $1, updated = now() WHERE uuid = $2 AND state = 'running'",
        )
        .bind(&error)
        .bind(uuid)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn cancel_runner(&self, uuid: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE agentflow_runners SET state = 'cancelled', updated = now() WHERE uuid = $1 AND state NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(uuid)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn list_runners_by_workflow(
        &self,
        workflow_id: Uuid,
        state: Option<RunnerState>,
    ) -> Result<Vec<Runner>, StoreError> {
        let state_text = state.map(|s| enum_to_text(&s)).transpose()?;
        let rows = sqlx::query(
            r#"
            SELECT uuid, workflow_id, state, params, outputs, error, created, updated
            FROM agentflow_runners
            WHERE workflow_id = $1 AND ($2::text IS NULL OR state = $2)
            ORDER BY created
            "#,
        )
        .bind(workflow_id)
        .bind(state_text)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(Runner {
                    uuid: row.get("uuid"),
                    workflow_id: row.get("workflow_id"),
                    state: text_to_enum(row.get("state"))?,
                    params: row.get("params"),
                    outputs: row.get("outputs"),
                    error: json_to_opt_error(row.get("error"))?,
                    created: row.get("created"),
                    updated: row.get("updated"),
                })
            })
            .collect()
    }

    #[instrument(skip(self, step))]
    async fn save_step(&self, step: &Step) -> Result<(), StoreError> {
        let state = enum_to_text(&step.state)?;
        let lock_status = enum_to_text(&step.lock_status)?;
        let error = opt_error_to_json(&step.error)?;
        let statement = serde_json::to_value(&step.statement)?;
        sqlx::query(
            r#"
            INSERT INTO agentflow_steps
                (uuid, runner_id, container_id, block_id, statement_id, is_starting_step,
                 state, lock_status, statement, params, returns, error, created, updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (uuid) DO UPDATE SET
                state = EXCLUDED.state, lock_status = EXCLUDED.lock_status, params = EXCLUDED.params,
                returns = EXCLUDED.returns, error = EXCLUDED.error, updated = EXCLUDED.updated
            "#,
        )
        .bind(step.uuid)
        .bind(step.runner_id)
        .bind(step.container_id)
        .bind(&step.block_id)
        .bind(&step.statement_id)
        .bind(step.is_starting_step)
        .bind(state)
        .bind(lock_status)
        .bind(&statement)
        .bind(&step.params)
        .bind(&step.returns)
        .bind(&error)
        .bind(step.created)
        .bind(step.updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_step(&self, uuid: Uuid) -> Result<Step, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT uuid, runner_id, container_id, block_id, statement_id, is_starting_step,
                   state, lock_status, statement, params, returns, error, created, updated
            FROM agentflow_steps WHERE uuid = $1
            "#,
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::StepNotFound(uuid))?;
        row_to_step(row)
    }

    #[instrument(skip(self))]
    async fn update_step_state(
        &self,
        uuid: Uuid,
        from: StepState,
        to: StepState,
    ) -> Result<bool, StoreError> {
        let from = enum_to_text(&from)?;
        let to = enum_to_text(&to)?;
        let result = sqlx::query(
            "UPDATE agentflow_steps SET state = $1, updated = now() WHERE uuid = $2 AND state = $3",
        )
        .bind(to)
        .bind(uuid)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, returns))]
    async fn complete_step(&self, uuid: Uuid, returns: Value) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE agentflow_steps SET state = 'completed', returns = $1, updated = now() WHERE uuid = $2 AND state = 'running'",
        )
        .bind(&returns)
        .bind(uuid)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error))]
    async fn fail_step(&self, uuid: Uuid, error: AflError) -> Result<bool, StoreError> {
        let error = serde_json::to_value(&error)?;
        let result = sqlx::query(
            "UPDATE agentflow_steps SET state = 'failed', error = $1, updated = now() WHERE uuid = $2 AND state = 'running'",
        )
        .bind(&error)
        .bind(uuid)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn list_steps_for_runner(&self, runner_id: Uuid) -> Result<Vec<Step>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT uuid, runner_id, container_id, block_id, statement_id, is_starting_step,
                   state, lock_status, statement, params, returns, error, created, updated
            FROM agentflow_steps WHERE runner_id = $1 ORDER BY created
            "#,
        )
        .bind(runner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_step).collect()
    }

    #[instrument(skip(self))]
    async fn list_steps_for_container(&self, container_id: Uuid) -> Result<Vec<Step>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT uuid, runner_id, container_id, block_id, statement_id, is_starting_step,
                   state, lock_status, statement, params, returns, error, created, updated
            FROM agentflow_steps WHERE container_id = $1 ORDER BY created
            "#,
        )
        .bind(container_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_step).collect()
    }

    #[instrument(skip(self))]
    async fn list_running_steps_for_runner(&self, runner_id: Uuid) -> Result<Vec<Step>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT uuid, runner_id, container_id, block_id, statement_id, is_starting_step,
                   state, lock_status, statement, params, returns, error, created, updated
            FROM agentflow_steps WHERE runner_id = $1 AND state = 'running' ORDER BY created
            "#,
        )
        .bind(runner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_step).collect()
    }

    #[instrument(skip(self))]
    async fn cancel_descendant_steps(&self, runner_id: Uuid) -> Result<u64, StoreError> {
        let error = serde_json::to_value(&AflError::cancelled("runner cancelled"))?;
        let result = sqlx::query(
            r#"
            UPDATE agentflow_steps
            SET state = 'cancelled', error = $1, updated = now()
            WHERE runner_id = $2
              AND state NOT IN ('completed', 'failed', 'cancelled', 'ignored')
            "#,
        )
        .bind(&error)
        .bind(runner_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, event))]
    async fn save_event(&self, event: &Event) -> Result<(), StoreError> {
        let purpose = enum_to_text(&event.purpose)?;
        let state = enum_to_text(&event.state)?;
        sqlx::query(
            r#"
            INSERT INTO agentflow_events
                (uuid, runner_id, step_id, topic, handler, purpose, partition_key,
                 correlation_id, payload, state, created, updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(event.uuid)
        .bind(event.runner_id)
        .bind(event.step_id)
        .bind(&event.topic)
        .bind(&event.handler)
        .bind(purpose)
        .bind(&event.partition_key)
        .bind(&event.correlation_id)
        .bind(&event.payload)
        .bind(state)
        .bind(event.created)
        .bind(event.updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_event(&self, uuid: Uuid) -> Result<Event, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT uuid, runner_id, step_id, topic, handler, purpose, partition_key,
                   correlation_id, payload, state, created, updated
            FROM agentflow_events WHERE uuid = $1
            "#,
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::EventNotFound(uuid))?;
        row_to_event(row)
    }

    #[instrument(skip(self))]
    async fn update_event_state(
        &self,
        uuid: Uuid,
        from: RecordState,
        to: RecordState,
    ) -> Result<bool, StoreError> {
        let from = enum_to_text(&from)?;
        let to = enum_to_text(&to)?;
        let result = sqlx::query(
            "UPDATE agentflow_events SET state = $1, updated = now() WHERE uuid = $2 AND state = $3",
        )
        .bind(to)
        .bind(uuid)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn list_events_for_step(&self, step_id: Uuid) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT uuid, runner_id, step_id, topic, handler, purpose, partition_key,
                   correlation_id, payload, state, created, updated
            FROM agentflow_events WHERE step_id = $1 ORDER BY created, uuid
            "#,
        )
        .bind(step_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_event).collect()
    }

    #[instrument(skip(self, task))]
    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        let state = enum_to_text(&task.state)?;
        sqlx::query(
            r#"
            INSERT INTO agentflow_tasks
                (uuid, runner_id, step_id, name, task_list_name, data, state, server_id, created, updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(task.uuid)
        .bind(task.runner_id)
        .bind(task.step_id)
        .bind(&task.name)
        .bind(&task.task_list_name)
        .bind(&task.data)
        .bind(state)
        .bind(task.server_id)
        .bind(task.created)
        .bind(task.updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_task(&self, uuid: Uuid) -> Result<Task, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT uuid, runner_id, step_id, name, task_list_name, data, state, server_id, created, updated
            FROM agentflow_tasks WHERE uuid = $1
            "#,
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::TaskNotFound(uuid))?;
        row_to_task(row)
    }

    #[instrument(skip(self))]
    async fn update_task_state(
        &self,
        uuid: Uuid,
        from: RecordState,
        to: RecordState,
    ) -> Result<bool, StoreError> {
        let from = enum_to_text(&from)?;
        let to = enum_to_text(&to)?;
        let result = sqlx::query(
            "UPDATE agentflow_tasks SET state = $1, updated = now() WHERE uuid = $2 AND state = $3",
        )
        .bind(to)
        .bind(uuid)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, result))]
    async fn complete_task(&self, uuid: Uuid, result: Value) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "UPDATE agentflow_tasks SET state = 'completed', data = $1, updated = now() WHERE uuid = $2 AND state = 'running'",
        )
        .bind(&result)
        .bind(uuid)
        .execute(&self.pool)
        .await?;
        Ok(row.rows_affected() == 1)
    }

    #[instrument(skip(self, error))]
    async fn fail_task(&self, uuid: Uuid, error: AflError) -> Result<bool, StoreError> {
        let error = serde_json::to_value(&error)?;
        let row = sqlx::query(
            "UPDATE agentflow_tasks SET state = 'failed', data = $1, updated = now() WHERE uuid = $2 AND state = 'running'",
        )
        .bind(&error)
        .bind(uuid)
        .execute(&self.pool)
        .await?;
        Ok(row.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn list_tasks_for_step(&self, step_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT uuid, runner_id, step_id, name, task_list_name, data, state, server_id, created, updated
            FROM agentflow_tasks WHERE step_id = $1 ORDER BY created
            "#,
        )
        .bind(step_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn claim_tasks(
        &self,
        topics: &[String],
        server_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let topics: Option<&[String]> = if topics.is_empty() { None } else { Some(topics) };
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT uuid FROM agentflow_tasks
                WHERE state = 'pending'
                  AND ($1::text[] IS NULL OR name = ANY($1))
                ORDER BY task_list_name, created
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE agentflow_tasks t
            SET state = 'running', server_id = $3, updated = now()
            FROM claimable c
            WHERE t.uuid = c.uuid
            RETURNING t.uuid, t.runner_id, t.step_id, t.name, t.task_list_name, t.data, t.state, t.server_id, t.created, t.updated
            "#,
        )
        .bind(topics)
        .bind(limit as i64)
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn requeue_stale_tasks(&self, stale_threshold: Duration) -> Result<u64, StoreError> {
        let threshold = chrono::Duration::from_std(stale_threshold)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let cutoff: DateTime<Utc> = Utc::now() - threshold;
        let result = sqlx::query(
            r#"
            UPDATE agentflow_tasks
            SET state = 'pending', server_id = NULL, updated = now()
            WHERE state = 'running' AND updated < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn requeue_tasks_by_server(&self, server_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE agentflow_tasks
            SET state = 'pending', server_id = NULL, updated = now()
            WHERE state = 'running' AND server_id = $1
            "#,
        )
        .bind(server_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, log))]
    async fn append_log(&self, log: &Log) -> Result<(), StoreError> {
        let originator = enum_to_text(&log.originator)?;
        let severity = enum_to_text(&log.severity)?;
        sqlx::query(
            r#"
            INSERT INTO agentflow_logs
                (uuid, runner_id, object_id, "order", originator, severity, importance, message, created)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(log.uuid)
        .bind(log.runner_id)
        .bind(log.object_id)
        .bind(log.order)
        .bind(originator)
        .bind(severity)
        .bind(log.importance)
        .bind(&log.message)
        .bind(log.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_logs_for_runner(&self, runner_id: Uuid) -> Result<Vec<Log>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT uuid, runner_id, object_id, "order", originator, severity, importance, message, created
            FROM agentflow_logs WHERE runner_id = $1 ORDER BY "order"
            "#,
        )
        .bind(runner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(Log {
                    uuid: row.get("uuid"),
                    runner_id: row.get("runner_id"),
                    object_id: row.get("object_id"),
                    order: row.get("order"),
                    originator: text_to_enum::<LogOriginator>(row.get("originator"))?,
                    severity: text_to_enum::<LogSeverity>(row.get("severity"))?,
                    importance: row.get("importance"),
                    message: row.get("message"),
                    created: row.get("created"),
                })
            })
            .collect()
    }

    #[instrument(skip(self, server))]
    async fn save_server(&self, server: &Server) -> Result<(), StoreError> {
        let status = enum_to_text(&server.status)?;
        sqlx::query(
            r#"
            INSERT INTO agentflow_servers
                (uuid, "group", name, ips, topics, handlers, status, ping_time, created)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (uuid) DO UPDATE SET
                status = EXCLUDED.status, ping_time = EXCLUDED.ping_time,
                ips = EXCLUDED.ips, topics = EXCLUDED.topics, handlers = EXCLUDED.handlers
            "#,
        )
        .bind(server.uuid)
        .bind(&server.group)
        .bind(&server.name)
        .bind(&server.ips)
        .bind(&server.topics)
        .bind(&server.handlers)
        .bind(status)
        .bind(server.ping_time)
        .bind(server.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_server(&self, uuid: Uuid) -> Result<Server, StoreError> {
        let row = sqlx::query(
            r#"SELECT uuid, "group", name, ips, topics, handlers, status, ping_time, created FROM agentflow_servers WHERE uuid = $1"#,
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::ServerNotFound(uuid))?;
        row_to_server(row)
    }

    #[instrument(skip(self))]
    async fn heartbeat_server(&self, uuid: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE agentflow_servers SET ping_time = now() WHERE uuid = $1")
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ServerNotFound(uuid));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_stale_servers(&self, stale_threshold: Duration) -> Result<Vec<Server>, StoreError> {
        let threshold = chrono::Duration::from_std(stale_threshold)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let cutoff: DateTime<Utc> = Utc::now() - threshold;
        let rows = sqlx::query(
            r#"SELECT uuid, "group", name, ips, topics, handlers, status, ping_time, created FROM agentflow_servers WHERE ping_time < $1"#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_server).collect()
    }

    #[instrument(skip(self, meta))]
    async fn acquire_lock(
        &self,
        key: &str,
        duration: Duration,
        meta: Option<Value>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(duration).map_err(|e| StoreError::Database(e.to_string()))?;
        let result = sqlx::query(
            r#"
            INSERT INTO agentflow_locks (key, acquired_at, expires_at, meta)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE SET
                acquired_at = EXCLUDED.acquired_at, expires_at = EXCLUDED.expires_at, meta = EXCLUDED.meta
            WHERE agentflow_locks.expires_at <= $2
            "#,
        )
        .bind(key)
        .bind(now)
        .bind(expires_at)
        .bind(&meta)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, meta))]
    async fn release_lock(&self, key: &str, meta: Option<&Value>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM agentflow_locks WHERE key = $1 AND ($2::jsonb IS NULL OR meta = $2)",
        )
        .bind(key)
        .bind(meta)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn extend_lock(&self, key: &str, duration: Duration) -> Result<bool, StoreError> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(duration).map_err(|e| StoreError::Database(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE agentflow_locks SET expires_at = $2 WHERE key = $1 AND expires_at > $3",
        )
        .bind(key)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn check_lock(&self, key: &str) -> Result<Option<Lock>, StoreError> {
        let row = sqlx::query("SELECT key, acquired_at, expires_at, meta FROM agentflow_locks WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| Lock {
            key: row.get("key"),
            acquired_at: row.get("acquired_at"),
            expires_at: row.get("expires_at"),
            meta: row.get("meta"),
        }))
    }
}

fn row_to_step(row: sqlx::postgres::PgRow) -> Result<Step, StoreError> {
    Ok(Step {
        uuid: row.get("uuid"),
        runner_id: row.get("runner_id"),
        container_id: row.get("container_id"),
        block_id: row.get("block_id"),
        statement_id: row.get("statement_id"),
        is_starting_step: row.get("is_starting_step"),
        state: text_to_enum(row.get("state"))?,
        lock_status: text_to_enum(row.get("lock_status"))?,
        statement: serde_json::from_value(row.get("statement"))?,
        params: row.get("params"),
        returns: row.get("returns"),
        error: json_to_opt_error(row.get("error"))?,
        created: row.get("created"),
        updated: row.get("updated"),
    })
}

fn row_to_event(row: sqlx::postgres::PgRow) -> Result<Event, StoreError> {
    Ok(Event {
        uuid: row.get("uuid"),
        runner_id: row.get("runner_id"),
        step_id: row.get("step_id"),
        topic: row.get("topic"),
        handler: row.get("handler"),
        purpose: text_to_enum(row.get("purpose"))?,
        partition_key: row.get("partition_key"),
        correlation_id: row.get("correlation_id"),
        payload: row.get("payload"),
        state: text_to_enum(row.get("state"))?,
        created: row.get("created"),
        updated: row.get("updated"),
    })
}

fn row_to_task(row: sqlx::postgres::PgRow) -> Result<Task, StoreError> {
    Ok(Task {
        uuid: row.get("uuid"),
        runner_id: row.get("runner_id"),
        step_id: row.get("step_id"),
        name: row.get("name"),
        task_list_name: row.get("task_list_name"),
        data: row.get("data"),
        state: text_to_enum(row.get("state"))?,
        server_id: row.get("server_id"),
        created: row.get("created"),
        updated: row.get("updated"),
    })
}

fn row_to_server(row: sqlx::postgres::PgRow) -> Result<Server, StoreError> {
    Ok(Server {
        uuid: row.get("uuid"),
        group: row.get("group"),
        name: row.get("name"),
        ips: row.get("ips"),
        topics: row.get("topics"),
        handlers: row.get("handlers"),
        status: text_to_enum::<ServerStatus>(row.get("status"))?,
        ping_time: row.get("ping_time"),
        created: row.get("created"),
    })
}
