//! The nine persisted entities: Flow, Workflow, Runner, Step, Event, Task,
//! Log, Server, Lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ast::{Program, Statement};
use crate::error::AflError;

/// A compiled AFL translation unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub uuid: Uuid,
    pub namespace: String,
    pub name: String,
    pub program: Program,
    pub created: DateTime<Utc>,
}

/// A named entry point inside a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub uuid: Uuid,
    pub flow_id: Uuid,
    pub name: String,
    pub version: i32,
    pub starting_step_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl RunnerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunnerState::Completed | RunnerState::Failed | RunnerState::Cancelled
        )
    }
}

/// One execution instance of one workflow with concrete parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub uuid: Uuid,
    pub workflow_id: Uuid,
    pub state: RunnerState,
    pub params: serde_json::Value,
    pub outputs: Option<serde_json::Value>,
    pub error: Option<AflError>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
    Ignored,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Cancelled | StepState::Ignored
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Unlocked,
    Locked,
}

impl Default for LockStatus {
    fn default() -> Self {
        LockStatus::Unlocked
    }
}

/// A runtime instance of one statement inside a runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub uuid: Uuid,
    pub runner_id: Uuid,
    pub container_id: Option<Uuid>,
    pub block_id: String,
    pub statement_id: String,
    pub is_starting_step: bool,
    pub state: StepState,
    pub lock_status: LockStatus,
    /// The declaration-tree node this step instantiates, carried verbatim so
    /// the interpreter can resume a step after a crash without re-walking
    /// the program from the root facet on every recovery.
    pub statement: Statement,
    pub params: serde_json::Value,
    pub returns: Option<serde_json::Value>,
    pub error: Option<AflError>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Pending,
    Running,
    Completed,
    Failed,
    Ignored,
    Canceled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventPurpose {
    Workflow,
    Command,
}

/// A durable record of a state transition request attached to a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub uuid: Uuid,
    pub runner_id: Uuid,
    pub step_id: Uuid,
    pub topic: String,
    pub handler: String,
    pub purpose: EventPurpose,
    pub partition_key: Option<String>,
    pub correlation_id: Option<String>,
    pub payload: serde_json::Value,
    pub state: RecordState,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// A queued unit of work claimable by an external agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub uuid: Uuid,
    pub runner_id: Uuid,
    pub step_id: Uuid,
    pub name: String,
    pub task_list_name: String,
    pub data: serde_json::Value,
    pub state: RecordState,
    pub server_id: Option<Uuid>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogOriginator {
    Workflow,
    Agent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogSeverity {
    Error,
    Info,
    Warning,
}

/// An append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    pub uuid: Uuid,
    pub runner_id: Uuid,
    pub object_id: Option<Uuid>,
    pub order: i64,
    pub originator: LogOriginator,
    pub severity: LogSeverity,
    pub importance: i32,
    pub message: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Startup,
    Running,
    Shutdown,
    Error,
}

/// A liveness record for a runner or agent process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub uuid: Uuid,
    pub group: String,
    pub name: String,
    pub ips: Vec<String>,
    pub topics: Vec<String>,
    pub handlers: Vec<String>,
    pub status: ServerStatus,
    pub ping_time: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

/// A keyed lease with acquisition and expiry timestamps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub key: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub meta: Option<serde_json::Value>,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
