//! The runner service (§4.5): a long-running process that claims pending
//! tasks from the store, executes them through registered handlers, and
//! commits the result back through the dispatcher, while heartbeating its
//! own liveness and periodically reclaiming stale work left by crashed
//! peers.
//!
//! Multiple runner service instances coordinate solely through the store's
//! atomic `claim_tasks` primitive: two instances racing for the same
//! pending task both call `claim_tasks`, and exactly one of them receives
//! it back in its result set (§8 scenario 5). There is no leader election
//! and no other shared in-process state.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use agentflow_core::{AflError, ServerStatus, Task};
use agentflow_store::Store;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use agentflow_engine::{dispatcher, RunnerExecutor};

use crate::backpressure::{BackpressureConfig, BackpressureState};
use crate::config::RunnerConfig;
use crate::error::RunnerServiceError;
use crate::poller::{AdaptiveInterval, PollerConfig};

/// How long `shutdown` waits for in-flight handler executions to finish
/// before giving up and requeuing them anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// The result a registered [`Handler`] reports for a claimed task.
pub type HandlerResult = Result<Value, AflError>;

/// A handler executes one claimed task in-process and reports its result.
/// Registered per facet/handler name, mirroring how an external agent would
/// claim and execute the same task over the network (§4.4).
pub type Handler =
    Arc<dyn Fn(Task) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Draining,
}

/// Long-running process wrapping a [`RunnerExecutor`] with a poll loop,
/// heartbeat, and graceful shutdown (§4.5).
pub struct RunnerService<S: Store> {
    store: Arc<S>,
    executor: Arc<RunnerExecutor<S>>,
    config: RunnerConfig,
    server_id: Uuid,
    backpressure: Arc<BackpressureState>,
    handlers: RwLock<HashMap<String, Handler>>,
    status: RwLock<ServiceStatus>,
    active_tasks: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    poll_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    heartbeat_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    watchdog_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S: Store> RunnerService<S> {
    pub fn new(store: Arc<S>, config: RunnerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backpressure = Arc::new(BackpressureState::new(
            BackpressureConfig::default(),
            config.max_concurrent,
        ));
        let server_id = Uuid::now_v7();
        let executor = Arc::new(RunnerExecutor::new(store.clone()));
        Self {
            store,
            executor,
            active_tasks: Arc::new(Semaphore::new(config.max_concurrent)),
            server_id,
            backpressure,
            handlers: RwLock::new(HashMap::new()),
            status: RwLock::new(ServiceStatus::Stopped),
            shutdown_tx,
            shutdown_rx,
            poll_handle: std::sync::Mutex::new(None),
            heartbeat_handle: std::sync::Mutex::new(None),
            watchdog_handle: std::sync::Mutex::new(None),
            config,
        }
    }

    /// Register a handler for a facet/task name. Only tasks whose `name`
    /// matches a registered handler (and whose topic passes the configured
    /// filter, if any) are ever claimed by this instance.
    pub fn register_handler<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |task| Box::pin(handler(task)));
        self.handlers.write().unwrap().insert(name.into(), handler);
    }

    pub fn server_id(&self) -> Uuid {
        self.server_id
    }

    pub fn executor(&self) -> &Arc<RunnerExecutor<S>> {
        &self.executor
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.read().unwrap()
    }

    pub fn current_load(&self) -> usize {
        self.backpressure.current_load()
    }

    /// The set of task names this instance claims: the configured topic
    /// filter if non-empty, otherwise every registered handler name (Open
    /// Question decision, §9: topics is the subscription filter, task_list
    /// the routing axis; an empty filter subscribes to everything this
    /// process knows how to run).
    fn claimable_topics(&self) -> Vec<String> {
        if !self.config.topics.is_empty() {
            return self.config.topics.clone();
        }
        self.handlers.read().unwrap().keys().cloned().collect()
    }

    #[instrument(skip(self), fields(server_id = %self.server_id))]
    pub async fn start(&self) -> Result<(), RunnerServiceError> {
        {
            let mut status = self.status.write().unwrap();
            if *status != ServiceStatus::Stopped {
                return Err(RunnerServiceError::AlreadyRunning);
            }
            *status = ServiceStatus::Starting;
        }

        let server = agentflow_core::Server {
            uuid: self.server_id,
            group: self.config.worker_group.clone(),
            name: self.config.runner_id.clone(),
            ips: vec![],
            topics: self.claimable_topics(),
            handlers: self.handlers.read().unwrap().keys().cloned().collect(),
            status: ServerStatus::Running,
            ping_time: Utc::now(),
            created: Utc::now(),
        };
        self.store.save_server(&server).await?;

        *self.status.write().unwrap() = ServiceStatus::Running;
        info!(
            server_id = %self.server_id,
            topics = ?self.claimable_topics(),
            max_concurrent = self.config.max_concurrent,
            "runner service started"
        );

        self.spawn_poll_loop();
        self.spawn_heartbeat_loop();
        self.spawn_watchdog_loop();
        Ok(())
    }

    /// Signal shutdown, wait (up to [`SHUTDOWN_GRACE`]) for in-flight
    /// handler executions to finish, then requeue anything this instance
    /// still owns so another runner service can pick it up immediately
    /// rather than waiting for the staleness watchdog.
    #[instrument(skip(self), fields(server_id = %self.server_id))]
    pub async fn shutdown(&self) -> Result<(), RunnerServiceError> {
        {
            let status = *self.status.read().unwrap();
            if status == ServiceStatus::Stopped {
                return Ok(());
            }
        }
        *self.status.write().unwrap() = ServiceStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        let mut timed_out = false;
        loop {
            if self.active_tasks.available_permits() == self.config.max_concurrent {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                timed_out = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for handle in [&self.poll_handle, &self.heartbeat_handle, &self.watchdog_handle] {
            if let Some(h) = handle.lock().unwrap().take() {
                h.abort();
            }
        }

        let requeued = self.store.requeue_tasks_by_server(self.server_id).await?;
        if requeued > 0 {
            info!(requeued, "requeued owned tasks on shutdown");
        }

        *self.status.write().unwrap() = ServiceStatus::Stopped;
        if timed_out {
            warn!("shutdown grace period elapsed with tasks still in flight");
            return Err(RunnerServiceError::ShutdownTimeout);
        }
        Ok(())
    }

    /// Apply the cooperative-cancellation signal (§4.5): if `runner_id`'s
    /// state is `cancelled`, drain it regardless of which instance owns its
    /// in-flight steps.
    pub async fn cancel_runner(&self, runner_id: Uuid) -> Result<(), RunnerServiceError> {
        Ok(self.executor.cancel_workflow(runner_id).await?)
    }

    fn spawn_poll_loop(&self) {
        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let server_id = self.server_id;
        let poller_config = PollerConfig {
            min_interval: self.config.poll_min,
            max_interval: self.config.poll_max,
            ..PollerConfig::default()
        };
        let backpressure = Arc::clone(&self.backpressure);
        let active_tasks = Arc::clone(&self.active_tasks);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let handlers: HashMap<String, Handler> = self.handlers.read().unwrap().clone();
        let topics = self.claimable_topics();

        let handle = tokio::spawn(async move {
            let mut interval = AdaptiveInterval::new(poller_config.clone());
            loop {
                if *shutdown_rx.borrow() {
                    debug!("poll loop: shutdown requested");
                    break;
                }

                if handlers.is_empty() || !backpressure.should_accept() {
                    if wait_or_shutdown(interval.current(), &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }

                let available = backpressure.available_slots().min(poller_config.batch_size);
                if available == 0 {
                    if wait_or_shutdown(interval.current(), &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }

                let claimed = match store.claim_tasks(&topics, server_id, available).await {
                    Ok(tasks) => tasks,
                    Err(e) => {
                        error!(error = %e, "poll: claim_tasks failed");
                        Vec::new()
                    }
                };
                interval.record(claimed.len());

                for task in claimed {
                    let Some(handler) = handlers.get(&task.name).cloned() else {
                        warn!(task_name = %task.name, "claimed task with no registered handler");
                        continue;
                    };
                    let permit = match active_tasks.clone().try_acquire_owned() {
                        Ok(p) => p,
                        Err(_) => break,
                    };
                    backpressure.task_started();

                    let store = Arc::clone(&store);
                    let executor = Arc::clone(&executor);
                    let bp = Arc::clone(&backpressure);
                    tokio::spawn(async move {
                        let task_uuid = task.uuid;
                        let result = handler(task.clone()).await;
                        if let Err(e) = apply_result(&store, &executor, &task, result).await {
                            error!(%task_uuid, error = %e, "failed to apply task result");
                        }
                        bp.task_completed();
                        drop(permit);
                    });
                }

                if wait_or_shutdown(interval.current(), &mut shutdown_rx).await {
                    break;
                }
            }
            debug!("poll loop exited");
        });
        *self.poll_handle.lock().unwrap() = Some(handle);
    }

    fn spawn_heartbeat_loop(&self) {
        let store = Arc::clone(&self.store);
        let server_id = self.server_id;
        let interval_duration = self.config.heartbeat_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval_duration);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.heartbeat_server(server_id).await {
                            error!(error = %e, "heartbeat failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("heartbeat loop: shutdown requested");
                        break;
                    }
                }
            }
        });
        *self.heartbeat_handle.lock().unwrap() = Some(handle);
    }

    fn spawn_watchdog_loop(&self) {
        let store = Arc::clone(&self.store);
        let stale_threshold = self.config.task_stale_threshold;
        // Sweep at roughly twice the staleness threshold's own cadence so a
        // requeue never lags more than half the threshold behind a crash,
        // without hammering the store on every heartbeat tick.
        let sweep_interval = (stale_threshold / 2).max(Duration::from_secs(1));
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match dispatcher::reclaim_stale_tasks(store.as_ref(), stale_threshold).await {
                            Ok(n) if n > 0 => info!(count = n, "reclaimed stale tasks"),
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "stale task reclamation failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("watchdog loop: shutdown requested");
                        break;
                    }
                }
            }
        });
        *self.watchdog_handle.lock().unwrap() = Some(handle);
    }
}

async fn apply_result<S: Store>(
    store: &S,
    executor: &RunnerExecutor<S>,
    task: &Task,
    result: HandlerResult,
) -> Result<(), RunnerServiceError> {
    let runner = store.get_runner(task.runner_id).await?;
    let workflow = store.get_workflow(runner.workflow_id).await?;
    let flow = store.get_flow(workflow.flow_id).await?;

    // A cancelled runner's task row still gets a terminal write here; the
    // step itself no longer will, since `complete_step`/`fail_step`'s
    // conditional `running -> *` silently rejects a step that cancellation
    // already moved out of `running` (§8 scenario 4).
    match result {
        Ok(value) => executor.on_task_completed(&flow, task.uuid, value).await?,
        Err(error) => executor.on_task_failed(&flow, task.uuid, error).await?,
    }
    Ok(())
}

/// Sleep for `duration`, returning early (with `true`) if shutdown fires
/// first.
async fn wait_or_shutdown(duration: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown_rx.changed() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn test_config() -> RunnerConfig {
        RunnerConfig {
            database_url: "unused".to_string(),
            runner_id: "test-runner".to_string(),
            worker_group: "default".to_string(),
            topics: vec![],
            max_concurrent: 4,
            poll_min: StdDuration::from_millis(5),
            poll_max: StdDuration::from_millis(20),
            heartbeat_interval: StdDuration::from_millis(50),
            task_stale_threshold: StdDuration::from_secs(60),
            server_stale_threshold: StdDuration::from_secs(15),
            lock_duration: StdDuration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_start_registers_server_and_sets_running() {
        let store = Arc::new(InMemoryStore::new());
        let service = RunnerService::new(store.clone(), test_config());
        service.start().await.unwrap();
        assert_eq!(service.status(), ServiceStatus::Running);
        let server = store.get_server(service.server_id()).await.unwrap();
        assert_eq!(server.status, ServerStatus::Running);
        service.shutdown().await.unwrap();
        assert_eq!(service.status(), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_errors() {
        let store = Arc::new(InMemoryStore::new());
        let service = RunnerService::new(store, test_config());
        service.start().await.unwrap();
        assert!(matches!(
            service.start().await,
            Err(RunnerServiceError::AlreadyRunning)
        ));
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_claimable_topics_defaults_to_registered_handlers() {
        let store = Arc::new(InMemoryStore::new());
        let service = RunnerService::new(store, test_config());
        service.register_handler("Review", |_task| async { Ok(Value::Null) });
        service.register_handler("Summarize", |_task| async { Ok(Value::Null) });
        let mut topics = service.claimable_topics();
        topics.sort();
        assert_eq!(topics, vec!["Review".to_string(), "Summarize".to_string()]);
    }

    #[tokio::test]
    async fn test_explicit_topics_override_handler_names() {
        let store = Arc::new(InMemoryStore::new());
        let mut config = test_config();
        config.topics = vec!["OnlyThis".to_string()];
        let service = RunnerService::new(store, config);
        service.register_handler("Review", |_task| async { Ok(Value::Null) });
        assert_eq!(service.claimable_topics(), vec!["OnlyThis".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_requeues_owned_running_tasks() {
        let store = Arc::new(InMemoryStore::new());
        let service = RunnerService::new(store.clone(), test_config());

        // A task this instance claimed but never got to execute (e.g. the
        // process is asked to shut down between claim and handler spawn).
        let task = agentflow_core::Task {
            uuid: Uuid::now_v7(),
            runner_id: Uuid::now_v7(),
            step_id: Uuid::now_v7(),
            name: "Review".to_string(),
            task_list_name: "default".to_string(),
            data: Value::Null,
            state: agentflow_core::RecordState::Pending,
            server_id: None,
            created: Utc::now(),
            updated: Utc::now(),
        };
        store.save_task(&task).await.unwrap();
        let claimed = store
            .claim_tasks(&[], service.server_id(), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        service.start().await.unwrap();
        service.shutdown().await.unwrap();

        let after = store.get_task(task.uuid).await.unwrap();
        assert_eq!(after.state, agentflow_core::RecordState::Pending);
        assert!(after.server_id.is_none());
    }

    #[tokio::test]
    async fn test_two_services_claiming_same_task_one_wins() {
        // §8 scenario 5, at the store level the service drives directly.
        let store = Arc::new(InMemoryStore::new());
        let task = agentflow_core::Task {
            uuid: Uuid::now_v7(),
            runner_id: Uuid::now_v7(),
            step_id: Uuid::now_v7(),
            name: "Review".to_string(),
            task_list_name: "default".to_string(),
            data: Value::Null,
            state: agentflow_core::RecordState::Pending,
            server_id: None,
            created: Utc::now(),
            updated: Utc::now(),
        };
        store.save_task(&task).await.unwrap();

        let a = RunnerService::new(store.clone(), test_config());
        let b = RunnerService::new(store.clone(), test_config());

        let claimed_a = store.claim_tasks(&[], a.server_id(), 10).await.unwrap();
        let claimed_b = store.claim_tasks(&[], b.server_id(), 10).await.unwrap();
        assert_eq!(claimed_a.len() + claimed_b.len(), 1);
    }

    #[tokio::test]
    async fn test_handler_executes_and_completes_task() {
        let store = Arc::new(InMemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let service = RunnerService::new(store.clone(), test_config());
        service.register_handler("Echo", move |task: Task| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(task.data)
            }
        });

        // Exercise the handler invocation path directly rather than through
        // the background poll loop's timing.
        let handlers = service.handlers.read().unwrap();
        let handler = handlers.get("Echo").unwrap().clone();
        drop(handlers);
        let result = handler(Task {
            uuid: Uuid::now_v7(),
            runner_id: Uuid::now_v7(),
            step_id: Uuid::now_v7(),
            name: "Echo".to_string(),
            task_list_name: "default".to_string(),
            data: serde_json::json!({"n": 1}),
            state: agentflow_core::RecordState::Running,
            server_id: Some(service.server_id()),
            created: Utc::now(),
            updated: Utc::now(),
        })
        .await;
        assert_eq!(result.unwrap(), serde_json::json!({"n": 1}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
