//! The public facade: `execute_task`/`revert_task`/`wait_for_workers` plus
//! the start/stop lifecycle that wires every other component together
//! (§4.7).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;
use wexec_core::{ExecutorError, FailureRecord};

use crate::dispatcher::ResponseDispatcher;
use crate::envelope::{Action, EnvelopeBody};
use crate::maintenance::{publish_to_worker, MaintenanceTick};
use crate::registry::RequestRegistry;
use crate::request::{Outcome, ProgressCallback, Request, RequestState};
use crate::transport::{BoxFuture, HandlerTable, OnWait, RetryOptions, Transport};
use crate::worker_finder::WorkerFinder;

/// Configuration accepted by [`WorkerTaskExecutor::new`] (§6).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Executor identity; doubles as its reply topic.
    pub uuid: String,
    /// Bus exchange name.
    pub exchange: String,
    /// Discovery topics to probe for workers.
    pub topics: Vec<String>,
    /// Default per-request deadline.
    pub transition_timeout: Duration,
    /// Interval between NOTIFY probes.
    pub discovery_period: Duration,
    /// Consecutive missed probe replies before a worker is evicted.
    pub worker_staleness_probes: u32,
    /// Publish retry policy.
    pub retry_options: RetryOptions,
}

impl ExecutorConfig {
    pub fn new(uuid: impl Into<String>, exchange: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            uuid: uuid.into(),
            exchange: exchange.into(),
            topics,
            transition_timeout: Duration::from_secs(60),
            discovery_period: Duration::from_secs(5),
            worker_staleness_probes: 3,
            retry_options: RetryOptions::default(),
        }
    }
}

struct RunningTasks {
    transport: JoinHandle<()>,
    discovery: JoinHandle<()>,
    discovery_stop: Arc<tokio::sync::Notify>,
}

/// The client-side dispatch engine: owns the request registry, the worker
/// discovery loop, the response demultiplexer, and the timeout reaper.
pub struct WorkerTaskExecutor {
    config: ExecutorConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<RequestRegistry>,
    worker_finder: Arc<WorkerFinder>,
    dispatcher: Arc<ResponseDispatcher>,
    maintenance: Arc<MaintenanceTick>,
    started: AtomicBool,
    running: Mutex<Option<RunningTasks>>,
}

impl WorkerTaskExecutor {
    pub fn new(config: ExecutorConfig, transport: Arc<dyn Transport>) -> Self {
        let registry = Arc::new(RequestRegistry::new());
        let worker_finder = Arc::new(WorkerFinder::new(
            config.topics.clone(),
            config.uuid.clone(),
            config.worker_staleness_probes,
        ));
        let dispatcher = Arc::new(ResponseDispatcher::new(registry.clone()));
        let maintenance = Arc::new(MaintenanceTick::new(
            registry.clone(),
            worker_finder.clone(),
            transport.clone(),
            config.uuid.clone(),
        ));
        Self {
            config,
            transport,
            registry,
            worker_finder,
            dispatcher,
            maintenance,
            started: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    /// Bring up the Transport receive loop and the discovery periodic, in
    /// that order; returns only once both are running.
    pub async fn start(&self) -> Result<(), ExecutorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            self.started.store(true, Ordering::SeqCst);
            return Err(ExecutorError::AlreadyStarted);
        }

        let mut handlers = HandlerTable::new();
        let dispatcher = self.dispatcher.clone();
        handlers.register(
            "RESPONSE",
            Arc::new(move |envelope| dispatcher.handle(envelope)),
        );
        let worker_finder = self.worker_finder.clone();
        handlers.register(
            "NOTIFY_RESPONSE",
            Arc::new(move |envelope| {
                if let EnvelopeBody::NotifyResponse(body) = envelope.body {
                    worker_finder.record_response(body.topic, body.tasks);
                }
            }),
        );

        let maintenance = self.maintenance.clone();
        let on_wait: OnWait = Arc::new(move || -> BoxFuture<'static, ()> {
            let maintenance = maintenance.clone();
            Box::pin(async move { maintenance.run().await })
        });

        let transport = self.transport.clone();
        let transport_task = tokio::spawn(async move { transport.start(handlers, on_wait).await });
        self.transport.wait().await;

        let discovery_stop = Arc::new(tokio::sync::Notify::new());
        let discovery_task = {
            let worker_finder = self.worker_finder.clone();
            let transport = self.transport.clone();
            let discovery_period = self.config.discovery_period;
            let discovery_stop = discovery_stop.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(discovery_period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = discovery_stop.notified() => break,
                        _ = ticker.tick() => worker_finder.tick(transport.as_ref()).await,
                    }
                }
            })
        };

        *self.running.lock().unwrap() = Some(RunningTasks {
            transport: transport_task,
            discovery: discovery_task,
            discovery_stop,
        });

        info!(uuid = %self.config.uuid, exchange = %self.config.exchange, "executor started");
        Ok(())
    }

    /// Signal shutdown in reverse order, wait for the Transport loop to
    /// exit, then drain the registry: every remaining request fails with a
    /// timeout and is removed. Finally clears the Worker Finder.
    pub async fn stop(&self) -> Result<(), ExecutorError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Err(ExecutorError::NotStarted);
        }

        let tasks = self.running.lock().unwrap().take();
        if let Some(tasks) = tasks {
            tasks.discovery_stop.notify_waiters();
            let _ = tasks.discovery.await;
            self.transport.stop().await;
            let _ = tasks.transport.await;
        }

        for request in self.registry.drain() {
            let waited = request.created_at.elapsed();
            let states = vec![request.state().to_string()];
            let _ = request.transition(RequestState::Failure);
            let error = ExecutorError::RequestTimeout { waited, states };
            request.set_result(Err(FailureRecord::from(error)));
        }
        self.worker_finder.clear();

        info!(uuid = %self.config.uuid, "executor stopped");
        Ok(())
    }

    /// Submit a task for execution. Returns the promise as a oneshot
    /// receiver; callers await it to learn the terminal outcome.
    pub fn execute_task(
        &self,
        task_name: impl Into<String>,
        uuid: Uuid,
        arguments: serde_json::Value,
        progress_cb: Option<ProgressCallback>,
    ) -> Result<oneshot::Receiver<Outcome>, ExecutorError> {
        self.submit(task_name, uuid, Action::Execute, arguments, None, None, progress_cb)
    }

    /// Submit a compensating (revert) action for a previously executed task.
    #[allow(clippy::too_many_arguments)]
    pub fn revert_task(
        &self,
        task_name: impl Into<String>,
        uuid: Uuid,
        arguments: serde_json::Value,
        result: Option<serde_json::Value>,
        failures: Option<serde_json::Value>,
        progress_cb: Option<ProgressCallback>,
    ) -> Result<oneshot::Receiver<Outcome>, ExecutorError> {
        self.submit(task_name, uuid, Action::Revert, arguments, result, failures, progress_cb)
    }

    #[allow(clippy::too_many_arguments)]
    fn submit(
        &self,
        task_name: impl Into<String>,
        uuid: Uuid,
        action: Action,
        arguments: serde_json::Value,
        result: Option<serde_json::Value>,
        failures: Option<serde_json::Value>,
        progress_cb: Option<ProgressCallback>,
    ) -> Result<oneshot::Receiver<Outcome>, ExecutorError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(ExecutorError::NotStarted);
        }

        let task_name = task_name.into();
        let (request, rx) = Request::new(
            uuid,
            task_name.clone(),
            action,
            arguments,
            self.config.transition_timeout,
            result,
            failures,
        );
        if let Some(callback) = progress_cb {
            // Dropped along with the request once it leaves the registry and
            // the caller's own handles go out of scope; no separate
            // deregistration bookkeeping is needed.
            request.notifier.register("PROGRESS", callback);
        }

        let request = Arc::new(request);
        self.registry.insert(request.clone());

        if let Some(worker_topic) = self.worker_finder.get_worker_for_task(&task_name, &uuid) {
            if request.transition(RequestState::Pending) {
                let registry = self.registry.clone();
                let transport = self.transport.clone();
                let reply_to = self.config.uuid.clone();
                tokio::spawn(async move {
                    publish_to_worker(transport.as_ref(), &registry, &reply_to, &request, &worker_topic).await;
                });
            }
        }

        Ok(rx)
    }

    /// Block until at least `min_count` distinct workers are known, or
    /// `timeout` elapses. Returns the shortfall (0 on success).
    pub async fn wait_for_workers(&self, min_count: usize, timeout: Duration) -> usize {
        self.worker_finder.wait_for_workers(min_count, timeout).await
    }
}
