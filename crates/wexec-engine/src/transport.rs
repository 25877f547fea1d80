//! Carries envelopes to and from the bus (§4.1).
//!
//! The executor only depends on the [`Transport`] trait; the reference
//! implementation shipped here (`InProcessBus`/`InProcessTransport`) is an
//! in-memory topic bus good enough for a single process and for tests. A
//! network-backed implementation (AMQP, NATS, or similar) plugs in by
//! implementing the same trait.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};
use wexec_core::ExecutorError;

use crate::envelope::Envelope;

/// A boxed, `Send` future, used where a trait cannot otherwise express an
/// `async fn` argument.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Synchronous callback invoked with a decoded inbound envelope.
///
/// Handlers run on the transport's receive loop and must not block; the
/// work they do (state transitions, promise fulfillment) is itself
/// non-blocking by construction (§5).
pub type Handler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Maps a message kind (`"RESPONSE"`, `"NOTIFY_RESPONSE"`, ...) to the
/// handler responsible for it. Built once at [`crate::executor`] startup and
/// cleared at `stop()`, which is how the Transport/Executor reference cycle
/// described in the design notes is broken without weak pointers.
#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<&'static str, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: &'static str, handler: Handler) {
        self.handlers.insert(kind, handler);
    }

    /// Dispatch `envelope` to its handler, or log and drop it.
    pub fn dispatch(&self, envelope: Envelope) {
        let kind = envelope.body.kind();
        match self.handlers.get(kind) {
            Some(handler) => handler(envelope),
            None => debug!(kind, "dropped envelope with no registered handler"),
        }
    }
}

/// Invoked by the transport's receive loop between inbound batches (§4.6).
pub type OnWait = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Publish retry policy: exponential backoff with a cap, consistent with the
/// executor's overall "retries are the transport's problem" stance (§4.1).
#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

fn backoff_delay(options: &RetryOptions, attempt: u32) -> Duration {
    let scaled = options.base_delay.saturating_mul(1u32 << attempt.min(16));
    scaled.min(options.max_delay)
}

/// Carries envelopes between the executor and the bus.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish `envelope` to `topic`, retrying transient failures per the
    /// transport's retry policy. Fails with `PublishError` once exhausted.
    async fn publish(&self, envelope: Envelope, topic: &str) -> Result<(), ExecutorError>;

    /// Enter the receive loop: block on inbound messages, dispatch each to
    /// `handlers`, and invoke `on_wait` between inbound batches. Returns once
    /// `stop()` has been called and the loop reaches a safe exit point.
    async fn start(&self, handlers: HandlerTable, on_wait: OnWait);

    /// Signal the receive loop to exit at its next safe point.
    async fn stop(&self);

    /// Block until the receive loop is running and ready.
    async fn wait(&self);
}

/// The shared in-memory bus backing [`InProcessTransport`]: a registry of
/// named topics, each a broadcast channel so every subscriber on a topic
/// sees every message published to it.
pub struct InProcessBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
    force_publish_failure: AtomicBool,
}

impl InProcessBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            force_publish_failure: AtomicBool::new(false),
        })
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Envelope> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }

    /// Subscribe to `topic`, creating it if this is the first subscriber.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Envelope> {
        self.sender(topic).subscribe()
    }

    /// Test hook: make every subsequent publish attempt fail, to exercise
    /// the `PublishError` path (scenario S6).
    pub fn set_force_publish_failure(&self, fail: bool) {
        self.force_publish_failure.store(fail, Ordering::SeqCst);
    }

    /// Publish directly to the bus, bypassing retry policy and backpressure.
    /// Meant for test/demo peers (e.g. a scripted worker) that speak the bus
    /// protocol without going through the `Transport` trait themselves.
    pub fn publish(&self, topic: &str, envelope: Envelope) {
        let _ = self.sender(topic).send(envelope);
    }

    fn raw_publish(&self, topic: &str, envelope: Envelope) -> Result<(), String> {
        if self.force_publish_failure.load(Ordering::SeqCst) {
            return Err("bus refused message".to_string());
        }
        // A `SendError` here just means nobody is currently subscribed to
        // the topic, which is normal pub/sub and not a publish failure.
        let _ = self.sender(topic).send(envelope);
        Ok(())
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            force_publish_failure: AtomicBool::new(false),
        }
    }
}

/// One endpoint on an [`InProcessBus`]: an executor's (or a test worker's)
/// view of the bus, bound to its own reply topic.
pub struct InProcessTransport {
    bus: Arc<InProcessBus>,
    reply_to: String,
    retry: RetryOptions,
    tick_interval: Duration,
    running: Notify,
    running_flag: AtomicBool,
    stop_flag: AtomicBool,
    stop_notify: Notify,
}

impl InProcessTransport {
    pub fn new(bus: Arc<InProcessBus>, reply_to: impl Into<String>, retry: RetryOptions) -> Self {
        Self {
            bus,
            reply_to: reply_to.into(),
            retry,
            tick_interval: Duration::from_millis(20),
            running: Notify::new(),
            running_flag: AtomicBool::new(false),
            stop_flag: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn bus(&self) -> &Arc<InProcessBus> {
        &self.bus
    }

    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn publish(&self, envelope: Envelope, topic: &str) -> Result<(), ExecutorError> {
        let mut attempt = 0;
        loop {
            match self.bus.raw_publish(topic, envelope.clone()) {
                Ok(()) => return Ok(()),
                Err(reason) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(ExecutorError::PublishError(reason));
                    }
                    tokio::time::sleep(backoff_delay(&self.retry, attempt)).await;
                }
            }
        }
    }

    async fn start(&self, handlers: HandlerTable, on_wait: OnWait) {
        let mut receiver = self.bus.subscribe(&self.reply_to);
        self.stop_flag.store(false, Ordering::SeqCst);
        self.running_flag.store(true, Ordering::SeqCst);
        self.running.notify_waiters();

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = self.stop_notify.notified() => {
                    if self.stop_flag.load(Ordering::SeqCst) {
                        break;
                    }
                }
                received = receiver.recv() => {
                    match received {
                        Ok(envelope) => handlers.dispatch(envelope),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "transport receive loop lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = ticker.tick() => {}
            }
            on_wait().await;
        }

        self.running_flag.store(false, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    async fn wait(&self) {
        if self.running_flag.load(Ordering::SeqCst) {
            return;
        }
        self.running.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeBody, NotifyBody};
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn publish_retries_then_succeeds_once_bus_accepts() {
        let bus = InProcessBus::new();
        let transport = InProcessTransport::new(
            bus.clone(),
            "executor.reply",
            RetryOptions {
                max_attempts: 5,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        );
        bus.set_force_publish_failure(true);

        let envelope = Envelope::new(
            EnvelopeBody::Notify(NotifyBody {
                topic: "executor.reply".to_string(),
            }),
            None,
            None,
        );

        let result = transport.publish(envelope, "worker.add").await;
        assert!(matches!(result, Err(ExecutorError::PublishError(_))));
    }

    #[tokio::test]
    async fn start_marks_transport_running_before_blocking() {
        let bus = InProcessBus::new();
        let transport = Arc::new(InProcessTransport::new(
            bus,
            "executor.reply",
            RetryOptions::default(),
        ));
        let handlers = HandlerTable::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let on_wait: OnWait = Arc::new(move || {
            let calls = calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::Relaxed);
            })
        });

        let transport_clone = transport.clone();
        let handle = tokio::spawn(async move { transport_clone.start(handlers, on_wait).await });

        transport.wait().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        transport.stop().await;
        handle.await.unwrap();

        assert!(calls.load(Ordering::Relaxed) > 0);
    }
}
