//! A single dispatch attempt of one task to one worker (§3, §4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;
use wexec_core::FailureRecord;

use crate::envelope::Action;

/// Legal, terminal-excluded states of a [`Request`] (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// No worker known yet.
    Waiting,
    /// Published to a worker topic, awaiting acknowledgement.
    Pending,
    /// Worker acknowledged the request has started.
    Running,
    /// Terminal: the worker reported success.
    Success,
    /// Terminal: the worker reported failure, the request expired, or
    /// publishing failed.
    Failure,
}

impl RequestState {
    /// True for the two states from which no further transition is legal.
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Success | RequestState::Failure)
    }

    fn as_str(self) -> &'static str {
        match self {
            RequestState::Waiting => "WAITING",
            RequestState::Pending => "PENDING",
            RequestState::Running => "RUNNING",
            RequestState::Success => "SUCCESS",
            RequestState::Failure => "FAILURE",
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_legal_edge(from: RequestState, to: RequestState) -> bool {
    use RequestState::*;
    matches!(
        (from, to),
        (Waiting, Pending)
            | (Waiting, Failure)
            | (Pending, Running)
            | (Pending, Failure)
            | (Running, Running)
            | (Running, Success)
            | (Running, Failure)
    )
}

/// The terminal value delivered through a request's promise.
pub type Outcome = Result<serde_json::Value, FailureRecord>;

/// A handle returned by [`Notifier::register`], used to deregister later.
#[derive(Debug, Clone)]
pub struct Registration {
    event: String,
    id: u64,
}

/// A subscriber callback for intermediate request events (notably PROGRESS).
///
/// Invoked synchronously from the transport's receive loop: callbacks must
/// not block.
pub type ProgressCallback = Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

/// Multicast hook for intermediate events on one request.
#[derive(Default)]
pub struct Notifier {
    subscribers: Mutex<HashMap<String, Vec<(u64, ProgressCallback)>>>,
    next_id: AtomicU64,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to `event`. Returns a token for `deregister`.
    pub fn register(&self, event: &str, callback: ProgressCallback) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap()
            .entry(event.to_string())
            .or_default()
            .push((id, callback));
        Registration {
            event: event.to_string(),
            id,
        }
    }

    /// Remove a previously registered subscription. A no-op if already
    /// removed.
    pub fn deregister(&self, registration: &Registration) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(list) = subscribers.get_mut(&registration.event) {
            list.retain(|(id, _)| *id != registration.id);
        }
    }

    /// Invoke every subscriber of `event` with `details`, without holding the
    /// subscriber lock while callbacks run.
    pub fn notify(&self, event: &str, details: &serde_json::Value) {
        let callbacks: Vec<ProgressCallback> = {
            let subscribers = self.subscribers.lock().unwrap();
            match subscribers.get(event) {
                Some(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
                None => return,
            }
        };
        for callback in callbacks {
            callback(event, details);
        }
    }
}

/// One dispatch attempt of one task to one worker.
pub struct Request {
    pub uuid: Uuid,
    pub task_name: String,
    pub action: Action,
    pub arguments: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub failures: Option<serde_json::Value>,
    /// `tokio::time::Instant` rather than `std::time::Instant` so that
    /// `#[tokio::test(start_paused = true)]` can exercise the timeout path
    /// without real sleeps.
    pub created_at: Instant,
    pub timeout: Duration,
    pub notifier: Notifier,

    state: Mutex<RequestState>,
    promise: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl Request {
    /// Construct a new request in `WAITING`, returning it alongside the
    /// receiving half of its promise.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uuid: Uuid,
        task_name: impl Into<String>,
        action: Action,
        arguments: serde_json::Value,
        timeout: Duration,
        result: Option<serde_json::Value>,
        failures: Option<serde_json::Value>,
    ) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            uuid,
            task_name: task_name.into(),
            action,
            arguments,
            result,
            failures,
            created_at: Instant::now(),
            timeout,
            notifier: Notifier::new(),
            state: Mutex::new(RequestState::Waiting),
            promise: Mutex::new(Some(tx)),
        };
        (request, rx)
    }

    /// Current state, snapshotted under the per-request lock.
    pub fn state(&self) -> RequestState {
        *self.state.lock().unwrap()
    }

    /// Attempt the `WAITING/PENDING/RUNNING/SUCCESS/FAILURE` edge to
    /// `target`. Returns `true` iff it was legal and applied.
    pub fn transition(&self, target: RequestState) -> bool {
        let mut state = self.state.lock().unwrap();
        if !is_legal_edge(*state, target) {
            debug!(
                request = %self.uuid,
                from = %*state,
                to = %target,
                "rejected illegal request state transition"
            );
            return false;
        }
        *state = target;
        true
    }

    /// True iff the deadline has passed and the request has not reached a
    /// terminal state.
    pub fn expired(&self) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        self.created_at.elapsed() >= self.timeout
    }

    /// Fulfill the promise exactly once. Returns `false` (logged) if the
    /// promise was already fulfilled.
    pub fn set_result(&self, outcome: Outcome) -> bool {
        let sender = self.promise.lock().unwrap().take();
        match sender {
            Some(sender) => {
                // The receiver may have been dropped by a caller who stopped
                // polling; that is not this request's concern.
                let _ = sender.send(outcome);
                true
            }
            None => {
                debug!(request = %self.uuid, "ignored duplicate set_result");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn new_request(timeout: Duration) -> (Request, oneshot::Receiver<Outcome>) {
        Request::new(
            Uuid::new_v4(),
            "add",
            Action::Execute,
            serde_json::json!({"a": 1, "b": 2}),
            timeout,
            None,
            None,
        )
    }

    #[test]
    fn legal_edges_follow_the_happy_path() {
        let (request, _rx) = new_request(Duration::from_secs(60));
        assert!(request.transition(RequestState::Pending));
        assert!(request.transition(RequestState::Running));
        assert!(request.transition(RequestState::Success));
        assert_eq!(request.state(), RequestState::Success);
    }

    #[test]
    fn illegal_edges_are_rejected_without_mutation() {
        let (request, _rx) = new_request(Duration::from_secs(60));
        // Cannot jump straight to RUNNING from WAITING.
        assert!(!request.transition(RequestState::Running));
        assert_eq!(request.state(), RequestState::Waiting);
    }

    #[test]
    fn duplicate_terminal_transition_is_rejected() {
        let (request, _rx) = new_request(Duration::from_secs(60));
        assert!(request.transition(RequestState::Pending));
        assert!(request.transition(RequestState::Running));
        assert!(request.transition(RequestState::Success));
        assert!(!request.transition(RequestState::Success));
        assert!(!request.transition(RequestState::Failure));
    }

    #[test]
    fn running_to_running_is_an_idempotent_no_op() {
        let (request, _rx) = new_request(Duration::from_secs(60));
        assert!(request.transition(RequestState::Pending));
        assert!(request.transition(RequestState::Running));
        assert!(request.transition(RequestState::Running));
        assert_eq!(request.state(), RequestState::Running);
    }

    #[test]
    fn expiry_ignores_terminal_requests() {
        let (request, _rx) = new_request(Duration::from_millis(0));
        assert!(request.transition(RequestState::Pending));
        assert!(request.transition(RequestState::Running));
        assert!(request.transition(RequestState::Success));
        assert!(!request.expired());
    }

    #[test]
    fn set_result_fulfills_exactly_once() {
        let (request, rx) = new_request(Duration::from_secs(60));
        assert!(request.transition(RequestState::Pending));
        assert!(request.transition(RequestState::Running));
        assert!(request.transition(RequestState::Success));
        assert!(request.set_result(Ok(serde_json::json!(3))));
        assert!(!request.set_result(Ok(serde_json::json!(4))));
        assert_eq!(rx.blocking_recv().unwrap().unwrap(), serde_json::json!(3));
    }

    #[test]
    fn notifier_forwards_events_to_registered_callbacks() {
        let notifier = Notifier::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let registration = notifier.register(
            "PROGRESS",
            Arc::new(move |_event, _details| {
                calls_clone.fetch_add(1, Ordering::Relaxed);
            }),
        );
        notifier.notify("PROGRESS", &serde_json::json!({"pct": 50}));
        notifier.deregister(&registration);
        notifier.notify("PROGRESS", &serde_json::json!({"pct": 100}));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
