//! Turns validated inbound RESPONSE envelopes into state transitions and,
//! for terminals, promise fulfillments (§4.5).

use std::sync::Arc;

use tracing::{debug, warn};

use crate::envelope::{Envelope, EnvelopeBody, ResponseBody};
use crate::registry::RequestRegistry;
use crate::request::RequestState;

/// Routes RESPONSE envelopes to their addressed request.
///
/// A fifth branch of the wire protocol ("any other state value") is handled
/// one layer down: `ResponseBody`'s internally-tagged `#[derive(Deserialize)]`
/// already rejects an unrecognized `state` at decode time, which is where a
/// network-backed transport would turn it into an `InvalidResponse` and drop
/// it before this dispatcher ever sees it.
pub struct ResponseDispatcher {
    registry: Arc<RequestRegistry>,
}

impl ResponseDispatcher {
    pub fn new(registry: Arc<RequestRegistry>) -> Self {
        Self { registry }
    }

    /// Handle one inbound envelope already known to carry a RESPONSE body.
    pub fn handle(&self, envelope: Envelope) {
        let Some(correlation_id) = envelope.correlation_id else {
            warn!("dropped response envelope with no correlation id");
            return;
        };

        let response = match envelope.body {
            EnvelopeBody::Response(body) => body,
            other => {
                warn!(kind = other.kind(), "dispatcher received a non-response envelope");
                return;
            }
        };

        let Some(request) = self.registry.get(&correlation_id) else {
            debug!(correlation = %correlation_id, "dropped response for unknown or stale correlation id");
            return;
        };

        match response {
            ResponseBody::Running => {
                request.transition(RequestState::Running);
            }
            ResponseBody::Event { event_type, details } => {
                request.notifier.notify(&event_type, &details);
            }
            ResponseBody::Success { result } => {
                if request.transition(RequestState::Success) {
                    self.registry.remove(&correlation_id);
                    request.set_result(Ok(result));
                }
            }
            ResponseBody::Failure { failure } => {
                if request.transition(RequestState::Failure) {
                    self.registry.remove(&correlation_id);
                    request.set_result(Err(failure));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Action;
    use crate::request::Request;
    use std::time::Duration;
    use uuid::Uuid;
    use wexec_core::FailureRecord;

    fn registered_request(registry: &RequestRegistry) -> (Uuid, tokio::sync::oneshot::Receiver<crate::request::Outcome>) {
        let uuid = Uuid::new_v4();
        let (request, rx) = Request::new(
            uuid,
            "add",
            Action::Execute,
            serde_json::json!({}),
            Duration::from_secs(60),
            None,
            None,
        );
        request.transition(RequestState::Pending);
        let request = Arc::new(request);
        registry.insert(request);
        (uuid, rx)
    }

    fn response_envelope(correlation_id: Uuid, body: ResponseBody) -> Envelope {
        Envelope::new(EnvelopeBody::Response(body), Some(correlation_id), None)
    }

    #[tokio::test]
    async fn success_removes_request_and_fulfills_promise() {
        let registry = Arc::new(RequestRegistry::new());
        let (uuid, rx) = registered_request(&registry);
        let dispatcher = ResponseDispatcher::new(registry.clone());

        dispatcher.handle(response_envelope(uuid, ResponseBody::Running));
        dispatcher.handle(response_envelope(
            uuid,
            ResponseBody::Success {
                result: serde_json::json!(3),
            },
        ));

        assert!(registry.get(&uuid).is_none());
        assert_eq!(rx.await.unwrap().unwrap(), serde_json::json!(3));
    }

    #[tokio::test]
    async fn duplicate_success_is_a_no_op() {
        let registry = Arc::new(RequestRegistry::new());
        let (uuid, rx) = registered_request(&registry);
        let dispatcher = ResponseDispatcher::new(registry.clone());

        dispatcher.handle(response_envelope(
            uuid,
            ResponseBody::Success {
                result: serde_json::json!(1),
            },
        ));
        // The request is already gone; a second SUCCESS addresses nothing.
        dispatcher.handle(response_envelope(
            uuid,
            ResponseBody::Success {
                result: serde_json::json!(2),
            },
        ));

        assert_eq!(rx.await.unwrap().unwrap(), serde_json::json!(1));
    }

    #[tokio::test]
    async fn unknown_correlation_id_changes_nothing() {
        let registry = Arc::new(RequestRegistry::new());
        let (uuid, _rx) = registered_request(&registry);
        let dispatcher = ResponseDispatcher::new(registry.clone());

        dispatcher.handle(response_envelope(
            Uuid::new_v4(),
            ResponseBody::Failure {
                failure: FailureRecord::new("ghost"),
            },
        ));

        let request = registry.get(&uuid).unwrap();
        assert_eq!(request.state(), RequestState::Pending);
    }

    #[tokio::test]
    async fn missing_correlation_id_is_dropped() {
        let registry = Arc::new(RequestRegistry::new());
        let dispatcher = ResponseDispatcher::new(registry.clone());
        let envelope = Envelope::new(EnvelopeBody::Response(ResponseBody::Running), None, None);
        dispatcher.handle(envelope);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn event_forwards_to_notifier_without_changing_state() {
        let registry = Arc::new(RequestRegistry::new());
        let (uuid, _rx) = registered_request(&registry);
        let dispatcher = ResponseDispatcher::new(registry.clone());

        let request = registry.get(&uuid).unwrap();
        let seen = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen_clone = seen.clone();
        request.notifier.register(
            "progress",
            Arc::new(move |_event, _details| {
                seen_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            }),
        );

        dispatcher.handle(response_envelope(
            uuid,
            ResponseBody::Event {
                event_type: "progress".to_string(),
                details: serde_json::json!({"pct": 50}),
            },
        ));

        assert!(seen.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(request.state(), RequestState::Pending);
    }
}
