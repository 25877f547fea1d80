//! The periodic routine fired between Transport receive cycles: reap expired
//! requests, promote WAITING requests that now have a worker (§4.6).

use std::sync::Arc;

use tracing::error;
use uuid::Uuid;
use wexec_core::FailureRecord;

use crate::envelope::{Envelope, EnvelopeBody, RequestBody};
use crate::registry::RequestRegistry;
use crate::request::{Request, RequestState};
use crate::transport::Transport;
use crate::worker_finder::WorkerFinder;
use wexec_core::ExecutorError;

/// Publish `request` (already transitioned to PENDING by the caller) to
/// `worker_topic`. On publish failure, fails the request in place.
///
/// Shared between [`MaintenanceTick::run`] and `execute_task`/`revert_task`,
/// which both reach the same "a worker is now known, ship it" moment from
/// different callers.
pub(crate) async fn publish_to_worker(
    transport: &dyn Transport,
    registry: &RequestRegistry,
    reply_to: &str,
    request: &Arc<Request>,
    worker_topic: &str,
) {
    let body = RequestBody {
        task_name: request.task_name.clone(),
        task_uuid: request.uuid,
        action: request.action,
        arguments: request.arguments.clone(),
        result: request.result.clone(),
        failures: request.failures.clone(),
    };
    let envelope = Envelope::new(
        EnvelopeBody::Request(body),
        Some(request.uuid),
        Some(reply_to.to_string()),
    );

    if let Err(err) = transport.publish(envelope, worker_topic).await {
        error!(request = %request.uuid, error = %err, "publish failed for a ready request");
        if request.transition(RequestState::Failure) {
            registry.remove(&request.uuid);
            request.set_result(Err(FailureRecord::from(err)));
        }
    }
}

pub struct MaintenanceTick {
    registry: Arc<RequestRegistry>,
    worker_finder: Arc<WorkerFinder>,
    transport: Arc<dyn Transport>,
    reply_to: String,
}

impl MaintenanceTick {
    pub fn new(
        registry: Arc<RequestRegistry>,
        worker_finder: Arc<WorkerFinder>,
        transport: Arc<dyn Transport>,
        reply_to: String,
    ) -> Self {
        Self {
            registry,
            worker_finder,
            transport,
            reply_to,
        }
    }

    /// Run one maintenance pass. Idempotent; safe to call with no pending
    /// work.
    pub async fn run(&self) {
        let snapshot = self.registry.snapshot_uuids();
        let mut expired: Vec<Uuid> = Vec::new();
        let mut ready: Vec<(Uuid, String)> = Vec::new();

        for uuid in snapshot {
            let Some(request) = self.registry.get(&uuid) else {
                continue;
            };
            if request.expired() {
                expired.push(uuid);
                continue;
            }
            if request.state() == RequestState::Waiting {
                if let Some(worker_topic) = self
                    .worker_finder
                    .get_worker_for_task(&request.task_name, &uuid)
                {
                    ready.push((uuid, worker_topic));
                }
            }
        }

        for uuid in expired {
            if let Some(request) = self.registry.get(&uuid) {
                self.reap_expired(&uuid, &request);
            }
        }

        for (uuid, worker_topic) in ready {
            if let Some(request) = self.registry.get(&uuid) {
                if request.transition(RequestState::Pending) {
                    publish_to_worker(
                        self.transport.as_ref(),
                        &self.registry,
                        &self.reply_to,
                        &request,
                        &worker_topic,
                    )
                    .await;
                }
            }
        }
    }

    fn reap_expired(&self, uuid: &Uuid, request: &Arc<Request>) {
        // The executor tracks only the current state, not its full history;
        // the `states` field names the single non-terminal state the
        // request was last observed in.
        let observed_state = request.state().to_string();
        let waited = request.created_at.elapsed();
        if request.transition(RequestState::Failure) {
            self.registry.remove(uuid);
            let error = ExecutorError::RequestTimeout {
                waited,
                states: vec![observed_state],
            };
            request.set_result(Err(FailureRecord::from(error)));
        }
    }
}
