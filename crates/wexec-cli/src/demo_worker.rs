//! A tiny scripted worker that advertises the `add` task and answers it,
//! used when no real worker process is attached to the bus. Exists only to
//! make `wexec` runnable out of the box; a production deployment always
//! points at real worker processes on a real bus.

use std::sync::Arc;

use wexec_core::FailureRecord;
use wexec_engine::{Envelope, EnvelopeBody, InProcessBus, NotifyResponseBody, ResponseBody};

const WORKER_TOPIC: &str = "demo.worker";

pub fn spawn(bus: Arc<InProcessBus>, discovery_topic: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(bus, discovery_topic))
}

async fn run(bus: Arc<InProcessBus>, discovery_topic: String) {
    let mut discovery_rx = bus.subscribe(&discovery_topic);
    let mut request_rx = bus.subscribe(WORKER_TOPIC);

    loop {
        tokio::select! {
            received = discovery_rx.recv() => {
                match received {
                    Ok(envelope) => handle_notify(&bus, envelope),
                    Err(_) => break,
                }
            }
            received = request_rx.recv() => {
                match received {
                    Ok(envelope) => handle_request(&bus, envelope),
                    Err(_) => break,
                }
            }
        }
    }
}

fn handle_notify(bus: &InProcessBus, envelope: Envelope) {
    let EnvelopeBody::Notify(body) = envelope.body else {
        return;
    };
    let response = Envelope::new(
        EnvelopeBody::NotifyResponse(NotifyResponseBody {
            topic: WORKER_TOPIC.to_string(),
            tasks: vec!["add".to_string()],
        }),
        None,
        None,
    );
    bus.publish(&body.topic, response);
}

fn handle_request(bus: &InProcessBus, envelope: Envelope) {
    let EnvelopeBody::Request(body) = envelope.body else {
        return;
    };
    let Some(reply_to) = envelope.reply_to.clone() else {
        return;
    };
    let correlation_id = envelope.correlation_id;

    bus.publish(
        &reply_to,
        Envelope::new(EnvelopeBody::Response(ResponseBody::Running), correlation_id, None),
    );

    if body.task_name != "add" {
        let failure = FailureRecord::new(format!("demo worker cannot run task {:?}", body.task_name));
        bus.publish(
            &reply_to,
            Envelope::new(
                EnvelopeBody::Response(ResponseBody::Failure { failure }),
                correlation_id,
                None,
            ),
        );
        return;
    }

    let a = body.arguments.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
    let b = body.arguments.get("b").and_then(|v| v.as_i64()).unwrap_or(0);
    let result = serde_json::json!(a + b);
    bus.publish(
        &reply_to,
        Envelope::new(EnvelopeBody::Response(ResponseBody::Success { result }), correlation_id, None),
    );
}
