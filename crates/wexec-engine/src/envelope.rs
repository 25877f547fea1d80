//! Wire protocol for the bus: envelopes exchanged between this executor and
//! remote workers (§6 of the design).

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wexec_core::FailureRecord;

/// Which remote action a `REQUEST` envelope asks a worker to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Run the task's forward logic.
    Execute,
    /// Run the task's compensating logic.
    Revert,
}

/// Body of a `REQUEST` envelope: a worker should start (or revert) a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBody {
    pub task_name: String,
    pub task_uuid: Uuid,
    pub action: Action,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failures: Option<serde_json::Value>,
}

/// Body of a `RESPONSE` envelope: a worker reporting progress or an outcome.
///
/// Internally tagged on `state`/`data` so the wire shape matches §6 exactly:
/// `{"state": "SUCCESS", "data": {"result": ...}}` and so on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", content = "data")]
pub enum ResponseBody {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "EVENT")]
    Event {
        event_type: String,
        #[serde(default)]
        details: serde_json::Value,
    },
    #[serde(rename = "SUCCESS")]
    Success { result: serde_json::Value },
    #[serde(rename = "FAILURE")]
    Failure { failure: FailureRecord },
}

/// Body of a `NOTIFY` envelope: "who is listening, and what do you serve?"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyBody {
    pub topic: String,
}

/// Body of a `NOTIFY_RESPONSE` envelope: a worker's answer to a probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyResponseBody {
    pub topic: String,
    pub tasks: Vec<String>,
}

/// The four message shapes the bus carries, tagged by `message_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type")]
pub enum EnvelopeBody {
    #[serde(rename = "REQUEST")]
    Request(RequestBody),
    #[serde(rename = "RESPONSE")]
    Response(ResponseBody),
    #[serde(rename = "NOTIFY")]
    Notify(NotifyBody),
    #[serde(rename = "NOTIFY_RESPONSE")]
    NotifyResponse(NotifyResponseBody),
}

impl EnvelopeBody {
    /// The message type tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            EnvelopeBody::Request(_) => "REQUEST",
            EnvelopeBody::Response(_) => "RESPONSE",
            EnvelopeBody::Notify(_) => "NOTIFY",
            EnvelopeBody::NotifyResponse(_) => "NOTIFY_RESPONSE",
        }
    }
}

/// A full bus envelope: routing metadata plus a typed body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Links a `RESPONSE` back to the `REQUEST` that caused it. Absent on
    /// `NOTIFY`/`NOTIFY_RESPONSE`, which are not correlated to one request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Topic the sender wants replies delivered to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Milliseconds since the Unix epoch, stamped by the sender.
    pub timestamp_ms: i64,
    pub body: EnvelopeBody,
}

impl Envelope {
    pub fn new(body: EnvelopeBody, correlation_id: Option<Uuid>, reply_to: Option<String>) -> Self {
        Self {
            correlation_id,
            reply_to,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_body_round_trips_through_json() {
        let body = ResponseBody::Success {
            result: serde_json::json!(3),
        };
        let raw = serde_json::to_string(&body).unwrap();
        assert_eq!(raw, r#"{"state":"SUCCESS","data":{"result":3}}"#);
        let back: ResponseBody = serde_json::from_str(&raw).unwrap();
        matches!(back, ResponseBody::Success { result } if result == serde_json::json!(3));
    }

    #[test]
    fn envelope_body_kind_matches_wire_tag() {
        let body = EnvelopeBody::Notify(NotifyBody {
            topic: "executor.reply".to_string(),
        });
        assert_eq!(body.kind(), "NOTIFY");
    }
}
