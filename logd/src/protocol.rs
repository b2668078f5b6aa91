//! Wire protocol of the daemon: newline-delimited JSON frames on a single
//! broker endpoint. Workers announce themselves with a `ready` frame and
//! then answer one `request` frame at a time; clients send `request` frames
//! and read back the matching `reply`.

use binder_common::log::LogRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Service tag of the log-writing module.
pub const LOG_WRITER: &str = "log_writer";
/// Service tag of the log-reading module.
pub const LOG_READER: &str = "log_reader";
/// Service tag of the orchestrator API proxy supervisor.
pub const KUBE_PROXY: &str = "kube_proxy";

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// Worker registration under a service tag.
    Ready { service: String },
    /// A request for the given service. The broker stamps `id` before the
    /// frame reaches a worker; client-sent requests carry none.
    Request {
        service: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        body: Value,
    },
    /// A reply travelling back. Workers echo the request `id`; the broker
    /// strips it before the reply reaches the client.
    Reply {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        body: Value,
    },
}

/// The one reply shape every module produces.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ModuleResponse {
    Success { msg: String },
    Error { msg: String },
}

impl ModuleResponse {
    pub fn success(msg: impl Into<String>) -> Self {
        Self::Success { msg: msg.into() }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error { msg: msg.into() }
    }
}

/// Body of a `log` request as sent to the writer module.
pub fn log_request(record: &LogRecord) -> Value {
    let mut body = serde_json::to_value(record).expect("a log record always serializes");
    body.as_object_mut()
        .expect("a log record serializes to an object")
        .insert("type".to_string(), Value::String("log".to_string()));
    body
}

/// Body of a `get` request as sent to the reader module.
pub fn get_request(app: &str, since: Option<chrono::DateTime<chrono::Utc>>, filtered: bool) -> Value {
    let mut body = serde_json::json!({ "type": "get", "app": app });
    if let Some(since) = since {
        body["since"] = Value::String(since.to_rfc3339());
    }
    if filtered {
        body["filtered"] = Value::Bool(true);
    }
    body
}

/// A line on the publish/subscribe feed.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub line: String,
}

#[cfg(test)]
mod tests {
    use binder_common::log::Level;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn frames_round_trip() {
        let frame = Frame::Request {
            service: LOG_WRITER.to_string(),
            id: Some(7),
            body: serde_json::json!({"type": "log"}),
        };
        let line = serde_json::to_string(&frame).unwrap();

        assert_eq!(serde_json::from_str::<Frame>(&line).unwrap(), frame);
    }

    #[test]
    fn client_requests_have_no_id() {
        let frame = Frame::Request {
            service: LOG_READER.to_string(),
            id: None,
            body: serde_json::json!({"type": "get", "app": "acme-demo"}),
        };

        assert!(!serde_json::to_string(&frame).unwrap().contains("\"id\""));
    }

    #[test]
    fn log_request_carries_record_fields() {
        let record = LogRecord::new(Level::Error, "builder", "boom").for_app("acme-demo");
        let body = log_request(&record);

        assert_eq!(body["type"], "log");
        assert_eq!(body["level"], 40);
        assert_eq!(body["app"], "acme-demo");
    }

    #[test]
    fn response_wire_shape() {
        assert_eq!(
            serde_json::to_value(ModuleResponse::error("malformed log message")).unwrap(),
            serde_json::json!({"type": "error", "msg": "malformed log message"})
        );
    }
}
