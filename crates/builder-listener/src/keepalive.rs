// Answers liveness probes from the fleet monitor. Runs inline in the message
// loop, so a reply proves the loop itself is alive.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::broker::{send_within, MessageSink, SendError, SEND_TIMEOUT};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveResponse {
    pub host: String,
    pub script: String,
    pub timestamp: String,
}

pub struct KeepaliveResponder {
    sink: Arc<dyn MessageSink>,
    topic: String,
    host: String,
    script: String,
}

impl KeepaliveResponder {
    pub fn new(
        sink: Arc<dyn MessageSink>,
        topic: impl Into<String>,
        host: impl Into<String>,
        script: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            topic: topic.into(),
            host: host.into(),
            script: script.into(),
        }
    }

    fn response_now(&self) -> KeepaliveResponse {
        KeepaliveResponse {
            host: self.host.clone(),
            script: self.script.clone(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// Send one response to the keepalive-response topic.
    pub async fn respond(&self) -> Result<(), SendError> {
        let body = serde_json::to_string(&self.response_now())?;
        send_within(SEND_TIMEOUT, self.sink.send(&self.topic, &body, &[])).await
    }
}
