use builder_common::constants::{broker, ACCEPTED_EVENT_BODY};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::broker::{send_within, MessageSink, SendError, SEND_TIMEOUT};
use crate::job::JobRequest;

/// Status message published on the events topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderEvent {
    pub builder_id: String,
    pub body: String,
    pub first_message: bool,
    pub job_id: String,
    pub client_id: String,
    pub bioc_version: String,
}

impl BuilderEvent {
    /// The event sent once the build program has been started.
    pub fn accepted(builder_id: &str, request: &JobRequest) -> Self {
        Self {
            builder_id: builder_id.to_string(),
            body: ACCEPTED_EVENT_BODY.to_string(),
            first_message: true,
            job_id: request.job_id.clone(),
            client_id: request.client_id.clone(),
            bioc_version: request.bioc_version.clone(),
        }
    }
}

/// Serializes events and sends them for durable delivery.
///
/// Safe to share between build runners; the sink serializes access to the
/// transport.
#[derive(Clone)]
pub struct EventPublisher {
    sink: Arc<dyn MessageSink>,
    topic: String,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn MessageSink>, topic: impl Into<String>) -> Self {
        Self {
            sink,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn publish(&self, event: &BuilderEvent) -> Result<(), SendError> {
        let body = serde_json::to_string(event)?;
        send_within(
            SEND_TIMEOUT,
            self.sink
                .send(&self.topic, &body, &[(broker::PERSISTENT_HEADER, "true")]),
        )
        .await
    }
}
