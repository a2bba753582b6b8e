use super::implementation::json::JsonEnvelope;
use super::{ServiceIdentity, Topic, TopicError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::Utf8Error;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier linking responses back to the request they answer
///
/// Assigned when a message is created and only unique within the instance that created it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Raw string representation as it appears on the wire
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing source of [`CorrelationIds`](CorrelationId) for one instance
#[derive(Debug, Default)]
pub struct CorrelationCounter(AtomicU64);

impl CorrelationCounter {
    /// Hands out the next identifier, starting at `1`
    pub fn next(&self) -> CorrelationId {
        let value = self.0.fetch_add(1, Ordering::Relaxed) + 1;
        CorrelationId(value.to_string())
    }
}

/// Envelope exchanged between services
///
/// Generally, [`Service::new_message`](super::Service::new_message) should be used to build
/// outbound messages and [`Service::new_response`](super::Service::new_response) to build
/// responses.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    /// Name of the originating service
    pub from_name: String,
    /// Actual message content
    pub payload: Vec<u8>,
    /// Point in time at which the message was created
    pub time: DateTime<Utc>,
    /// Kind of content carried in the payload
    pub content_type: String,
    /// Request/response thread this message belongs to
    pub correlation_id: CorrelationId,
    /// Topic on which the message is published
    pub topic: Topic,
    /// Topic on which responses to this message are expected
    pub response_topic: Topic,
}

impl JsonEnvelope for Message {}

impl Message {
    /// Creates a new message published by the given service on its own topic for the content type
    pub fn new(
        sender: &ServiceIdentity,
        content_type: &str,
        payload: impl Into<Vec<u8>>,
        correlation_id: CorrelationId,
    ) -> Result<Self, TopicError> {
        Ok(Self {
            from_name: sender.name().to_owned(),
            payload: payload.into(),
            time: Utc::now(),
            content_type: content_type.to_owned(),
            correlation_id,
            topic: sender.topic(content_type)?,
            response_topic: sender.response_topic(),
        })
    }

    /// Builds a response to this message on behalf of the responding service
    ///
    /// The response is addressed to the response topic of this message and carries its
    /// correlation id verbatim. Multiple responses to the same message can not be told apart
    /// except by their arrival order.
    pub fn respond(
        &self,
        responder: &ServiceIdentity,
        content_type: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            from_name: responder.name().to_owned(),
            payload: payload.into(),
            time: Utc::now(),
            content_type: content_type.to_owned(),
            correlation_id: self.correlation_id.clone(),
            topic: self.response_topic.clone(),
            response_topic: responder.response_topic(),
        }
    }

    /// Interprets the payload as UTF-8 text
    pub fn payload_str(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.payload)
    }
}

/// Notice that a service started producing a content type
///
/// Published on the reserved [`ANNOUNCEMENT_TOPIC`](super::ANNOUNCEMENT_TOPIC) so that
/// consumers which are already running can subscribe to the announced topic.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Announcement {
    /// Name of the announcing service
    pub from_name: String,
    /// Point in time at which the announcement was created
    pub time: DateTime<Utc>,
    /// Content type that is now being produced
    pub content_type: String,
    /// Topic on which the content is published
    pub topic: Topic,
}

impl JsonEnvelope for Announcement {}

impl Announcement {
    /// Announces the topic of the given service for a content type
    pub fn new(sender: &ServiceIdentity, content_type: &str) -> Result<Self, TopicError> {
        Ok(Self {
            from_name: sender.name().to_owned(),
            time: Utc::now(),
            content_type: content_type.to_owned(),
            topic: sender.topic(content_type)?,
        })
    }
}
