use super::implementation::json::EnvelopeError;
use super::{CorrelationId, TopicError};
use crate::library::BoxedError;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Errors preventing a service instance from starting up
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// Broker nodes could not be queried
    #[error("unable to look up broker nodes")]
    LookupFailed(#[source] BoxedError),
    /// The lookup succeeded but did not yield any nodes
    #[error("no broker nodes available")]
    NoNodes,
    /// Connecting to the chosen node failed
    #[error("unable to connect to broker node {0}")]
    ConnectionFailed(String, #[source] BoxedError),
    /// The response topic of the instance could not be created
    #[error("unable to create response topic {0}")]
    ResponseTopicUnavailable(String, #[source] BoxedError),
    /// Subscribing to the response topic failed
    #[error("unable to subscribe to response topic {0}")]
    ResponseSubscriptionFailed(String, #[source] BoxedError),
}

/// Errors returned by the operations of a running [`Service`](super::Service)
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The actor of the instance is gone, usually because the instance terminated
    #[error("service actor is no longer running")]
    ActorStopped,
    /// Topic components are invalid
    #[error("invalid topic")]
    InvalidTopic(#[from] TopicError),
    /// Envelope could not be serialized
    #[error("unable to encode envelope")]
    Envelope(#[from] EnvelopeError),
    /// Broker rejected a publish
    #[error("failed to publish to topic {0}")]
    PublishFailed(String, #[source] BoxedError),
    /// Broker rejected a subscription
    #[error("failed to subscribe to topic {0}")]
    SubscribeFailed(String, #[source] BoxedError),
    /// Broker rejected the creation of a topic
    #[error("failed to create topic {0}")]
    TopicCreationFailed(String, #[source] BoxedError),
    /// Topic registry of the broker could not be listed
    #[error("unable to list topics")]
    TopicLookupFailed(#[source] BoxedError),
    /// Handler passed to [`Service::consume`](super::Service::consume) returned an error
    #[error("consumer handler for {0} failed")]
    HandlerFailed(String, #[source] BoxedError),
}

/// Errors reported when a response handler can not be registered
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// Another handler is still registered for the same correlation id
    #[error("correlation id {0} already has a registered response handler")]
    AlreadyRegistered(CorrelationId),
}

/// Cloneable snapshot of an error and its chain of causes
///
/// Errors of handler tasks or broker subscriptions are usually not [`Clone`], but they are
/// reported to any number of [event](super::ServiceEvent) subscribers. This type captures the
/// rendered message of every error in the source chain so that it can be passed around freely.
///
/// When the source chain already contains an [`ErrorReport`], its causes are spliced in so that
/// the chain is rendered only once at the top-most level.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    causes: Vec<String>,
}

impl ErrorReport {
    /// Captures the chain of any error type
    pub fn new<E: Error + 'static>(e: E) -> Self {
        (&e as &(dyn Error + 'static)).into()
    }

    /// Captures the chain of a boxed error
    pub fn from_boxed(e: &BoxedError) -> Self {
        (e.as_ref() as &(dyn Error + 'static)).into()
    }

    /// Creates a report from a plain message without any causes
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            causes: vec![message.into()],
        }
    }

    /// Rendered messages, outermost error first
    pub fn causes(&self) -> &[String] {
        &self.causes
    }
}

impl Error for ErrorReport {}

impl Display for ErrorReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut causes = self.causes.iter();

        match causes.next() {
            Some(first) => write!(f, "{}", first)?,
            None => return write!(f, "unknown error"),
        }

        for cause in causes {
            write!(f, ": {}", cause)?;
        }

        Ok(())
    }
}

impl From<&(dyn Error + 'static)> for ErrorReport {
    fn from(e: &(dyn Error + 'static)) -> Self {
        let mut source: Option<&(dyn Error + 'static)> = Some(e);
        let mut causes: Vec<String> = Vec::new();

        while let Some(error) = source {
            match error.downcast_ref::<ErrorReport>() {
                Some(report) => causes.extend(report.causes.iter().cloned()),
                None => causes.push(error.to_string()),
            }

            source = error.source();
        }

        Self { causes }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Error, Debug)]
    enum HandlerError {
        #[error("handler gave up")]
        GaveUp(#[from] ErrorReport),
        #[error("topic trouble")]
        Topic(#[from] TopicError),
    }

    #[test]
    fn render_empty_report() {
        let report = ErrorReport { causes: Vec::new() };
        assert_eq!(report.to_string(), "unknown error");
    }

    #[test]
    fn capture_source_chain() {
        let error = HandlerError::from(TopicError::Empty("service id"));
        let report = ErrorReport::new(error);

        assert_eq!(
            report.causes(),
            &["topic trouble".to_string(), "service id may not be empty".to_string()]
        );
        assert_eq!(
            report.to_string(),
            "topic trouble: service id may not be empty"
        );
    }

    #[test]
    fn splice_nested_reports() {
        let inner = ErrorReport {
            causes: vec!["cause1".into(), "cause2".into()],
        };
        let outer = ErrorReport::new(HandlerError::from(inner));

        assert_eq!(outer.causes(), &["handler gave up", "cause1", "cause2"]);
    }

    #[test]
    fn capture_boxed_errors() {
        let boxed: BoxedError = Box::new(TopicError::Empty("content type"));
        assert_eq!(
            ErrorReport::from_boxed(&boxed).causes(),
            &["content type may not be empty"]
        );
    }
}
