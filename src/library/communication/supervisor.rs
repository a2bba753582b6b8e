//! Structures to keep track of the health of a service instance

use super::{CorrelationId, ErrorReport, RegistrationError};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const EVENT_CAPACITY: usize = 64;

/// Unrecoverable condition which terminates a service instance
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Data received on a topic could not be understood
    #[error("protocol violation on topic {topic}: {error}")]
    Protocol {
        /// Topic on which the offending data has been received
        topic: String,
        /// Decoding error
        error: ErrorReport,
    },
    /// A subscription the instance relies on has been closed by the broker
    #[error("subscription to topic {0} has been closed")]
    SubscriptionClosed(String),
}

/// Notable occurrences within a running service instance
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    /// A response handler returned an error or panicked, only its registration has been removed
    HandlerFailed {
        /// Request the handler has been registered for
        correlation_id: CorrelationId,
        /// What went wrong
        error: ErrorReport,
    },
    /// A response handler has not been started because its correlation id is already in use
    HandlerRejected(RegistrationError),
    /// A topic discovered while watching could not be subscribed to
    SubscriptionFailed {
        /// Name of the discovered topic
        topic: String,
        /// Broker error
        error: ErrorReport,
    },
    /// The instance terminated
    Fault(Fault),
}

/// Shared lifecycle state of one service instance
///
/// Every task of the instance runs until the token returned by [`token`](Supervisor::token)
/// is cancelled. Reporting a [`Fault`] cancels it.
#[derive(Clone)]
pub(crate) struct Supervisor {
    token: CancellationToken,
    events: broadcast::Sender<ServiceEvent>,
    fault: Arc<Mutex<Option<Fault>>>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            token: CancellationToken::new(),
            events,
            fault: Arc::new(Mutex::new(None)),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    pub fn report(&self, event: ServiceEvent) {
        // Nobody listening is fine
        self.events.send(event).ok();
    }

    /// Records the fault (only the first one sticks) and cancels every task of the instance
    pub fn fault(&self, fault: Fault) {
        error!(%fault, "Service instance faulted");

        if let Ok(mut slot) = self.fault.lock() {
            if slot.is_none() {
                *slot = Some(fault.clone());
            }
        }

        self.report(ServiceEvent::Fault(fault));
        self.token.cancel();
    }

    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            debug!("Shutting down service instance");
        }

        self.token.cancel();
    }

    pub async fn terminated(&self) -> Option<Fault> {
        self.token.cancelled().await;
        self.current_fault()
    }

    pub fn current_fault(&self) -> Option<Fault> {
        self.fault.lock().ok().and_then(|slot| slot.clone())
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    fn protocol_fault(topic: &str) -> Fault {
        Fault::Protocol {
            topic: topic.into(),
            error: ErrorReport::from_message("garbage"),
        }
    }

    #[tokio::test]
    async fn terminate_cleanly_on_shutdown() {
        let supervisor = Supervisor::new();
        supervisor.shutdown();

        assert_eq!(supervisor.terminated().await, None);
    }

    #[tokio::test]
    async fn keep_the_first_fault() {
        let supervisor = Supervisor::new();
        let mut events = supervisor.subscribe();

        supervisor.fault(protocol_fault("a-1-responses"));
        supervisor.fault(Fault::SubscriptionClosed("b-2-responses".into()));

        assert!(supervisor.token().is_cancelled());
        assert_eq!(
            supervisor.terminated().await,
            Some(protocol_fault("a-1-responses"))
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ServiceEvent::Fault(protocol_fault("a-1-responses"))
        );
    }

    #[test]
    fn describe_faults() {
        assert_eq!(
            protocol_fault("a-1-responses").to_string(),
            "protocol violation on topic a-1-responses: garbage"
        );
    }
}
