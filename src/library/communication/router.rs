use super::broker::{RawSubscription, SharedBroker};
use super::implementation::json::Envelope;
use super::supervisor::{Fault, Supervisor};
use super::{BootstrapError, ErrorReport, Message, ServiceIdentity};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace};

/// Feeds responses addressed to an instance into its actor
pub(crate) struct ResponseRouter {
    topic: String,
    subscription: RawSubscription,
    dispatcher: mpsc::Sender<Message>,
    supervisor: Supervisor,
}

impl ResponseRouter {
    /// Creates and subscribes to the response topic, then spawns the routing task
    #[instrument(skip(identity, broker, dispatcher, supervisor), fields(%identity))]
    pub async fn start(
        identity: &ServiceIdentity,
        broker: &SharedBroker,
        dispatcher: mpsc::Sender<Message>,
        supervisor: &Supervisor,
    ) -> Result<(), BootstrapError> {
        let topic = identity.response_topic().name();
        let channel = identity.response_channel();

        broker
            .create_topic(&topic)
            .await
            .map_err(|e| BootstrapError::ResponseTopicUnavailable(topic.clone(), e))?;

        let subscription = broker
            .subscribe(&topic, &channel)
            .await
            .map_err(|e| BootstrapError::ResponseSubscriptionFailed(topic.clone(), e))?;

        info!(%topic, %channel, "Listening for responses");

        let router = Self {
            topic,
            subscription,
            dispatcher,
            supervisor: supervisor.clone(),
        };

        tokio::spawn(router.run());

        Ok(())
    }

    #[instrument(name = "router", skip(self), fields(topic = %self.topic))]
    async fn run(mut self) {
        let token = self.supervisor.token().clone();

        loop {
            let payload = tokio::select! {
                _ = token.cancelled() => break,
                payload = self.subscription.next() => payload,
            };

            let payload = match payload {
                Some(payload) => payload,
                None => {
                    self.supervisor
                        .fault(Fault::SubscriptionClosed(self.topic.clone()));
                    break;
                }
            };

            let message = match Message::from_bytes(&payload) {
                Ok(message) => message,
                Err(e) => {
                    self.supervisor.fault(Fault::Protocol {
                        topic: self.topic.clone(),
                        error: ErrorReport::new(e),
                    });
                    break;
                }
            };

            trace!(correlation_id = %message.correlation_id, "Routing response");

            let delivered = tokio::select! {
                _ = token.cancelled() => break,
                result = self.dispatcher.send(message) => result.is_ok(),
            };

            if !delivered {
                debug!("Actor is gone, stopping");
                break;
            }
        }
    }
}
