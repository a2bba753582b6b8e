use super::actor::{box_handler, ActorHandle, ResponseStream, Ticket};
use super::broker::{bind_random_node, BrokerLookup, BrokerNode, SharedBroker};
use super::discovery::{self, Consumer};
use super::implementation::json::Envelope;
use super::router::ResponseRouter;
use super::supervisor::{Fault, ServiceEvent, Supervisor};
use super::{
    BootstrapError, CorrelationCounter, CorrelationId, Message, ServiceError, ServiceIdentity,
    TopicError,
};
use crate::library::{BoxedError, EmptyResult};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

struct Inner {
    identity: ServiceIdentity,
    node: BrokerNode,
    broker: SharedBroker,
    counter: CorrelationCounter,
    actor: ActorHandle,
    supervisor: Supervisor,
}

/// Running instance of a service within a colony
///
/// Cheap to clone, all clones share the same actor, response topic and correlation counter.
/// The instance keeps running until [`shutdown`](Service::shutdown) is called, a
/// [`Fault`] occurs or every clone has been dropped.
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    /// Looks up the available broker nodes, connects to a random one and starts the instance
    #[instrument(skip(identity, lookup), fields(%identity))]
    pub async fn connect<L>(identity: ServiceIdentity, lookup: &L) -> Result<Self, BootstrapError>
    where
        L: BrokerLookup,
    {
        let (node, broker) = bind_random_node(lookup).await?;
        Self::start(identity, node, Arc::new(broker)).await
    }

    /// Starts an instance on top of an already connected broker
    pub async fn start(
        identity: ServiceIdentity,
        node: BrokerNode,
        broker: SharedBroker,
    ) -> Result<Self, BootstrapError> {
        let supervisor = Supervisor::new();
        let actor = ActorHandle::spawn(&supervisor);

        if let Err(e) =
            ResponseRouter::start(&identity, &broker, actor.dispatcher(), &supervisor).await
        {
            supervisor.shutdown();
            return Err(e);
        }

        info!(%identity, %node, "Service instance started");

        Ok(Self {
            inner: Arc::new(Inner {
                identity,
                node,
                broker,
                counter: CorrelationCounter::default(),
                actor,
                supervisor,
            }),
        })
    }

    /// Identity this instance has been started with
    pub fn identity(&self) -> &ServiceIdentity {
        &self.inner.identity
    }

    /// Broker node this instance is bound to
    pub fn node(&self) -> &BrokerNode {
        &self.inner.node
    }

    /// Builds a message on the topic of this instance with the next correlation id
    pub fn new_message(
        &self,
        content_type: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Message, TopicError> {
        Message::new(
            &self.inner.identity,
            content_type,
            payload,
            self.inner.counter.next(),
        )
    }

    /// Builds a response to a request received from another instance
    pub fn new_response(
        &self,
        request: &Message,
        content_type: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Message {
        request.respond(&self.inner.identity, content_type, payload)
    }

    /// Creates the topic for a content type and lets running consumers know about it
    pub async fn announce(&self, content_type: &str) -> Result<(), ServiceError> {
        discovery::announce(&self.inner.identity, &self.inner.broker, content_type).await
    }

    /// Publishes a message without expecting any responses
    pub async fn emit(&self, message: &Message) -> Result<(), ServiceError> {
        let topic = message.topic.name();
        let payload = message.to_bytes()?;

        self.inner
            .broker
            .publish(&topic, &payload)
            .await
            .map_err(|e| ServiceError::PublishFailed(topic.clone(), e))?;

        debug!(%topic, correlation_id = %message.correlation_id, "Emitted message");

        Ok(())
    }

    /// Publishes a message and hands every response to it to the handler
    ///
    /// The handler is registered before the message is published so it can not miss any
    /// response. It keeps receiving responses until it returns or the request is cancelled
    /// through the returned handle. Handler errors are reported as
    /// [`ServiceEvent::HandlerFailed`] and do not affect other requests.
    ///
    /// If a handler is already active for the correlation id of the message, the new handler
    /// is rejected with [`ServiceEvent::HandlerRejected`] and the returned handle does not
    /// affect the active one.
    pub async fn request<F, Fut>(
        &self,
        message: &Message,
        handler: F,
    ) -> Result<RequestHandle, ServiceError>
    where
        F: FnOnce(ResponseStream) -> Fut + Send + 'static,
        Fut: Future<Output = EmptyResult> + Send + 'static,
    {
        let ticket = self
            .inner
            .actor
            .register(message.correlation_id.clone(), box_handler(handler))?;

        if let Err(e) = self.emit(message).await {
            self.inner.actor.deregister(&ticket).ok();
            return Err(e);
        }

        Ok(RequestHandle {
            ticket,
            actor: self.inner.actor.clone(),
        })
    }

    /// Hands a stream of every message of a content type to the handler
    ///
    /// Producers announcing themselves while the handler is running are picked up as well.
    /// Returns once the handler returned, which unsubscribes from all topics.
    pub async fn consume<F, Fut>(&self, content_type: &str, handler: F) -> Result<(), ServiceError>
    where
        F: FnOnce(Consumer) -> Fut,
        Fut: Future<Output = Result<(), BoxedError>>,
    {
        let consumer = self.watch(content_type).await?;

        handler(consumer)
            .await
            .map_err(|e| ServiceError::HandlerFailed(content_type.to_owned(), e))
    }

    /// Creates a stream of every message of a content type owned by the caller
    pub async fn watch(&self, content_type: &str) -> Result<Consumer, ServiceError> {
        discovery::watch(
            &self.inner.identity,
            &self.inner.broker,
            content_type,
            &self.inner.supervisor,
        )
        .await
    }

    /// Subscribes to notable occurrences like failed handlers
    pub fn events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.supervisor.subscribe()
    }

    /// Waits until the instance terminated, returns the fault which caused it if any
    pub async fn terminated(&self) -> Option<Fault> {
        self.inner.supervisor.terminated().await
    }

    /// Stops every task of the instance
    ///
    /// Running response handlers see the end of their stream and consumers stop receiving.
    pub fn shutdown(&self) {
        self.inner.supervisor.shutdown();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.supervisor.shutdown();
    }
}

/// Handle to an outstanding request
pub struct RequestHandle {
    ticket: Ticket,
    actor: ActorHandle,
}

impl RequestHandle {
    /// Correlation id the responses to the request carry
    pub fn correlation_id(&self) -> &CorrelationId {
        self.ticket.correlation_id()
    }

    /// Ends the response stream of the handler, later responses are dropped
    ///
    /// Only affects the handler passed along with this request. Cancelling after it returned
    /// leaves later requests reusing the correlation id untouched.
    pub fn cancel(self) {
        if self.actor.deregister(&self.ticket).is_err() {
            debug!("Request cancelled after the instance stopped");
        }
    }
}
