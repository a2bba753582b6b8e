//! Announce/Watch protocol to find the producers of a content type
//!
//! A consumer learns about producers in two ways:
//!
//! 1. A snapshot of the broker's topic registry taken when watching starts
//! 2. [`Announcements`](super::Announcement) on the reserved
//!    [`ANNOUNCEMENT_TOPIC`](super::ANNOUNCEMENT_TOPIC) for producers appearing later
//!
//! The announcement subscription is opened before the snapshot is taken so that no producer
//! falls through the gap between the two. In turn, a producer may be picked up by both which
//! results in two subscriptions to its topic. These are not deduplicated: consumers have to
//! tolerate receiving the same message more than once.

use super::broker::{RawSubscription, SharedBroker};
use super::implementation::json::Envelope;
use super::supervisor::{Fault, ServiceEvent, Supervisor};
use super::{
    filter_by_content_type, matches_content_type, Announcement, ErrorReport, Message,
    ServiceError, ServiceIdentity, ANNOUNCEMENT_TOPIC,
};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

mod fan_in;

use fan_in::FanIn;

const CONSUMER_CAPACITY: usize = 16;

/// Creates the topic for a content type and announces it to the colony
#[instrument(skip(identity, broker), fields(%identity))]
pub(crate) async fn announce(
    identity: &ServiceIdentity,
    broker: &SharedBroker,
    content_type: &str,
) -> Result<(), ServiceError> {
    let announcement = Announcement::new(identity, content_type)?;
    let topic = announcement.topic.name();

    broker
        .create_topic(&topic)
        .await
        .map_err(|e| ServiceError::TopicCreationFailed(topic.clone(), e))?;

    broker
        .publish(ANNOUNCEMENT_TOPIC, &announcement.to_bytes()?)
        .await
        .map_err(|e| ServiceError::PublishFailed(ANNOUNCEMENT_TOPIC.to_owned(), e))?;

    info!(%topic, "Announced topic");

    Ok(())
}

/// Subscribes to every current and future topic of a content type
#[instrument(skip(identity, broker, supervisor), fields(%identity))]
pub(crate) async fn watch(
    identity: &ServiceIdentity,
    broker: &SharedBroker,
    content_type: &str,
    supervisor: &Supervisor,
) -> Result<Consumer, ServiceError> {
    // Rejects content types which could never form a topic
    identity.topic(content_type)?;

    broker
        .create_topic(ANNOUNCEMENT_TOPIC)
        .await
        .map_err(|e| ServiceError::TopicCreationFailed(ANNOUNCEMENT_TOPIC.to_owned(), e))?;

    let announcements = broker
        .subscribe(ANNOUNCEMENT_TOPIC, &identity.watch_channel(content_type))
        .await
        .map_err(|e| ServiceError::SubscribeFailed(ANNOUNCEMENT_TOPIC.to_owned(), e))?;

    let registry = broker
        .list_topics()
        .await
        .map_err(ServiceError::TopicLookupFailed)?;

    let token = supervisor.token().child_token();
    let (mut fan_in, messages) = FanIn::new(token.clone(), supervisor.clone(), CONSUMER_CAPACITY);
    let channel = identity.consumer_channel();

    for topic in filter_by_content_type(&registry, content_type) {
        let subscription = match broker.subscribe(&topic, &channel).await {
            Ok(subscription) => subscription,
            Err(e) => {
                // Feeders of the topics subscribed so far would swallow messages of the channel
                token.cancel();
                return Err(ServiceError::SubscribeFailed(topic, e));
            }
        };

        debug!(%topic, "Subscribed to existing topic");
        fan_in.attach(topic, subscription);
    }

    let (commands, command_rx) = mpsc::unbounded_channel();

    let watcher = Watcher {
        content_type: content_type.to_owned(),
        channel,
        broker: broker.clone(),
        fan_in,
        supervisor: supervisor.clone(),
        token: token.clone(),
    };

    tokio::spawn(watcher.run(announcements, command_rx));

    Ok(Consumer {
        content_type: content_type.to_owned(),
        messages,
        commands,
        token,
    })
}

enum Command {
    Unsubscribe(String, oneshot::Sender<bool>),
    Topics(oneshot::Sender<Vec<String>>),
}

struct Watcher {
    content_type: String,
    channel: String,
    broker: SharedBroker,
    fan_in: FanIn,
    supervisor: Supervisor,
    token: CancellationToken,
}

impl Watcher {
    #[instrument(name = "watcher", skip_all, fields(content_type = %self.content_type))]
    async fn run(
        mut self,
        mut announcements: RawSubscription,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let token = self.token.clone();

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(command) = commands.recv() => self.handle(command),
                payload = announcements.next() => match payload {
                    Some(payload) => {
                        if let Err(fault) = self.discovered(&payload).await {
                            self.supervisor.fault(fault);
                            break;
                        }
                    }
                    None => {
                        if !token.is_cancelled() {
                            self.supervisor.fault(Fault::SubscriptionClosed(ANNOUNCEMENT_TOPIC.to_owned()));
                        }
                        break;
                    }
                },
            }
        }

        trace!("Watcher stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Unsubscribe(topic, reply) => {
                let detached = self.fan_in.detach(&topic);
                debug!(%topic, detached, "Unsubscribed from topic");
                reply.send(detached).ok();
            }
            Command::Topics(reply) => {
                reply.send(self.fan_in.topics()).ok();
            }
        }
    }

    async fn discovered(&mut self, payload: &[u8]) -> Result<(), Fault> {
        let announcement = Announcement::from_bytes(payload).map_err(|e| Fault::Protocol {
            topic: ANNOUNCEMENT_TOPIC.to_owned(),
            error: ErrorReport::new(e),
        })?;

        let topic = announcement.topic.name();

        if !matches_content_type(&topic, &self.content_type) {
            trace!(%topic, "Ignoring unrelated announcement");
            return Ok(());
        }

        match self.broker.subscribe(&topic, &self.channel).await {
            Ok(subscription) => {
                debug!(%topic, from = %announcement.from_name, "Subscribed to announced topic");
                self.fan_in.attach(topic, subscription);
            }
            Err(e) => {
                let error = ErrorReport::from_boxed(&e);
                warn!(%topic, %error, "Unable to subscribe to announced topic");
                self.supervisor
                    .report(ServiceEvent::SubscriptionFailed { topic, error });
            }
        }

        Ok(())
    }
}

/// Merged stream of every message published for a content type
///
/// Keeps picking up producers which announce themselves after it has been created. Dropping
/// it unsubscribes from all topics.
pub struct Consumer {
    content_type: String,
    messages: mpsc::Receiver<Message>,
    commands: mpsc::UnboundedSender<Command>,
    token: CancellationToken,
}

impl Consumer {
    /// Content type this consumer has been created for
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Waits for the next message, returns `None` once the service instance terminated
    pub async fn recv(&mut self) -> Option<Message> {
        self.messages.recv().await
    }

    /// Stops receiving messages from a topic until it is announced again
    ///
    /// Returns whether the topic was subscribed to. Messages which have already been received
    /// from the topic may still be delivered.
    pub async fn unsubscribe(&self, topic: &str) -> bool {
        let (tx, rx) = oneshot::channel();

        if self
            .commands
            .send(Command::Unsubscribe(topic.to_owned(), tx))
            .is_err()
        {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    /// Names of all topics this consumer currently receives messages from
    pub async fn topics(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();

        if self.commands.send(Command::Topics(tx)).is_err() {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }
}

impl Stream for Consumer {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.messages.poll_recv(cx)
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::broker::Broker;
    use crate::library::communication::implementation::memory::MemoryBroker;
    use crate::library::communication::CorrelationId;
    use crate::library::{BoxedError, EmptyResult};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Memory broker refusing every subscription after the first few
    struct FlakyBroker {
        inner: MemoryBroker,
        subscriptions_left: AtomicUsize,
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn publish(&self, topic: &str, payload: &[u8]) -> EmptyResult {
            self.inner.publish(topic, payload).await
        }

        async fn subscribe(&self, topic: &str, channel: &str) -> Result<RawSubscription, BoxedError> {
            let left = self.subscriptions_left.load(Ordering::SeqCst);

            if left == 0 {
                return Err("subscriptions exhausted".into());
            }

            self.subscriptions_left.store(left - 1, Ordering::SeqCst);
            self.inner.subscribe(topic, channel).await
        }

        async fn list_topics(&self) -> Result<HashSet<String>, BoxedError> {
            self.inner.list_topics().await
        }

        async fn create_topic(&self, topic: &str) -> EmptyResult {
            self.inner.create_topic(topic).await
        }
    }

    fn setup() -> (SharedBroker, Supervisor, ServiceIdentity) {
        let broker: SharedBroker = Arc::new(MemoryBroker::default());
        let identity = ServiceIdentity::new("alice", "1").unwrap();
        (broker, Supervisor::new(), identity)
    }

    async fn publish(broker: &SharedBroker, sender: &ServiceIdentity, payload: &str) {
        let message = Message::new(sender, "bees", payload, CorrelationId::from("1")).unwrap();
        broker
            .publish(&message.topic.name(), &message.to_bytes().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn consume_existing_topics() {
        let (broker, supervisor, alice) = setup();
        let bob = ServiceIdentity::new("bob", "2").unwrap();

        broker.create_topic("bob-2-bees").await.unwrap();
        broker.create_topic("bob-2-snakes").await.unwrap();
        publish(&broker, &bob, "buzz").await;

        let mut consumer = watch(&alice, &broker, "bees", &supervisor).await.unwrap();
        let message = timeout(WAIT, consumer.recv()).await.unwrap().unwrap();

        assert_eq!(message.payload_str().unwrap(), "buzz");
        assert_eq!(consumer.topics().await, vec!["bob-2-bees"]);
        assert_eq!(consumer.content_type(), "bees");
    }

    #[tokio::test]
    async fn discover_producers_announcing_later() {
        let (broker, supervisor, alice) = setup();
        let carol = ServiceIdentity::new("carol", "3").unwrap();

        let mut consumer = watch(&alice, &broker, "bees", &supervisor).await.unwrap();
        assert!(consumer.topics().await.is_empty());

        announce(&carol, &broker, "snakes").await.unwrap();
        announce(&carol, &broker, "bees").await.unwrap();
        publish(&broker, &carol, "late buzz").await;

        let message = timeout(WAIT, consumer.recv()).await.unwrap().unwrap();
        assert_eq!(message.from_name, "carol");
        assert_eq!(message.payload_str().unwrap(), "late buzz");
        assert_eq!(consumer.topics().await, vec!["carol-3-bees"]);
    }

    #[tokio::test]
    async fn tolerate_duplicate_subscriptions() {
        let (broker, supervisor, alice) = setup();
        let bob = ServiceIdentity::new("bob", "2").unwrap();

        // Announced before watching, so it is picked up by the snapshot and the announcement
        announce(&bob, &broker, "bees").await.unwrap();

        let mut consumer = watch(&alice, &broker, "bees", &supervisor).await.unwrap();
        publish(&broker, &bob, "buzz").await;

        let message = timeout(WAIT, consumer.recv()).await.unwrap().unwrap();
        assert_eq!(message.payload_str().unwrap(), "buzz");

        publish(&broker, &bob, "again").await;
        let mut rest = Vec::new();
        while let Ok(Some(message)) = timeout(Duration::from_millis(200), consumer.recv()).await {
            rest.push(message.payload_str().unwrap().to_owned());
        }

        assert!(rest.contains(&"again".to_string()));
        assert!(!supervisor.token().is_cancelled());
    }

    #[tokio::test]
    async fn stop_receiving_after_unsubscribe() {
        let (broker, supervisor, alice) = setup();
        let bob = ServiceIdentity::new("bob", "2").unwrap();
        broker.create_topic("bob-2-bees").await.unwrap();

        let mut consumer = watch(&alice, &broker, "bees", &supervisor).await.unwrap();

        assert!(consumer.unsubscribe("bob-2-bees").await);
        assert!(!consumer.unsubscribe("bob-2-bees").await);
        assert!(consumer.topics().await.is_empty());

        publish(&broker, &bob, "unheard").await;
        assert!(timeout(Duration::from_millis(200), consumer.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn release_subscriptions_when_watching_fails() {
        let memory = MemoryBroker::default();
        let flaky: SharedBroker = Arc::new(FlakyBroker {
            inner: memory.clone(),
            subscriptions_left: AtomicUsize::new(2),
        });
        let supervisor = Supervisor::new();
        let alice = ServiceIdentity::new("alice", "1").unwrap();
        let bob = ServiceIdentity::new("bob", "2").unwrap();

        memory.create_topic("bob-2-bees").await.unwrap();
        memory.create_topic("carol-3-bees").await.unwrap();

        assert!(matches!(
            watch(&alice, &flaky, "bees", &supervisor).await,
            Err(ServiceError::SubscribeFailed(topic, _)) if topic == "carol-3-bees"
        ));

        // Leave the stopped feeder some time to drop its subscription
        tokio::time::sleep(Duration::from_millis(100)).await;

        let memory: SharedBroker = Arc::new(memory);
        publish(&memory, &bob, "not swallowed").await;

        let mut consumer = watch(&alice, &memory, "bees", &supervisor).await.unwrap();
        let message = timeout(WAIT, consumer.recv()).await.unwrap().unwrap();
        assert_eq!(message.payload_str().unwrap(), "not swallowed");
        assert!(!supervisor.token().is_cancelled());
    }

    #[tokio::test]
    async fn fault_on_undecodable_announcements() {
        let (broker, supervisor, alice) = setup();

        let mut consumer = watch(&alice, &broker, "bees", &supervisor).await.unwrap();
        broker.publish(ANNOUNCEMENT_TOPIC, b"nonsense").await.unwrap();

        match timeout(WAIT, supervisor.terminated()).await.unwrap() {
            Some(Fault::Protocol { topic, .. }) => assert_eq!(topic, ANNOUNCEMENT_TOPIC),
            other => panic!("unexpected termination {:?}", other),
        }

        assert_eq!(timeout(WAIT, consumer.recv()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reject_invalid_content_types() {
        let (broker, supervisor, alice) = setup();

        assert!(matches!(
            watch(&alice, &broker, "busy-bees", &supervisor).await,
            Err(ServiceError::InvalidTopic(_))
        ));
        assert!(matches!(
            announce(&alice, &broker, "").await,
            Err(ServiceError::InvalidTopic(_))
        ));
    }
}
