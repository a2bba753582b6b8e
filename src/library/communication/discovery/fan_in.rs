use super::super::broker::RawSubscription;
use super::super::implementation::json::Envelope;
use super::super::supervisor::{Fault, Supervisor};
use super::super::{ErrorReport, Message};
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

/// Merges any number of topic subscriptions into one channel
///
/// Every subscription is drained by its own feeder task which can be stopped individually.
/// A topic may be attached more than once, in which case each message published to it
/// arrives once per attachment.
pub(crate) struct FanIn {
    feeders: HashMap<String, Vec<CancellationToken>>,
    sender: mpsc::Sender<Message>,
    token: CancellationToken,
    supervisor: Supervisor,
}

impl FanIn {
    /// Creates a new fan-in whose feeders stop once the given token is cancelled
    pub fn new(
        token: CancellationToken,
        supervisor: Supervisor,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (sender, rx) = mpsc::channel(capacity);

        let fan_in = Self {
            feeders: HashMap::new(),
            sender,
            token,
            supervisor,
        };

        (fan_in, rx)
    }

    pub fn attach(&mut self, topic: String, subscription: RawSubscription) {
        let token = self.token.child_token();

        let feeder = Feeder {
            topic: topic.clone(),
            subscription,
            sender: self.sender.clone(),
            token: token.clone(),
            supervisor: self.supervisor.clone(),
        };

        tokio::spawn(feeder.run());

        let feeders = self.feeders.entry(topic).or_default();
        feeders.push(token);

        trace!(attachments = feeders.len(), "Attached topic");
    }

    /// Stops every feeder of the topic, returns whether there was any
    pub fn detach(&mut self, topic: &str) -> bool {
        match self.feeders.remove(topic) {
            Some(tokens) => {
                tokens.iter().for_each(CancellationToken::cancel);
                true
            }
            None => false,
        }
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.feeders.keys().cloned().collect();
        topics.sort();
        topics
    }
}

struct Feeder {
    topic: String,
    subscription: RawSubscription,
    sender: mpsc::Sender<Message>,
    token: CancellationToken,
    supervisor: Supervisor,
}

impl Feeder {
    #[instrument(name = "feeder", skip(self), fields(topic = %self.topic))]
    async fn run(mut self) {
        loop {
            let payload = tokio::select! {
                _ = self.token.cancelled() => break,
                payload = self.subscription.next() => payload,
            };

            let payload = match payload {
                Some(payload) => payload,
                None => {
                    debug!("Subscription ended");
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

            tokio::select! {
                _ = self.token.cancelled() => break,
                result = self.sender.send(message) => if result.is_err() {
                    break;
                },
            }
        }

        trace!("Feeder stopped");
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::{CorrelationId, ServiceIdentity};
    use futures::stream;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn payloads(sender: &str, count: usize) -> Vec<Vec<u8>> {
        let identity = ServiceIdentity::new(sender, "1").unwrap();

        (0..count)
            .map(|i| {
                Message::new(&identity, "bees", i.to_string(), CorrelationId::from("1"))
                    .unwrap()
                    .to_bytes()
                    .unwrap()
            })
            .collect()
    }

    fn endless(payloads: Vec<Vec<u8>>) -> RawSubscription {
        stream::iter(payloads).chain(stream::pending()).boxed()
    }

    #[tokio::test]
    async fn merge_subscriptions() {
        let supervisor = Supervisor::new();
        let (mut fan_in, mut rx) = FanIn::new(CancellationToken::new(), supervisor, 4);

        fan_in.attach("a-1-bees".into(), endless(payloads("a", 3)));
        fan_in.attach("b-1-bees".into(), endless(payloads("b", 2)));

        let mut received = Vec::new();
        for _ in 0..5 {
            let message = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            received.push(format!("{}{}", message.from_name, message.payload_str().unwrap()));
        }
        received.sort();

        assert_eq!(received, vec!["a0", "a1", "a2", "b0", "b1"]);
        assert_eq!(fan_in.topics(), vec!["a-1-bees", "b-1-bees"]);
    }

    #[tokio::test]
    async fn detach_topics() {
        let supervisor = Supervisor::new();
        let (mut fan_in, mut rx) = FanIn::new(CancellationToken::new(), supervisor, 4);

        fan_in.attach("a-1-bees".into(), endless(Vec::new()));
        fan_in.attach("a-1-bees".into(), endless(Vec::new()));

        assert!(fan_in.detach("a-1-bees"));
        assert!(!fan_in.detach("a-1-bees"));
        assert!(fan_in.topics().is_empty());

        drop(fan_in);
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn fault_on_garbage() {
        let supervisor = Supervisor::new();
        let (mut fan_in, _rx) = FanIn::new(supervisor.token().child_token(), supervisor.clone(), 4);

        fan_in.attach("a-1-bees".into(), endless(vec![b"garbage".to_vec()]));

        match timeout(WAIT, supervisor.terminated()).await.unwrap() {
            Some(Fault::Protocol { topic, .. }) => assert_eq!(topic, "a-1-bees"),
            other => panic!("unexpected termination {:?}", other),
        }
    }
}
