use super::super::super::broker::{Broker, RawSubscription};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::stream::{unfold, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Number of messages retained per topic and channel while nobody receives them
pub const DEFAULT_BACKLOG_LIMIT: usize = 10_000;

/// Errors raised by the in-memory broker
#[derive(Error, Debug)]
pub enum MemoryBrokerError {
    /// A task panicked while holding the broker state
    #[error("broker state is poisoned")]
    Poisoned,
    /// The requested node is not served by the lookup
    #[error("unknown broker node {0}")]
    UnknownNode(String),
}

#[derive(Default)]
struct ChannelState {
    subscribers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    next: usize,
    backlog: VecDeque<Vec<u8>>,
}

fn push_capped(backlog: &mut VecDeque<Vec<u8>>, payload: Vec<u8>, limit: usize) {
    while backlog.len() >= limit.max(1) {
        backlog.pop_front();
    }

    backlog.push_back(payload);
}

impl ChannelState {
    fn deliver(&mut self, mut payload: Vec<u8>, backlog_limit: usize) {
        self.subscribers.retain(|s| !s.is_closed());

        while !self.subscribers.is_empty() {
            let index = self.next % self.subscribers.len();
            self.next = self.next.wrapping_add(1);

            match self.subscribers[index].send(payload) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    payload = returned;
                    self.subscribers.remove(index);
                }
            }
        }

        push_capped(&mut self.backlog, payload, backlog_limit);
    }
}

#[derive(Default)]
struct TopicState {
    backlog: VecDeque<Vec<u8>>,
    channels: HashMap<String, ChannelState>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicState>,
}

/// Broker keeping all topics in the memory of the current process
///
/// Clones share the same topics. Messages published to a topic without channels and
/// messages for a channel without subscribers are retained until someone subscribes.
/// A channel stays alive after its last subscriber is gone, so each backlog only keeps
/// the newest [`DEFAULT_BACKLOG_LIMIT`] messages unless configured otherwise.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    backlog_limit: usize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::with_backlog_limit(DEFAULT_BACKLOG_LIMIT)
    }
}

impl MemoryBroker {
    /// Creates a broker retaining at most `backlog_limit` undelivered messages per topic and channel
    pub fn with_backlog_limit(backlog_limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            backlog_limit,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, MemoryBrokerError> {
        self.state.lock().map_err(|_| MemoryBrokerError::Poisoned)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: &[u8]) -> EmptyResult {
        let mut state = self.state()?;
        let topic_state = state.topics.entry(topic.to_owned()).or_default();

        if topic_state.channels.is_empty() {
            trace!(topic, "Buffering message until a channel is created");
            push_capped(&mut topic_state.backlog, payload.to_vec(), self.backlog_limit);
        } else {
            for channel in topic_state.channels.values_mut() {
                channel.deliver(payload.to_vec(), self.backlog_limit);
            }
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str, channel: &str) -> Result<RawSubscription, BoxedError> {
        let mut state = self.state()?;
        let topic_state = state.topics.entry(topic.to_owned()).or_default();

        let first_channel = topic_state.channels.is_empty();
        let topic_backlog = if first_channel {
            std::mem::take(&mut topic_state.backlog)
        } else {
            VecDeque::new()
        };

        let channel_state = topic_state.channels.entry(channel.to_owned()).or_default();
        channel_state.backlog.extend(topic_backlog);

        let (tx, rx) = mpsc::unbounded_channel();

        for payload in channel_state.backlog.drain(..) {
            tx.send(payload).ok();
        }

        channel_state.subscribers.push(tx);

        trace!(topic, channel, "Subscribed");

        let stream = unfold(rx, |mut rx| async move {
            rx.recv().await.map(|payload| (payload, rx))
        });

        Ok(stream.boxed())
    }

    async fn list_topics(&self) -> Result<HashSet<String>, BoxedError> {
        Ok(self.state()?.topics.keys().cloned().collect())
    }

    async fn create_topic(&self, topic: &str) -> EmptyResult {
        self.state()?.topics.entry(topic.to_owned()).or_default();
        Ok(())
    }
}
