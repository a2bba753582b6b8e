//! Contract with the external pub/sub transport
//!
//! The broker owns message transport, topic and channel persistence as well as delivery
//! guarantees. A colony only relies on the handful of operations described by [`Broker`].
//! Which broker node an instance talks to is decided once at startup through a
//! [`BrokerLookup`]: one of the discovered nodes is chosen uniformly at random and used for
//! the lifetime of the instance.

use super::BootstrapError;
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Lazy, infinite and non-restartable sequence of raw payloads from a subscription
pub type RawSubscription = BoxStream<'static, Vec<u8>>;

/// Broker instance shared by every task of a service instance
pub type SharedBroker = Arc<dyn Broker>;

/// Pub/sub transport used by a colony
///
/// Implementations have to support concurrent use from multiple tasks.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes an opaque payload to a topic
    async fn publish(&self, topic: &str, payload: &[u8]) -> EmptyResult;

    /// Subscribes to a topic using the given channel
    ///
    /// Every channel of a topic receives a copy of each message while subscribers sharing a
    /// channel split the messages among themselves.
    async fn subscribe(&self, topic: &str, channel: &str) -> Result<RawSubscription, BoxedError>;

    /// Lists all topics currently known to the broker
    async fn list_topics(&self) -> Result<HashSet<String>, BoxedError>;

    /// Creates a topic if it does not exist yet
    async fn create_topic(&self, topic: &str) -> EmptyResult;
}

/// Endpoint descriptor of a single broker node
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerNode {
    endpoint: String,
}

impl BrokerNode {
    /// Creates a new descriptor for the given endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// Address at which the node is reachable
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Display for BrokerNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint)
    }
}

/// Discovery of broker nodes and connection establishment
#[async_trait]
pub trait BrokerLookup: Send + Sync {
    /// Broker implementation returned when connecting to a node
    type Broker: Broker + 'static;

    /// Lists all broker nodes that are currently available
    async fn discover_nodes(&self) -> Result<Vec<BrokerNode>, BoxedError>;

    /// Connects to the given node
    async fn connect(&self, node: &BrokerNode) -> Result<Self::Broker, BoxedError>;
}

/// Queries the lookup once, chooses one of the nodes uniformly at random and connects to it
#[instrument(skip(lookup), fields(lookup = std::any::type_name::<L>()))]
pub async fn bind_random_node<L>(lookup: &L) -> Result<(BrokerNode, L::Broker), BootstrapError>
where
    L: BrokerLookup,
{
    let nodes = lookup
        .discover_nodes()
        .await
        .map_err(BootstrapError::LookupFailed)?;

    debug!(count = nodes.len(), "Discovered broker nodes");

    let node = nodes
        .choose(&mut rand::thread_rng())
        .cloned()
        .ok_or(BootstrapError::NoNodes)?;

    info!(%node, "Using broker node");

    let broker = lookup
        .connect(&node)
        .await
        .map_err(|e| BootstrapError::ConnectionFailed(node.to_string(), e))?;

    Ok((node, broker))
}

#[cfg(test)]
mod does {
    use super::super::implementation::memory::{MemoryBroker, MemoryLookup};
    use super::*;

    #[tokio::test]
    async fn fail_without_nodes() {
        let lookup = MemoryLookup::new(Vec::new());

        assert!(matches!(
            bind_random_node(&lookup).await,
            Err(BootstrapError::NoNodes)
        ));
    }

    #[tokio::test]
    async fn bind_one_of_the_nodes() {
        let lookup = MemoryLookup::new(vec![
            (BrokerNode::new("memory://a"), MemoryBroker::default()),
            (BrokerNode::new("memory://b"), MemoryBroker::default()),
        ]);

        for _ in 0..16 {
            let (node, _broker) = bind_random_node(&lookup).await.unwrap();
            assert!(node.endpoint() == "memory://a" || node.endpoint() == "memory://b");
        }
    }
}
