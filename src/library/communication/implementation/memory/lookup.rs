use super::super::super::broker::{BrokerLookup, BrokerNode};
use super::{MemoryBroker, MemoryBrokerError};
use crate::library::BoxedError;
use async_trait::async_trait;

const LOCAL_ENDPOINT: &str = "memory://local";

/// Lookup serving a fixed set of in-memory broker nodes
#[derive(Clone, Default)]
pub struct MemoryLookup {
    nodes: Vec<(BrokerNode, MemoryBroker)>,
}

impl MemoryLookup {
    /// Creates a lookup from a list of nodes and the brokers they are backed by
    pub fn new(nodes: Vec<(BrokerNode, MemoryBroker)>) -> Self {
        Self { nodes }
    }

    /// Creates a lookup with exactly one node backed by the given broker
    pub fn single(broker: MemoryBroker) -> Self {
        Self::new(vec![(BrokerNode::new(LOCAL_ENDPOINT), broker)])
    }
}

#[async_trait]
impl BrokerLookup for MemoryLookup {
    type Broker = MemoryBroker;

    async fn discover_nodes(&self) -> Result<Vec<BrokerNode>, BoxedError> {
        Ok(self.nodes.iter().map(|(node, _)| node.clone()).collect())
    }

    async fn connect(&self, node: &BrokerNode) -> Result<MemoryBroker, BoxedError> {
        self.nodes
            .iter()
            .find(|(candidate, _)| candidate == node)
            .map(|(_, broker)| broker.clone())
            .ok_or_else(|| MemoryBrokerError::UnknownNode(node.to_string()).into())
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::broker::Broker;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn connect_to_shared_state() {
        let broker = MemoryBroker::default();
        let lookup = MemoryLookup::single(broker.clone());

        let nodes = lookup.discover_nodes().await.unwrap();
        assert_eq!(nodes, vec![BrokerNode::new(LOCAL_ENDPOINT)]);

        let connected = lookup.connect(&nodes[0]).await.unwrap();
        connected.create_topic("shared").await.unwrap();

        assert!(broker.list_topics().await.unwrap().contains("shared"));
    }

    #[tokio::test]
    async fn refuse_unknown_nodes() {
        let lookup = MemoryLookup::default();
        assert!(lookup
            .connect(&BrokerNode::new("memory://elsewhere"))
            .await
            .is_err());
    }
}
