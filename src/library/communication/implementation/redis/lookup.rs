use super::super::super::broker::{BrokerLookup, BrokerNode};
use super::{RedisBroker, RedisBrokerError, DEFAULT_STREAM_LIMIT, NODE_REGISTRY_KEY};
use crate::library::BoxedError;
use async_trait::async_trait;
use redis::{AsyncCommands, Client};
use tracing::{debug, instrument};

/// Origin of the list of available Redis nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSource {
    /// Fixed list of connection urls
    Static(Vec<String>),
    /// Set of connection urls stored on a registry server
    Registry(String),
}

/// [`BrokerLookup`] handing out [`RedisBrokers`](RedisBroker)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisLookup {
    source: NodeSource,
    stream_limit: usize,
}

impl RedisLookup {
    /// Creates a lookup over a fixed list of connection urls
    pub fn fixed(urls: Vec<String>) -> Self {
        Self {
            source: NodeSource::Static(urls),
            stream_limit: DEFAULT_STREAM_LIMIT,
        }
    }

    /// Creates a lookup reading the available nodes from a registry server
    pub fn registry(url: impl Into<String>) -> Self {
        Self {
            source: NodeSource::Registry(url.into()),
            stream_limit: DEFAULT_STREAM_LIMIT,
        }
    }

    /// Caps each topic stream of the connected brokers at roughly the given length
    pub fn with_stream_limit(mut self, stream_limit: usize) -> Self {
        self.stream_limit = stream_limit;
        self
    }

    /// Where the nodes are looked up
    pub fn source(&self) -> &NodeSource {
        &self.source
    }

    /// Maximum length of each topic stream
    pub fn stream_limit(&self) -> usize {
        self.stream_limit
    }
}

#[async_trait]
impl BrokerLookup for RedisLookup {
    type Broker = RedisBroker;

    #[instrument(skip(self), fields(source = ?self.source))]
    async fn discover_nodes(&self) -> Result<Vec<BrokerNode>, BoxedError> {
        let urls = match &self.source {
            NodeSource::Static(urls) => urls.clone(),
            NodeSource::Registry(url) => {
                let client = Client::open(url.as_str()).map_err(RedisBrokerError::from)?;
                let mut con = client
                    .get_async_connection()
                    .await
                    .map_err(RedisBrokerError::from)?;

                let mut urls: Vec<String> = con
                    .smembers(NODE_REGISTRY_KEY)
                    .await
                    .map_err(RedisBrokerError::from)?;

                urls.sort();
                urls
            }
        };

        debug!(count = urls.len(), "Looked up redis nodes");

        Ok(urls.into_iter().map(BrokerNode::new).collect())
    }

    async fn connect(&self, node: &BrokerNode) -> Result<RedisBroker, BoxedError> {
        Ok(RedisBroker::connect(node.endpoint(), self.stream_limit).await?)
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn list_fixed_nodes() {
        let lookup = RedisLookup::fixed(vec![
            "redis://one/".to_string(),
            "redis://two/".to_string(),
        ]);

        assert_eq!(
            lookup.discover_nodes().await.unwrap(),
            vec![BrokerNode::new("redis://one/"), BrokerNode::new("redis://two/")]
        );
    }

    #[test]
    fn default_to_capped_streams() {
        let lookup = RedisLookup::registry("redis://lookup/").with_stream_limit(5);

        assert_eq!(lookup.stream_limit(), 5);
        assert_eq!(
            lookup.source(),
            &NodeSource::Registry("redis://lookup/".into())
        );
        assert_eq!(
            RedisLookup::fixed(Vec::new()).stream_limit(),
            DEFAULT_STREAM_LIMIT
        );
    }
}
