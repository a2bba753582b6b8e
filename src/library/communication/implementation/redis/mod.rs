//! Broker implementation using [Redis Streams](https://redis.io/topics/streams-intro)
//!
//! Every topic is a capped stream and every channel a consumer group on it. Each subscription
//! joins the group as a distinct consumer, which makes subscribers of one channel split the
//! messages between them while every channel receives all of them.

const TOPIC_KEY_PREFIX: &str = "colony.topic.";
const TOPIC_REGISTRY_KEY: &str = "colony.topics";
const NODE_REGISTRY_KEY: &str = "colony.nodes";
const STREAM_PAYLOAD_KEY: &str = "payload";
const STREAM_ID_NEW: &str = "*";
const STREAM_ID_HEAD: &str = "0";
const STREAM_ID_ADDITIONS: &str = ">";

/// Default upper bound for the length of each topic stream
pub const DEFAULT_STREAM_LIMIT: usize = 10_000;

use thiserror::Error;

mod broker;
mod lookup;

pub use broker::*;
pub use lookup::*;

/// Errors raised by the Redis broker
#[derive(Debug, Error)]
pub enum RedisBrokerError {
    /// Command or connection failure
    #[error("redis operation failed")]
    Redis(#[from] redis::RedisError),
    /// Server did not accept a connection in time
    #[error("timed out connecting to {0}")]
    Timeout(String),
}

fn topic_key(topic: &str) -> String {
    format!("{}{}", TOPIC_KEY_PREFIX, topic)
}
