use super::super::super::broker::{Broker, RawSubscription};
use super::{
    topic_key, RedisBrokerError, STREAM_ID_ADDITIONS, STREAM_ID_HEAD, STREAM_ID_NEW,
    STREAM_PAYLOAD_KEY, TOPIC_REGISTRY_KEY,
};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use redis::aio::{Connection, ConnectionLike, MultiplexedConnection};
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, instrument, trace, warn};

const CONNECT_ATTEMPTS: usize = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(4);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(2);
const READ_BATCH_SIZE: usize = 32;

/// Broker talking to a single Redis server
///
/// Short commands share one multiplexed connection while every subscription gets a
/// connection of its own since it blocks while waiting for new entries.
pub struct RedisBroker {
    url: String,
    client: Client,
    shared: MultiplexedConnection,
    stream_limit: usize,
}

impl RedisBroker {
    /// Connects to the server at the given url, capping every topic at roughly `stream_limit` entries
    #[instrument]
    pub async fn connect(url: &str, stream_limit: usize) -> Result<Self, RedisBrokerError> {
        let client = Client::open(url)?;
        let mut attempt = 0;

        loop {
            attempt += 1;
            trace!(attempt, "Connecting to redis");

            match timeout(CONNECT_TIMEOUT, client.get_multiplexed_tokio_connection()).await {
                Ok(Ok(shared)) => {
                    debug!("Connected to redis");

                    return Ok(Self {
                        url: url.to_owned(),
                        client,
                        shared,
                        stream_limit,
                    });
                }
                Ok(Err(error)) if attempt >= CONNECT_ATTEMPTS => return Err(error.into()),
                Err(_) if attempt >= CONNECT_ATTEMPTS => {
                    return Err(RedisBrokerError::Timeout(url.to_owned()))
                }
                Ok(Err(error)) => warn!(?error, "Failed to connect to redis"),
                Err(error) => warn!(?error, "Timeout connecting to redis"),
            }

            sleep(CONNECT_RETRY_INTERVAL).await;
        }
    }

    async fn owned_connection(&self) -> Result<Connection, RedisBrokerError> {
        timeout(CONNECT_TIMEOUT, self.client.get_async_connection())
            .await
            .map_err(|_| RedisBrokerError::Timeout(self.url.clone()))?
            .map_err(RedisBrokerError::from)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: &[u8]) -> EmptyResult {
        let mut con = self.shared.clone();

        con.sadd::<_, _, ()>(TOPIC_REGISTRY_KEY, topic).await?;
        con.xadd_maxlen::<_, _, _, _, ()>(
            topic_key(topic),
            StreamMaxlen::Approx(self.stream_limit),
            STREAM_ID_NEW,
            &[(STREAM_PAYLOAD_KEY, payload)],
        )
        .await?;

        Ok(())
    }

    /// Joins the consumer group named after the channel, creating it at the head of the stream if required
    async fn subscribe(&self, topic: &str, channel: &str) -> Result<RawSubscription, BoxedError> {
        let key = topic_key(topic);
        let mut con = self.owned_connection().await?;

        create_consumer_group(&mut con, &key, channel).await;

        let consumer = format!("{}.{:016x}", channel, rand::random::<u64>());
        debug!(%key, %channel, %consumer, "Joined consumer group");

        Ok(xread_stream(con, key, channel.to_owned(), consumer))
    }

    async fn list_topics(&self) -> Result<HashSet<String>, BoxedError> {
        let mut con = self.shared.clone();
        let topics: HashSet<String> = con.smembers(TOPIC_REGISTRY_KEY).await?;

        Ok(topics)
    }

    async fn create_topic(&self, topic: &str) -> EmptyResult {
        let mut con = self.shared.clone();
        con.sadd::<_, _, ()>(TOPIC_REGISTRY_KEY, topic).await?;

        Ok(())
    }
}

async fn create_consumer_group<C: ConnectionLike + Send>(con: &mut C, key: &str, group: &str) {
    // Fails if the group already exists which is the common case
    con.xgroup_create_mkstream::<_, _, _, ()>(key, group, STREAM_ID_HEAD)
        .await
        .ok();
}

struct ReadState {
    con: Connection,
    key: String,
    group: String,
    consumer: String,
    pending: VecDeque<Vec<u8>>,
}

impl ReadState {
    fn read_options(&self) -> StreamReadOptions {
        StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(READ_BATCH_SIZE)
            .block(0)
    }

    /// Reads the next batch of entries and acknowledges them, returns false if reading failed
    async fn fill(&mut self) -> bool {
        let options = self.read_options();
        let reply = self
            .con
            .xread_options::<_, _, StreamReadReply>(&[&self.key], &[STREAM_ID_ADDITIONS], options)
            .await;

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                error!(key = %self.key, "Encountered error reading from redis stream {:?}", e);
                return false;
            }
        };

        for stream in reply.keys {
            for entry in stream.ids {
                match entry.get::<Vec<u8>>(STREAM_PAYLOAD_KEY) {
                    Some(payload) => self.pending.push_back(payload),
                    None => warn!(id = %entry.id, "Skipping stream entry without payload"),
                }

                if let Err(e) = self
                    .con
                    .xack::<_, _, _, ()>(&self.key, &self.group, &[&entry.id])
                    .await
                {
                    warn!(id = %entry.id, "Unable to acknowledge stream entry {:?}", e);
                }
            }
        }

        true
    }
}

fn xread_stream(con: Connection, key: String, group: String, consumer: String) -> RawSubscription {
    let state = ReadState {
        con,
        key,
        group,
        consumer,
        pending: VecDeque::new(),
    };

    // Batches are read in one go but handed out one payload at a time
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(payload) = state.pending.pop_front() {
                return Some((payload, state));
            }

            if !state.fill().await {
                return None;
            }
        }
    })
    .boxed()
}
