//! Various options usable by colony services
//!
//! The structs in this module allow binaries to flatten them into
//! their own options struct. This allows for a unified yet non-cluttered
//! option set across all services of a colony.

use crate::library::communication::implementation::redis::{RedisLookup, DEFAULT_STREAM_LIMIT};
use crate::library::communication::{ServiceIdentity, TopicError};
use structopt::StructOpt;

/// Identity of the service instance
#[derive(Debug, StructOpt)]
pub struct ServiceOptions {
    /// Name of the service, shared by all of its instances
    #[structopt(long = "name", env = "COLONY_SERVICE_NAME", value_name = "name")]
    pub name: String,

    /// Identifier of this instance which has to be unique among
    /// all instances of the service. It may not contain dashes.
    #[structopt(long = "id", env = "COLONY_SERVICE_ID", value_name = "id")]
    pub id: String,
}

impl ServiceOptions {
    /// Validates the options into a [`ServiceIdentity`]
    pub fn identity(&self) -> Result<ServiceIdentity, TopicError> {
        ServiceIdentity::new(&self.name, &self.id)
    }
}

/// Options for locating the message broker
#[derive(Debug, StructOpt)]
pub struct BrokerOptions {
    /// Redis broker node URLs, one is chosen at random
    #[structopt(
        short = "b",
        long = "broker",
        env = "COLONY_BROKER",
        global = true,
        default_value = "redis://colony-redis/",
        value_name = "url",
        use_delimiter = true
    )]
    pub urls: Vec<String>,

    /// Redis server holding the set of available broker nodes.
    /// Takes precedence over the static list of nodes.
    #[structopt(long = "lookup", env = "COLONY_LOOKUP", value_name = "url")]
    pub lookup: Option<String>,

    /// Approximate maximum number of messages retained per topic
    #[structopt(
        long = "stream-limit",
        env = "COLONY_STREAM_LIMIT",
        default_value = "10000",
        value_name = "count"
    )]
    pub stream_limit: usize,
}

impl BrokerOptions {
    /// Builds the lookup described by the options
    pub fn lookup(&self) -> RedisLookup {
        let lookup = match &self.lookup {
            Some(url) => RedisLookup::registry(url.as_str()),
            None => RedisLookup::fixed(self.urls.clone()),
        };

        lookup.with_stream_limit(self.stream_limit)
    }
}

/// Options for log output
#[derive(Debug, StructOpt)]
pub struct LogOptions {
    /// Log filter in the `env_logger` syntax
    #[structopt(long = "log", env = "RUST_LOG", default_value = "warn", value_name = "filter")]
    pub filter: String,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            urls: vec!["redis://colony-redis/".to_owned()],
            lookup: None,
            stream_limit: DEFAULT_STREAM_LIMIT,
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::implementation::redis::NodeSource;
    use pretty_assertions::assert_eq;

    #[derive(Debug, StructOpt)]
    struct Options {
        #[structopt(flatten)]
        service: ServiceOptions,

        #[structopt(flatten)]
        broker: BrokerOptions,

        #[structopt(flatten)]
        log: LogOptions,
    }

    #[test]
    fn build_identity() {
        let options =
            Options::from_iter(vec!["colony", "--name", "honeybadger", "--id", "1", "--log", "info"]);

        assert_eq!(options.service.identity().unwrap().to_string(), "honeybadger/1");
        assert_eq!(options.log.filter, "info");
    }

    #[test]
    fn reject_invalid_identity() {
        let options = Options::from_iter(vec!["colony", "--name", "honey-badger", "--id", "1"]);
        assert!(options.service.identity().is_err());
    }

    #[test]
    fn build_fixed_lookup() {
        let options = Options::from_iter(vec![
            "colony",
            "--name",
            "a",
            "--id",
            "1",
            "--broker",
            "redis://one/,redis://two/",
            "--stream-limit",
            "50",
        ]);

        let lookup = options.broker.lookup();
        assert_eq!(
            lookup.source(),
            &NodeSource::Static(vec!["redis://one/".into(), "redis://two/".into()])
        );
        assert_eq!(lookup.stream_limit(), 50);
    }

    #[test]
    fn prefer_registry_lookup() {
        let broker = BrokerOptions {
            lookup: Some("redis://lookup/".into()),
            ..BrokerOptions::default()
        };

        assert_eq!(
            broker.lookup().source(),
            &NodeSource::Registry("redis://lookup/".into())
        );
        assert_eq!(broker.lookup().stream_limit(), DEFAULT_STREAM_LIMIT);
    }
}
