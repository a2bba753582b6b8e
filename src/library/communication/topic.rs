use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Character joining the components of a topic name
pub const TOPIC_SEPARATOR: char = '-';

/// Reserved topic shared by the whole colony on which producers announce new content types
pub const ANNOUNCEMENT_TOPIC: &str = "colony-announce";

/// Content type of the topic on which an instance receives responses to its requests
pub const RESPONSE_CONTENT_TYPE: &str = "responses";

const RESPONSE_CHANNEL_SUFFIX: &str = "responseHandler";

/// Reasons why a set of components can not form a topic
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// Component contains the separator which would make the resulting name ambiguous
    #[error("{component} `{value}` contains the topic separator '-'")]
    ContainsSeparator {
        /// Name of the offending component
        component: &'static str,
        /// Value that has been rejected
        value: String,
    },
    /// Component is empty
    #[error("{0} may not be empty")]
    Empty(&'static str),
}

fn validate(component: &'static str, value: &str) -> Result<(), TopicError> {
    if value.is_empty() {
        Err(TopicError::Empty(component))
    } else if value.contains(TOPIC_SEPARATOR) {
        Err(TopicError::ContainsSeparator {
            component,
            value: value.to_owned(),
        })
    } else {
        Ok(())
    }
}

/// Routing identity of a stream of messages on the bus
///
/// The canonical name is `serviceName-serviceID-contentType`. Names are only ever constructed
/// and compared by suffix, they are never parsed back into their components.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    service_name: String,
    service_id: String,
    content_type: String,
}

impl Topic {
    /// Creates a new topic, rejecting empty components or those containing the [`TOPIC_SEPARATOR`]
    pub fn new(
        service_name: impl Into<String>,
        service_id: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Result<Self, TopicError> {
        let topic = Self {
            service_name: service_name.into(),
            service_id: service_id.into(),
            content_type: content_type.into(),
        };

        validate("service name", &topic.service_name)?;
        validate("service id", &topic.service_id)?;
        validate("content type", &topic.content_type)?;

        Ok(topic)
    }

    /// Name of the service publishing on this topic
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Identifier of the service instance publishing on this topic
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Kind of content published on this topic
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Canonical name used on the broker
    pub fn name(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.service_name,
            self.service_id,
            self.content_type,
            sep = TOPIC_SEPARATOR
        )
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Whether a topic name from the broker's registry carries the given content type
///
/// The reserved [`ANNOUNCEMENT_TOPIC`] never matches.
pub fn matches_content_type(topic_name: &str, content_type: &str) -> bool {
    if topic_name == ANNOUNCEMENT_TOPIC {
        return false;
    }

    topic_name
        .strip_suffix(content_type)
        .map(|prefix| prefix.ends_with(TOPIC_SEPARATOR))
        .unwrap_or(false)
}

/// Selects all topic names carrying the given content type
pub fn filter_by_content_type<'a, I>(topic_names: I, content_type: &str) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut matching: Vec<String> = topic_names
        .into_iter()
        .filter(|name| matches_content_type(name, content_type))
        .cloned()
        .collect();

    matching.sort();
    matching
}

/// Name and instance identifier of a service
///
/// Assumed to be unique within a colony. Every topic and channel name the instance
/// publishes to or subscribes with is derived from it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceIdentity {
    name: String,
    id: String,
}

impl ServiceIdentity {
    /// Creates a new identity, rejecting empty values or those containing the [`TOPIC_SEPARATOR`]
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Result<Self, TopicError> {
        let identity = Self {
            name: name.into(),
            id: id.into(),
        };

        validate("service name", &identity.name)?;
        validate("service id", &identity.id)?;

        Ok(identity)
    }

    /// Name of the service
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier of this instance
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Topic on which this instance publishes content of the given type
    pub fn topic(&self, content_type: &str) -> Result<Topic, TopicError> {
        Topic::new(&self.name, &self.id, content_type)
    }

    /// Topic on which this instance receives responses
    pub fn response_topic(&self) -> Topic {
        Topic {
            service_name: self.name.clone(),
            service_id: self.id.clone(),
            content_type: RESPONSE_CONTENT_TYPE.to_owned(),
        }
    }

    /// Channel used to subscribe to the response topic
    pub fn response_channel(&self) -> String {
        self.channel(RESPONSE_CHANNEL_SUFFIX)
    }

    /// Channel used to subscribe to topics of consumed content types
    pub fn consumer_channel(&self) -> String {
        format!("{}{}{}", self.name, TOPIC_SEPARATOR, self.id)
    }

    /// Channel private to this instance and content type, used to watch for announcements
    ///
    /// Each watcher gets its own channel so that concurrent watchers do not compete for
    /// the same announcement delivery.
    pub fn watch_channel(&self, content_type: &str) -> String {
        self.channel(content_type)
    }

    fn channel(&self, suffix: &str) -> String {
        format!("{}{sep}{}", self.consumer_channel(), suffix, sep = TOPIC_SEPARATOR)
    }
}

impl Display for ServiceIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.id)
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    #[test]
    fn build_canonical_names() {
        let topic = Topic::new("bob", "2", "greeting").unwrap();
        assert_eq!(topic.name(), "bob-2-greeting");
        assert_eq!(topic.to_string(), topic.name());
    }

    #[test]
    fn name_deterministically() {
        let a = Topic::new("alice", "1", "bees").unwrap();
        let b = Topic::new("alice", "1", "bees").unwrap();
        assert_eq!(a.name(), b.name());
    }

    #[test]
    fn keep_distinct_components_distinct() {
        let components = [
            ("alice", "1", "bees"),
            ("alice", "11", "bees"),
            ("alice1", "1", "bees"),
            ("alice", "1", "bee"),
            ("bob", "1", "bees"),
        ];

        let names: HashSet<String> = components
            .iter()
            .map(|(n, i, c)| Topic::new(*n, *i, *c).unwrap().name())
            .collect();

        assert_eq!(names.len(), components.len());
    }

    #[test]
    fn reject_separator_in_components() {
        assert_eq!(
            Topic::new("honey-badger", "1", "bees"),
            Err(TopicError::ContainsSeparator {
                component: "service name",
                value: "honey-badger".into()
            })
        );
        assert!(Topic::new("badger", "1-2", "bees").is_err());
        assert!(Topic::new("badger", "1", "busy-bees").is_err());
        assert!(ServiceIdentity::new("badger", "a-b").is_err());
    }

    #[test]
    fn reject_empty_components() {
        assert_eq!(
            Topic::new("badger", "", "bees"),
            Err(TopicError::Empty("service id"))
        );
        assert!(ServiceIdentity::new("", "1").is_err());
    }

    #[test]
    fn match_by_content_type_suffix() {
        assert!(matches_content_type("bob-2-bees", "bees"));
        assert!(!matches_content_type("bob-2-honeybees", "bees"));
        assert!(!matches_content_type("bees", "bees"));
        assert!(!matches_content_type("bob-2-bees", "snakes"));
        assert!(!matches_content_type(ANNOUNCEMENT_TOPIC, "announce"));
    }

    #[test]
    fn filter_topic_registry() {
        let registry: HashSet<String> = vec![
            "bob-2-bees",
            "alice-1-bees",
            "alice-1-responses",
            "carol-3-snakes",
            ANNOUNCEMENT_TOPIC,
        ]
        .into_iter()
        .map(String::from)
        .collect();

        assert_eq!(
            filter_by_content_type(&registry, "bees"),
            vec!["alice-1-bees".to_string(), "bob-2-bees".to_string()]
        );
    }

    #[test]
    fn derive_names_from_identity() {
        let identity = ServiceIdentity::new("alice", "1").unwrap();

        assert_eq!(identity.response_topic().name(), "alice-1-responses");
        assert_eq!(identity.response_channel(), "alice-1-responseHandler");
        assert_eq!(identity.consumer_channel(), "alice-1");
        assert_eq!(identity.watch_channel("bees"), "alice-1-bees");
        assert_eq!(identity.topic("bees").unwrap().name(), "alice-1-bees");
        assert_eq!(identity.to_string(), "alice/1");
    }
}
