//! In-process broker for tests, demos and colonies living in a single process
//!
//! Mirrors the topic and channel semantics of common message queues:
//!
//! - every channel of a topic receives a copy of each message published to it
//! - subscribers sharing a channel receive its messages round-robin
//! - messages published to a topic without channels are handed to the first channel
//! - messages for a channel without live subscribers wait for the next subscriber, up to a
//!   configurable backlog limit

mod broker;
mod lookup;

pub use broker::{MemoryBroker, MemoryBrokerError, DEFAULT_BACKLOG_LIMIT};
pub use lookup::MemoryLookup;
