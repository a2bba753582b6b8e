//! Structures to communicate between services of a colony
//!
//! In general, there are two modes of operation:
//!
//! 1. Publish and subscribe
//! 2. Request and response
//!
//! The first is used for plain event notifications. A service [emits](Service::emit) a
//! [`Message`] of some content type onto its own [`Topic`] and every service that
//! [consumes](Service::consume) that content type receives it. Consumers do not need to know
//! about producers up front: the [`discovery`] protocol combines a snapshot of the broker's
//! topic registry with announcements on a shared broadcast topic so that producers which
//! appear later are picked up dynamically.
//!
//! The second mode of operation is request and response. A [request](Service::request) carries
//! the response topic of the requesting instance and a correlation id. Any service handling the
//! request may reply with one or more responses built by [`Service::new_response`]. These are
//! routed back through the response topic, matched by their correlation id and handed to the
//! handler registered for the request, which keeps receiving them until it returns.
//!
//! All mutable routing state of an instance is owned by a single actor task; every other
//! component talks to it through message passing. The actual transport is abstracted by the
//! [`Broker`](broker::Broker) trait with an [in-memory](implementation::memory) and a
//! [Redis](implementation::redis) implementation.

mod actor;
mod error;
mod message;
mod router;
mod service;
mod supervisor;
mod topic;

pub mod broker;
pub mod discovery;
pub mod implementation;

pub use actor::ResponseStream;
pub use discovery::Consumer;
pub use error::*;
pub use message::*;
pub use service::{RequestHandle, Service};
pub use supervisor::{Fault, ServiceEvent};
pub use topic::*;
