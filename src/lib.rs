//! Lightweight microservice communication on top of a pub/sub message bus.
//!
//! Service instances of a colony advertise the content types they produce, discover
//! other instances producing a content type (even ones that only start publishing later),
//! exchange fire-and-forget messages and perform request/response exchanges where every
//! response is correlated back to its originating request.
//!
//! The crate is split into the project agnostic [`library`] which contains the routing and
//! discovery engine together with its broker implementations, and the [`options`] which
//! binaries may flatten into their own command line definition.

#![deny(missing_docs)]

pub mod library;
pub mod options;

pub use library::communication::{
    Consumer, CorrelationId, Message, RequestHandle, ResponseStream, Service, ServiceEvent,
    ServiceIdentity, Topic,
};
