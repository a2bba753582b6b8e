//! Independent and project agnostic libraries
//!
//! Everything in here could be extracted into its own crate at any given time. The
//! [`communication`] module is the heart of the crate and contains the per-instance
//! coordinator, the discovery protocol and the broker implementations.

pub mod communication;

/// Generic error type
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result with no value and a [`BoxedError`]
pub type EmptyResult = Result<(), BoxedError>;
