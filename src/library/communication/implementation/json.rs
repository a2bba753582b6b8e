//! Envelope serialization provided by [`serde_json`] using a marker trait
//!
//! Every instance of a colony has to agree on the byte encoding of envelopes, there is no
//! external compatibility requirement. Types implementing the [`JsonEnvelope`] marker trait get
//! symmetric [`to_bytes`](Envelope::to_bytes) and [`from_bytes`](Envelope::from_bytes)
//! implementations. Exchanging the serialization algorithm only requires another marker trait.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors occurring while converting envelopes to or from their wire format
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Envelope could not be serialized
    #[error("failed to encode envelope")]
    Encode(#[source] serde_json::Error),
    /// Raw payload is not a valid envelope
    #[error("failed to decode envelope")]
    Decode(#[source] serde_json::Error),
}

/// Unit of data which travels across the broker
pub trait Envelope: Sized {
    /// Converts the envelope into its wire format
    fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError>;

    /// Parses the wire format
    fn from_bytes(data: &[u8]) -> Result<Self, EnvelopeError>;
}

/// Marker trait providing a default [`Envelope`] implementation based on [`serde_json`]
pub trait JsonEnvelope: Serialize + DeserializeOwned {}

impl<E> Envelope for E
where
    E: JsonEnvelope,
{
    /// Serializes the envelope using [`serde_json::to_vec`]
    fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    /// Parses the envelope using [`serde_json::from_slice`]
    fn from_bytes(data: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(data).map_err(EnvelopeError::Decode)
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Sample {
        answer: usize,
    }

    impl JsonEnvelope for Sample {}

    #[test]
    fn decode_what_was_encoded() {
        let sample = Sample { answer: 42 };
        let bytes = sample.to_bytes().unwrap();

        assert_eq!(bytes, br#"{"answer":42}"#.to_vec());
        assert_eq!(Sample::from_bytes(&bytes).unwrap(), sample);
    }

    #[test]
    fn reject_garbage() {
        assert!(matches!(
            Sample::from_bytes(b"definitely not json"),
            Err(EnvelopeError::Decode(_))
        ));
    }
}
