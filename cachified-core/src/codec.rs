//! Text encoding for cached values.
//!
//! Durable backends store values as JSON text. Binary payloads (audio,
//! images, compiled bundles) are wrapped in [`Binary`], which serializes as a
//! tagged object `{"$binary": "<base64>"}` so the decoder never confuses them
//! with a plain JSON string or array of numbers.

use std::ops::Deref;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::{DeserializeOwned, Error as _};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CodecError;

/// Tag used for base64-encoded binary payloads.
pub const BINARY_TAG: &str = "$binary";

/// Byte payload that round-trips exactly through JSON text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Binary(pub Vec<u8>);

impl Binary {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Binary {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Binary {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Binary {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl Serialize for Binary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(BINARY_TAG, &STANDARD.encode(&self.0))?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Binary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Tagged {
            #[serde(rename = "$binary")]
            data: String,
        }

        let tagged = Tagged::deserialize(deserializer)?;
        STANDARD
            .decode(tagged.data.as_bytes())
            .map(Binary)
            .map_err(|e| D::Error::custom(format!("invalid base64 in {}: {}", BINARY_TAG, e)))
    }
}

/// Encode a value as JSON text for a durable record.
pub fn encode_value<T: Serialize>(value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|e| CodecError::Encode {
        reason: e.to_string(),
    })
}

/// Decode JSON text produced by [`encode_value`].
pub fn decode_value<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Decode {
        reason: e.to_string(),
    })
}
