//! Payload converters between typed payloads and wire bytes.

use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use thiserror::Error;

/// Conversion failure in either direction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),
}

/// Converts a payload type to and from the bytes carried by the broker.
pub trait PayloadConverter<T>: Send + Sync {
    fn to_wire(&self, payload: &T) -> Result<Vec<u8>, ConversionError>;

    fn from_wire(&self, bytes: &[u8]) -> Result<T, ConversionError>;
}

/// JSON converter backed by serde. Unknown fields are ignored on decode.
pub struct JsonConverter<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonConverter<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonConverter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonConverter<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonConverter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonConverter")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> PayloadConverter<T> for JsonConverter<T>
where
    T: Serialize + DeserializeOwned,
{
    fn to_wire(&self, payload: &T) -> Result<Vec<u8>, ConversionError> {
        serde_json::to_vec(payload).map_err(|e| ConversionError::Encode(e.to_string()))
    }

    fn from_wire(&self, bytes: &[u8]) -> Result<T, ConversionError> {
        serde_json::from_slice(bytes).map_err(|e| ConversionError::Decode(e.to_string()))
    }
}

/// UTF-8 text payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringConverter;

impl PayloadConverter<String> for StringConverter {
    fn to_wire(&self, payload: &String) -> Result<Vec<u8>, ConversionError> {
        Ok(payload.as_bytes().to_vec())
    }

    fn from_wire(&self, bytes: &[u8]) -> Result<String, ConversionError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| ConversionError::Decode(e.to_string()))
    }
}

/// Pass-through for raw byte payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesConverter;

impl PayloadConverter<Vec<u8>> for BytesConverter {
    fn to_wire(&self, payload: &Vec<u8>) -> Result<Vec<u8>, ConversionError> {
        Ok(payload.clone())
    }

    fn from_wire(&self, bytes: &[u8]) -> Result<Vec<u8>, ConversionError> {
        Ok(bytes.to_vec())
    }
}
