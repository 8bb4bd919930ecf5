//! Payload codecs for the message fabric

use manifold_core::{ManifoldError, ManifoldResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Encodes a typed payload to bytes and back. `decode(encode(x)) == x` must
/// hold for every value.
pub trait Codec<T> {
    fn encode(&self, value: &T) -> ManifoldResult<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> ManifoldResult<T>;
}

/// Compact binary codec, the fabric default
pub struct BincodeCodec<T>(PhantomData<fn() -> T>);

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        BincodeCodec(PhantomData)
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> for BincodeCodec<T> {
    fn encode(&self, value: &T) -> ManifoldResult<Vec<u8>> {
        bincode::serialize(value).map_err(|e| ManifoldError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> ManifoldResult<T> {
        bincode::deserialize(bytes).map_err(|e| ManifoldError::Codec(e.to_string()))
    }
}

/// JSON codec, handy when payloads should stay readable
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        JsonCodec(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec<T> {
    fn encode(&self, value: &T) -> ManifoldResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| ManifoldError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> ManifoldResult<T> {
        serde_json::from_slice(bytes).map_err(|e| ManifoldError::Codec(e.to_string()))
    }
}

/// Pass-through codec for payloads that already are bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec<Vec<u8>> for RawCodec {
    fn encode(&self, value: &Vec<u8>) -> ManifoldResult<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> ManifoldResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}
