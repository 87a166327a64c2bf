//! Translates typed values into the bytes stored and shipped by the cache.
//!
//! Everything below the table boundary operates on opaque bytes; a [Codec] is the
//! single place where a table's value type is encoded and decoded. Tables default to
//! [JsonCodec], which covers every `serde`-enabled type. For tables whose values
//! already are strings or byte blobs, [StringCodec] and [BytesCodec] avoid the JSON
//! detour (and its quoting) entirely.
//!
//! Codecs must be loss free: decoding an encoded value yields the original value.
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::Error;

/// Encodes and decodes values of type `T`.
pub trait Codec<T>: Send + Sync + 'static {
    /// Encodes the given value into bytes.
    fn encode(&self, value: &T) -> Result<Vec<u8>, Error>;

    /// Decodes a value from the given bytes.
    fn decode(&self, bytes: &[u8]) -> Result<T, Error>;
}

/// The default codec: values are stored as their JSON representation.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        JsonCodec {
            _marker: PhantomData,
        }
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(value).map_err(Error::internal)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, Error> {
        serde_json::from_slice(bytes).map_err(Error::internal)
    }
}

/// Stores strings as their raw UTF-8 bytes.
#[derive(Default)]
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn encode(&self, value: &String) -> Result<Vec<u8>, Error> {
        Ok(value.clone().into_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, Error> {
        String::from_utf8(bytes.to_vec()).map_err(Error::internal)
    }
}

/// Stores byte vectors verbatim.
#[derive(Default)]
pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>, Error> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(bytes.to_vec())
    }
}
