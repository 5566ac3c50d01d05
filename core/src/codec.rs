//! Value codecs
//!
//! A codec turns store values into bytes and back. `decode` may be handed a
//! slice that points straight into mapped memory, so it must not keep the
//! borrow.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

use crate::error::{StoreError, StoreResult};

pub trait Codec: Send + Sync + Clone + 'static {
    type Value: Send + 'static;

    fn encode(&self, value: &Self::Value) -> StoreResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> StoreResult<Self::Value>;
}

/// Raw bytes in, raw bytes out
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    type Value = Vec<u8>;

    fn encode(&self, value: &Vec<u8>) -> StoreResult<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> StoreResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// UTF-8 strings
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec for StringCodec {
    type Value = String;

    fn encode(&self, value: &String) -> StoreResult<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> StoreResult<String> {
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| StoreError::Codec(format!("invalid UTF-8: {}", e)))
    }
}

/// Any serde type, stored as JSON
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
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

impl<T> Codec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Value = T;

    fn encode(&self, value: &T) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| StoreError::ValueTypeInvalid(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> StoreResult<T> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Codec(e.to_string()))
    }
}

/// Any serde type, stored with bincode
pub struct BincodeCodec<T>(PhantomData<fn() -> T>);

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
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

impl<T> Codec for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Value = T;

    fn encode(&self, value: &T) -> StoreResult<Vec<u8>> {
        bincode::serialize(value).map_err(|e| StoreError::ValueTypeInvalid(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> StoreResult<T> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Account {
        id: u64,
        owner: String,
        tags: Vec<String>,
    }

    #[test]
    fn test_string_codec_rejects_bad_utf8() {
        let codec = StringCodec;
        assert_eq!(codec.decode(b"hello").unwrap(), "hello");
        assert!(matches!(
            codec.decode(&[0xff, 0xfe]),
            Err(StoreError::Codec(_))
        ));
    }

    #[test]
    fn test_json_codec() {
        let codec = JsonCodec::<Account>::new();
        let account = Account {
            id: 7,
            owner: "ada".into(),
            tags: vec!["admin".into()],
        };
        let bytes = codec.encode(&account).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), account);
        assert!(codec.decode(b"{").is_err());
    }

    #[test]
    fn test_json_codec_rejects_unencodable_value() {
        // JSON object keys must be strings
        let codec = JsonCodec::<BTreeMap<Vec<u8>, u8>>::new();
        let mut map = BTreeMap::new();
        map.insert(vec![1u8], 1u8);
        assert!(matches!(
            codec.encode(&map),
            Err(StoreError::ValueTypeInvalid(_))
        ));
    }

    #[test]
    fn test_bincode_codec() {
        let codec = BincodeCodec::<Account>::new();
        let account = Account {
            id: 1,
            owner: "grace".into(),
            tags: vec![],
        };
        let bytes = codec.encode(&account).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), account);
    }
}
