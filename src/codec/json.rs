//! JSON codec backed by `serde_json`.
//!
//! Used as the fallback when no registered codec supports a type, and
//! available for explicit registration under a custom name.

// ============================================================================
// Imports
// ============================================================================

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

use super::registry::{BinaryMessageCodec, TextMessageCodec};

// ============================================================================
// JsonCodec
// ============================================================================

/// Encodes values as JSON text or JSON bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonCodec;

impl<T> TextMessageCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<String> {
        serde_json::to_string(value).map_err(|e| Error::text_encode::<T>(e.to_string()))
    }

    fn decode(&self, text: &str) -> Result<T> {
        serde_json::from_str(text).map_err(|e| Error::text_decode::<T>(e.to_string()))
    }
}

impl<T> BinaryMessageCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| Error::binary_encode::<T>(e.to_string()))
    }

    fn decode(&self, data: &Bytes) -> Result<T> {
        serde_json::from_slice(data).map_err(|e| Error::binary_decode::<T>(e.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        name: String,
        count: u32,
    }

    #[test]
    fn test_text_round_trip() {
        let value = Greeting {
            name: "ana".into(),
            count: 3,
        };
        let text = TextMessageCodec::<Greeting>::encode(&JsonCodec, &value).unwrap();
        assert_eq!(text, r#"{"name":"ana","count":3}"#);
        let decoded: Greeting = TextMessageCodec::decode(&JsonCodec, &text).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_binary_decode_failure_is_typed() {
        let err = BinaryMessageCodec::<Greeting>::decode(&JsonCodec, &Bytes::from_static(b"[1]"))
            .unwrap_err();
        assert!(matches!(err, Error::BinaryDecode { .. }));
    }
}
