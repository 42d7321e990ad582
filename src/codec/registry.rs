//! Codec traits and the codec registry.
//!
//! Codecs are registered per Rust type under a unique name. Lookups first
//! bypass well-known wire types, then honour a pinned codec name, then scan
//! registered codecs in registration order, and finally fall back to
//! JSON through `serde_json`, the same encoding as [`JsonCodec`](super::JsonCodec).

// ============================================================================
// Imports
// ============================================================================

use std::any::{Any, TypeId, type_name};
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

// ============================================================================
// Codec Traits
// ============================================================================

/// Converts values of `T` to and from text messages.
pub trait TextMessageCodec<T>: Send + Sync + 'static {
    /// Encodes a value into a text message.
    fn encode(&self, value: &T) -> Result<String>;

    /// Decodes a text message into a value.
    fn decode(&self, text: &str) -> Result<T>;
}

/// Converts values of `T` to and from binary messages.
pub trait BinaryMessageCodec<T>: Send + Sync + 'static {
    /// Encodes a value into a binary message.
    fn encode(&self, value: &T) -> Result<Bytes>;

    /// Decodes a binary message into a value.
    fn decode(&self, data: &Bytes) -> Result<T>;
}

// ============================================================================
// Type Erasure
// ============================================================================

/// A registered codec with its type hidden.
trait ErasedCodec: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, type_id: TypeId) -> bool;

    fn as_any(&self) -> &dyn Any;
}

struct TypedTextCodec<T> {
    name: String,
    codec: Arc<dyn TextMessageCodec<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> ErasedCodec for TypedTextCodec<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, type_id: TypeId) -> bool {
        type_id == TypeId::of::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct TypedBinaryCodec<T> {
    name: String,
    codec: Arc<dyn BinaryMessageCodec<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> ErasedCodec for TypedBinaryCodec<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, type_id: TypeId) -> bool {
        type_id == TypeId::of::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Moves `value` into `T` when both are the same type.
fn cast<V: 'static, T: 'static>(value: V) -> Option<T> {
    let boxed: Box<dyn Any> = Box::new(value);
    boxed.downcast::<T>().ok().map(|t| *t)
}

// ============================================================================
// CodecRegistry
// ============================================================================

/// Resolves message codecs by Rust type.
///
/// Thread-safe; shared by every connection of a deployment.
#[derive(Default)]
pub struct CodecRegistry {
    text: RwLock<Vec<Arc<dyn ErasedCodec>>>,
    binary: RwLock<Vec<Arc<dyn ErasedCodec>>>,
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text: Vec<String> = self.text.read().iter().map(|c| c.name().to_owned()).collect();
        let binary: Vec<String> = self
            .binary
            .read()
            .iter()
            .map(|c| c.name().to_owned())
            .collect();
        f.debug_struct("CodecRegistry")
            .field("text", &text)
            .field("binary", &binary)
            .finish()
    }
}

// ============================================================================
// CodecRegistry - Registration
// ============================================================================

impl CodecRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a text codec for `T` under a unique name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the name is already taken.
    pub fn register_text<T, C>(&self, name: impl Into<String>, codec: C) -> Result<()>
    where
        T: 'static,
        C: TextMessageCodec<T>,
    {
        let name = name.into();
        let mut codecs = self.text.write();
        if codecs.iter().any(|c| c.name() == name) {
            return Err(Error::config(format!("Text codec already registered: {name}")));
        }
        debug!(codec = %name, ty = type_name::<T>(), "Text codec registered");
        codecs.push(Arc::new(TypedTextCodec::<T> {
            name,
            codec: Arc::new(codec),
            _marker: PhantomData,
        }));
        Ok(())
    }

    /// Registers a binary codec for `T` under a unique name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the name is already taken.
    pub fn register_binary<T, C>(&self, name: impl Into<String>, codec: C) -> Result<()>
    where
        T: 'static,
        C: BinaryMessageCodec<T>,
    {
        let name = name.into();
        let mut codecs = self.binary.write();
        if codecs.iter().any(|c| c.name() == name) {
            return Err(Error::config(format!(
                "Binary codec already registered: {name}"
            )));
        }
        debug!(codec = %name, ty = type_name::<T>(), "Binary codec registered");
        codecs.push(Arc::new(TypedBinaryCodec::<T> {
            name,
            codec: Arc::new(codec),
            _marker: PhantomData,
        }));
        Ok(())
    }

    /// Returns `true` if a registered text codec supports `T`.
    #[must_use]
    pub fn supports_text<T: 'static>(&self) -> bool {
        let id = TypeId::of::<T>();
        self.text.read().iter().any(|c| c.supports(id))
    }

    /// Returns `true` if a registered binary codec supports `T`.
    #[must_use]
    pub fn supports_binary<T: 'static>(&self) -> bool {
        let id = TypeId::of::<T>();
        self.binary.read().iter().any(|c| c.supports(id))
    }
}

// ============================================================================
// CodecRegistry - Lookup
// ============================================================================

impl CodecRegistry {
    fn text_codec<T: 'static>(
        &self,
        pinned: Option<&str>,
    ) -> std::result::Result<Option<Arc<dyn TextMessageCodec<T>>>, String> {
        let erased = select(&self.text.read(), pinned, TypeId::of::<T>())?;
        Ok(erased.and_then(|c| {
            c.as_any()
                .downcast_ref::<TypedTextCodec<T>>()
                .map(|typed| Arc::clone(&typed.codec))
        }))
    }

    fn binary_codec<T: 'static>(
        &self,
        pinned: Option<&str>,
    ) -> std::result::Result<Option<Arc<dyn BinaryMessageCodec<T>>>, String> {
        let erased = select(&self.binary.read(), pinned, TypeId::of::<T>())?;
        Ok(erased.and_then(|c| {
            c.as_any()
                .downcast_ref::<TypedBinaryCodec<T>>()
                .map(|typed| Arc::clone(&typed.codec))
        }))
    }
}

/// Picks the pinned codec, or the first supporting one.
fn select(
    codecs: &[Arc<dyn ErasedCodec>],
    pinned: Option<&str>,
    type_id: TypeId,
) -> std::result::Result<Option<Arc<dyn ErasedCodec>>, String> {
    match pinned {
        Some(name) => {
            let codec = codecs
                .iter()
                .find(|c| c.name() == name)
                .ok_or_else(|| format!("codec {name} is not registered"))?;
            if !codec.supports(type_id) {
                return Err(format!("codec {name} does not support this type"));
            }
            Ok(Some(Arc::clone(codec)))
        }
        None => Ok(codecs.iter().find(|c| c.supports(type_id)).cloned()),
    }
}

// ============================================================================
// CodecRegistry - Text
// ============================================================================

impl CodecRegistry {
    /// Encodes a value into a text message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TextEncode`] if the codec fails.
    pub fn encode_text<T>(&self, value: &T) -> Result<String>
    where
        T: Serialize + 'static,
    {
        self.encode_text_with(None, value)
    }

    /// Encodes a value into a text message with an optionally pinned codec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TextEncode`] if the pinned codec is unknown or does
    /// not support `T`, or if encoding fails.
    pub fn encode_text_with<T>(&self, codec: Option<&str>, value: &T) -> Result<String>
    where
        T: Serialize + 'static,
    {
        let any = value as &dyn Any;
        if let Some(text) = any.downcast_ref::<String>() {
            return Ok(text.clone());
        }
        if let Some(json) = any.downcast_ref::<Value>() {
            return Ok(json.to_string());
        }
        if let Some(data) = any.downcast_ref::<Bytes>() {
            return String::from_utf8(data.to_vec())
                .map_err(|e| Error::text_encode::<Bytes>(e.to_string()));
        }

        match self.text_codec::<T>(codec).map_err(|m| Error::text_encode::<T>(m))? {
            Some(codec) => codec.encode(value),
            None => serde_json::to_string(value).map_err(|e| Error::text_encode::<T>(e.to_string())),
        }
    }

    /// Decodes a text message into a value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TextDecode`] if the codec fails.
    pub fn decode_text<T>(&self, text: &str) -> Result<T>
    where
        T: DeserializeOwned + 'static,
    {
        self.decode_text_with(None, text)
    }

    /// Decodes a text message with an optionally pinned codec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TextDecode`] if the pinned codec is unknown or does
    /// not support `T`, or if decoding fails.
    pub fn decode_text_with<T>(&self, codec: Option<&str>, text: &str) -> Result<T>
    where
        T: DeserializeOwned + 'static,
    {
        if let Some(value) = cast::<String, T>(text.to_owned()) {
            return Ok(value);
        }
        if TypeId::of::<T>() == TypeId::of::<Value>() {
            return serde_json::from_str(text).map_err(|e| Error::text_decode::<T>(e.to_string()));
        }

        let codec = self
            .text_codec::<T>(codec)
            .map_err(|m| Error::text_decode::<T>(m))?;
        match codec {
            Some(codec) => codec.decode(text),
            None => serde_json::from_str(text).map_err(|e| Error::text_decode::<T>(e.to_string())),
        }
    }
}

// ============================================================================
// CodecRegistry - Binary
// ============================================================================

impl CodecRegistry {
    /// Encodes a value into a binary message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BinaryEncode`] if the codec fails.
    pub fn encode_binary<T>(&self, value: &T) -> Result<Bytes>
    where
        T: Serialize + 'static,
    {
        self.encode_binary_with(None, value)
    }

    /// Encodes a value into a binary message with an optionally pinned codec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BinaryEncode`] if the pinned codec is unknown or does
    /// not support `T`, or if encoding fails.
    pub fn encode_binary_with<T>(&self, codec: Option<&str>, value: &T) -> Result<Bytes>
    where
        T: Serialize + 'static,
    {
        let any = value as &dyn Any;
        if let Some(data) = any.downcast_ref::<Bytes>() {
            return Ok(data.clone());
        }
        if let Some(data) = any.downcast_ref::<Vec<u8>>() {
            return Ok(Bytes::from(data.clone()));
        }
        if let Some(text) = any.downcast_ref::<String>() {
            return Ok(Bytes::from(text.clone()));
        }
        if let Some(json) = any.downcast_ref::<Value>() {
            return Ok(Bytes::from(json.to_string()));
        }

        match self.binary_codec::<T>(codec).map_err(|m| Error::binary_encode::<T>(m))? {
            Some(codec) => codec.encode(value),
            None => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| Error::binary_encode::<T>(e.to_string())),
        }
    }

    /// Decodes a binary message into a value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BinaryDecode`] if the codec fails.
    pub fn decode_binary<T>(&self, data: &Bytes) -> Result<T>
    where
        T: DeserializeOwned + 'static,
    {
        self.decode_binary_with(None, data)
    }

    /// Decodes a binary message with an optionally pinned codec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BinaryDecode`] if the pinned codec is unknown or does
    /// not support `T`, or if decoding fails.
    pub fn decode_binary_with<T>(&self, codec: Option<&str>, data: &Bytes) -> Result<T>
    where
        T: DeserializeOwned + 'static,
    {
        if let Some(value) = cast::<Bytes, T>(data.clone()) {
            return Ok(value);
        }
        if let Some(value) = cast::<Vec<u8>, T>(data.to_vec()) {
            return Ok(value);
        }

        let codec = self
            .binary_codec::<T>(codec)
            .map_err(|m| Error::binary_decode::<T>(m))?;
        match codec {
            Some(codec) => codec.decode(data),
            None => {
                serde_json::from_slice(data).map_err(|e| Error::binary_decode::<T>(e.to_string()))
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde::Deserialize;

    use crate::codec::JsonCodec;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    /// Encodes points as `x;y`.
    struct PointCodec;

    impl TextMessageCodec<Point> for PointCodec {
        fn encode(&self, value: &Point) -> Result<String> {
            Ok(format!("{};{}", value.x, value.y))
        }

        fn decode(&self, text: &str) -> Result<Point> {
            let (x, y) = text
                .split_once(';')
                .ok_or_else(|| Error::text_decode::<Point>("missing separator"))?;
            let parse = |s: &str| {
                s.parse::<i32>()
                    .map_err(|e| Error::text_decode::<Point>(e.to_string()))
            };
            Ok(Point {
                x: parse(x)?,
                y: parse(y)?,
            })
        }
    }

    impl BinaryMessageCodec<Point> for PointCodec {
        fn encode(&self, value: &Point) -> Result<Bytes> {
            let mut out = Vec::with_capacity(8);
            out.extend_from_slice(&value.x.to_be_bytes());
            out.extend_from_slice(&value.y.to_be_bytes());
            Ok(Bytes::from(out))
        }

        fn decode(&self, data: &Bytes) -> Result<Point> {
            if data.len() != 8 {
                return Err(Error::binary_decode::<Point>("expected 8 bytes"));
            }
            let x = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            let y = i32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            Ok(Point { x, y })
        }
    }

    #[test]
    fn test_registered_text_codec_round_trip() {
        let registry = CodecRegistry::new();
        registry.register_text::<Point, _>("point", PointCodec).unwrap();
        assert!(registry.supports_text::<Point>());

        for point in [Point { x: 0, y: 0 }, Point { x: -7, y: 42 }] {
            let text = registry.encode_text(&point).unwrap();
            let decoded: Point = registry.decode_text(&text).unwrap();
            assert_eq!(decoded, point);
        }
        assert_eq!(registry.encode_text(&Point { x: 1, y: 2 }).unwrap(), "1;2");
    }

    #[test]
    fn test_registered_binary_codec_round_trip() {
        let registry = CodecRegistry::new();
        registry.register_binary::<Point, _>("point", PointCodec).unwrap();

        let point = Point { x: i32::MAX, y: i32::MIN };
        let data = registry.encode_binary(&point).unwrap();
        assert_eq!(data.len(), 8);
        assert_eq!(registry.decode_binary::<Point>(&data).unwrap(), point);
    }

    #[test]
    fn test_json_fallback_for_unregistered_type() {
        let registry = CodecRegistry::new();
        assert!(!registry.supports_text::<Point>());

        let text = registry.encode_text(&Point { x: 1, y: 2 }).unwrap();
        assert_eq!(text, r#"{"x":1,"y":2}"#);
        assert_eq!(
            registry.decode_text::<Point>(&text).unwrap(),
            Point { x: 1, y: 2 }
        );
    }

    #[test]
    fn test_wire_types_bypass_codecs() {
        let registry = CodecRegistry::new();
        assert_eq!(registry.encode_text(&String::from("raw")).unwrap(), "raw");
        assert_eq!(
            registry.encode_text(&serde_json::json!({"a": 1})).unwrap(),
            r#"{"a":1}"#
        );
        assert_eq!(
            registry.encode_text(&Bytes::from_static(b"buf")).unwrap(),
            "buf"
        );
        assert_eq!(registry.decode_text::<String>("raw").unwrap(), "raw");
        assert_eq!(
            registry.encode_binary(&vec![1u8, 2, 3]).unwrap(),
            Bytes::from_static(&[1, 2, 3])
        );
        assert_eq!(
            registry
                .decode_binary::<Bytes>(&Bytes::from_static(b"xy"))
                .unwrap(),
            Bytes::from_static(b"xy")
        );
    }

    #[test]
    fn test_pinned_codec() {
        let registry = CodecRegistry::new();
        registry.register_text::<Point, _>("point", PointCodec).unwrap();
        registry
            .register_text::<Point, _>("point-json", JsonCodec)
            .unwrap();

        let point = Point { x: 3, y: 4 };
        assert_eq!(registry.encode_text(&point).unwrap(), "3;4");
        assert_eq!(
            registry.encode_text_with(Some("point-json"), &point).unwrap(),
            r#"{"x":3,"y":4}"#
        );
    }

    #[test]
    fn test_pinned_codec_must_support_type() {
        let registry = CodecRegistry::new();
        registry.register_text::<Point, _>("point", PointCodec).unwrap();

        let err = registry.encode_text_with(Some("point"), &5u32).unwrap_err();
        assert!(matches!(err, Error::TextEncode { .. }));

        let err = registry
            .decode_text_with::<u32>(Some("missing"), "5")
            .unwrap_err();
        assert!(matches!(err, Error::TextDecode { .. }));
    }

    #[test]
    fn test_duplicate_codec_name_rejected() {
        let registry = CodecRegistry::new();
        registry.register_text::<Point, _>("point", PointCodec).unwrap();
        let err = registry
            .register_text::<Point, _>("point", PointCodec)
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_decode_failure_is_typed() {
        let registry = CodecRegistry::new();
        registry.register_text::<Point, _>("point", PointCodec).unwrap();
        let err = registry.decode_text::<Point>("nonsense").unwrap_err();
        assert!(matches!(err, Error::TextDecode { .. }));

        let err = registry
            .decode_binary::<Point>(&Bytes::from_static(b"{"))
            .unwrap_err();
        assert!(matches!(err, Error::BinaryDecode { .. }));
    }
}
