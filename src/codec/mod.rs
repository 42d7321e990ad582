//! Message codecs.
//!
//! Converts between wire representations (text or binary frames) and
//! application values.
//!
//! # Resolution Order
//!
//! | Step | Source |
//! |------|--------|
//! | 1 | Well-known wire types (`String`, `serde_json::Value`, `Bytes`, `Vec<u8>`) bypass codecs |
//! | 2 | A codec pinned by name |
//! | 3 | First registered codec whose `supports` accepts the type |
//! | 4 | [`JsonCodec`] for `serde` types |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `json` | `serde_json` backed fallback codec |
//! | `registry` | Codec traits and [`CodecRegistry`] |

// ============================================================================
// Submodules
// ============================================================================

/// JSON fallback codec.
pub mod json;

/// Codec traits and registry.
pub mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use json::JsonCodec;
pub use registry::{BinaryMessageCodec, CodecRegistry, TextMessageCodec};
