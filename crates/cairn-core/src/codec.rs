//! Value codecs: how Rust values become stored bytes and back.
//!
//! Backends are unaware of codec internals; they hold an `Arc<dyn Codec<V>>`
//! and move [`Bytes`] across the boundary. The contract every codec must
//! uphold: `decode(encode(v)) == v` for all values the codec accepts, and a
//! stable file extension that doubles as the serialization-format label.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CairnError;
use crate::Result;

/// Encoding/decoding of stored values, plus the canonical file extension.
pub trait Codec<V>: Send + Sync {
    /// Encode a value into its stored representation.
    fn encode(&self, value: &V) -> Result<Bytes>;

    /// Decode a stored representation back into a value.
    fn decode(&self, bytes: &[u8]) -> Result<V>;

    /// The file extension (without the leading dot), also used as the
    /// serialization-format name.
    fn extension(&self) -> &str;
}

/// Compact binary codec via MessagePack. The default for arbitrary
/// serde-serializable values.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl<V> Codec<V> for MsgPackCodec
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, value: &V) -> Result<Bytes> {
        let data = rmp_serde::to_vec(value)
            .map_err(|e| CairnError::serialization("msgpack encode failed", e))?;
        Ok(Bytes::from(data))
    }

    fn decode(&self, bytes: &[u8]) -> Result<V> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| CairnError::serialization("msgpack decode failed", e))
    }

    fn extension(&self) -> &str {
        "mp"
    }
}

/// Human-readable JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<V> Codec<V> for JsonCodec
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, value: &V) -> Result<Bytes> {
        let data = serde_json::to_vec_pretty(value)
            .map_err(|e| CairnError::serialization("json encode failed", e))?;
        Ok(Bytes::from(data))
    }

    fn decode(&self, bytes: &[u8]) -> Result<V> {
        serde_json::from_slice(bytes)
            .map_err(|e| CairnError::serialization("json decode failed", e))
    }

    fn extension(&self) -> &str {
        "json"
    }
}

/// Plain-text codec for `String` values; the stored bytes are the UTF-8
/// text itself.
#[derive(Debug, Clone)]
pub struct TextCodec {
    extension: String,
}

impl TextCodec {
    /// Text codec with the default `txt` extension.
    pub fn new() -> Self {
        Self {
            extension: "txt".to_string(),
        }
    }

    /// Text codec with a caller-chosen extension.
    pub fn with_extension(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }
}

impl Default for TextCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec<String> for TextCodec {
    fn encode(&self, value: &String) -> Result<Bytes> {
        Ok(Bytes::from(value.clone().into_bytes()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| {
            CairnError::serialization("stored text is not valid UTF-8", e)
        })
    }

    fn extension(&self) -> &str {
        &self.extension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u64,
        tags: Vec<String>,
    }

    fn sample() -> Sample {
        Sample {
            name: "reading".to_string(),
            count: 42,
            tags: vec!["alpha".to_string(), "beta".to_string()],
        }
    }

    #[test]
    fn test_msgpack_identity() {
        let codec = MsgPackCodec;
        let value = sample();
        let encoded = codec.encode(&value).unwrap();
        let decoded: Sample = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(Codec::<Sample>::extension(&codec), "mp");
    }

    #[test]
    fn test_json_identity() {
        let codec = JsonCodec;
        let value = sample();
        let encoded = codec.encode(&value).unwrap();
        let decoded: Sample = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(Codec::<Sample>::extension(&codec), "json");
    }

    #[test]
    fn test_text_identity_and_extension() {
        let codec = TextCodec::with_extension("md");
        let value = "# heading\nbody".to_string();
        let encoded = codec.encode(&value).unwrap();
        assert_eq!(&encoded[..], value.as_bytes());
        assert_eq!(codec.decode(&encoded).unwrap(), value);
        assert_eq!(codec.extension(), "md");
    }

    #[test]
    fn test_json_decode_garbage_is_serialization_error() {
        let codec = JsonCodec;
        let err = Codec::<Sample>::decode(&codec, b"not json").unwrap_err();
        assert!(matches!(err, CairnError::Serialization { .. }));
    }
}
