//! Cairn core types, traits, codecs, and errors.
//!
//! This crate provides the foundational building blocks for Cairn's
//! persistent dictionaries: the [`SafeKey`] key model, the tagged unions
//! used by the ETag-based conditional-operation protocol, the
//! [`PersiDict`] trait that every backend and wrapper implements, the
//! [`Codec`] contract for value serialization, and the unified error type.

pub mod codec;
pub mod dict;
pub mod error;
pub mod flags;
pub mod key;

pub use codec::{Codec, JsonCodec, MsgPackCodec, TextCodec};
pub use dict::{DictConfig, PersiDict, DEFAULT_TRANSFORM_RETRIES};
pub use error::CairnError;
pub use flags::{
    ConditionalOutcome, ETag, Retrieve, TagCondition, TagState, TransformOutcome, ValueInput,
    ValueState,
};
pub use key::SafeKey;

/// Convenience Result type using [`CairnError`].
pub type Result<T> = std::result::Result<T, CairnError>;
