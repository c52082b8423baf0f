//! Tagged unions for ETag slots, value slots, and conditional-operation
//! outcomes.
//!
//! Absence is represented uniformly: [`TagState::Absent`] in ETag position
//! and [`ValueState::Absent`] in value position both mean "no such key".
//! Jokers ([`ValueInput::KeepCurrent`], [`ValueInput::DeleteCurrent`]) are
//! value-less commands accepted anywhere a write takes a value.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque version string for a stored item.
///
/// An ETag is intended to change whenever the stored representation changes.
/// It is a weak identifier, not a cryptographic identity: treat inequality
/// as a hint that content changed, never as proof.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ETag(pub String);

impl ETag {
    /// Create an ETag from any string value.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Return the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ETag {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ETag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An ETag slot: either the tag of a present item, or absence.
///
/// Equality on `Absent` is reflexive, so "I expect the key to be absent"
/// matches an actually-absent key under [`TagCondition::MustMatch`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagState {
    /// The item exists and carries this ETag.
    Present(ETag),
    /// No such key.
    Absent,
}

impl TagState {
    /// True when the slot records absence.
    pub fn is_absent(&self) -> bool {
        matches!(self, TagState::Absent)
    }

    /// The tag, if present.
    pub fn as_etag(&self) -> Option<&ETag> {
        match self {
            TagState::Present(tag) => Some(tag),
            TagState::Absent => None,
        }
    }
}

impl From<ETag> for TagState {
    fn from(tag: ETag) -> Self {
        TagState::Present(tag)
    }
}

impl From<Option<ETag>> for TagState {
    fn from(tag: Option<ETag>) -> Self {
        match tag {
            Some(tag) => TagState::Present(tag),
            None => TagState::Absent,
        }
    }
}

/// A value-typed result slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueState<V> {
    /// The value as stored (or as just written).
    Value(V),
    /// No such key.
    Absent,
    /// The key exists but the value was not fetched.
    NotRetrieved,
}

impl<V> ValueState<V> {
    /// The carried value, if any.
    pub fn into_value(self) -> Option<V> {
        match self {
            ValueState::Value(v) => Some(v),
            _ => None,
        }
    }

    /// True when the slot records absence.
    pub fn is_absent(&self) -> bool {
        matches!(self, ValueState::Absent)
    }

    /// True when the value exists but was deliberately not fetched.
    pub fn is_not_retrieved(&self) -> bool {
        matches!(self, ValueState::NotRetrieved)
    }
}

/// A value-typed input slot: a real value or a joker command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueInput<V> {
    /// Write this value.
    Value(V),
    /// Keep whatever is currently stored; a no-op write.
    KeepCurrent,
    /// Delete the key if it exists.
    DeleteCurrent,
}

/// Condition evaluated against the current ETag at the instant a backend
/// checks it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagCondition {
    /// Satisfied unconditionally.
    Any,
    /// Satisfied iff the expected tag equals the actual tag.
    MustMatch,
    /// Satisfied iff the expected tag differs from the actual tag.
    MustDiffer,
}

impl TagCondition {
    /// Evaluate the condition for an expected/actual pair.
    pub fn satisfied_by(self, expected: &TagState, actual: &TagState) -> bool {
        match self {
            TagCondition::Any => true,
            TagCondition::MustMatch => expected == actual,
            TagCondition::MustDiffer => expected != actual,
        }
    }
}

/// Policy controlling whether the current value is fetched during a
/// conditional operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Retrieve {
    /// Always fetch the value when the key exists.
    Always,
    /// Fetch only when the actual ETag differs from the expected one.
    #[default]
    IfChanged,
    /// Never fetch; report [`ValueState::NotRetrieved`] for present keys.
    Never,
}

impl Retrieve {
    /// Whether a fetch should happen for an existing item, given the
    /// expected and actual tags.
    pub fn wants_fetch(self, expected: &TagState, actual: &TagState) -> bool {
        match self {
            Retrieve::Always => true,
            Retrieve::Never => false,
            Retrieve::IfChanged => expected != actual,
        }
    }
}

/// Result of a conditional operation guarded by an ETag check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionalOutcome<V> {
    /// Whether the ETag condition was met.
    pub satisfied: bool,
    /// ETag of the key before the operation.
    pub actual_etag: TagState,
    /// ETag after the operation completed.
    pub resulting_etag: TagState,
    /// The value after the operation, absence, or a skipped fetch.
    pub new_value: ValueState<V>,
}

impl<V> ConditionalOutcome<V> {
    /// Outcome for an absent key where nothing was written.
    pub fn absent(satisfied: bool) -> Self {
        Self {
            satisfied,
            actual_etag: TagState::Absent,
            resulting_etag: TagState::Absent,
            new_value: ValueState::Absent,
        }
    }

    /// Whether the operation changed the stored item.
    pub fn value_was_mutated(&self) -> bool {
        self.resulting_etag != self.actual_etag
    }
}

/// Result of an unconditional mutating operation (`transform_item`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransformOutcome<V> {
    /// ETag after the operation, or [`TagState::Absent`].
    pub resulting_etag: TagState,
    /// The value after the operation, or [`ValueState::Absent`].
    pub new_value: ValueState<V>,
}
