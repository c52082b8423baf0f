//! Hierarchical keys built from URL/filename-safe strings.
//!
//! A [`SafeKey`] is an immutable, non-empty sequence of components, each of
//! which is a non-empty string drawn from a restricted character set that is
//! safe to embed in filenames and object keys. The non-terminal components
//! form a directory-like namespace; the terminal component names the item.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CairnError;
use crate::Result;

/// Characters allowed in key components beyond ASCII letters and digits.
const SAFE_PUNCTUATION: &str = "()_-~.=";

/// Upper bound on component length, chosen to stay under common 255-byte
/// filesystem name limits even after a digest suffix is appended.
pub const MAX_COMPONENT_LEN: usize = 254;

/// Returns true if `s` is a valid key component.
///
/// A valid component is non-empty, at most [`MAX_COMPONENT_LEN`] bytes,
/// consists only of ASCII letters, digits, and `()_-~.=`, and is neither
/// `.` nor `..`.
pub fn is_safe_component(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_COMPONENT_LEN {
        return false;
    }
    if s == "." || s == ".." {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || SAFE_PUNCTUATION.contains(c))
}

/// An immutable, non-empty sequence of safe strings addressing one item.
///
/// Two keys are equal iff their component sequences are equal. Every
/// `SafeKey` handed out by a backend round-trips: re-passing it addresses
/// the same item.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SafeKey(Vec<String>);

impl SafeKey {
    /// Build a key from an ordered sequence of components.
    ///
    /// Every component must satisfy [`is_safe_component`]; the sequence must
    /// be non-empty.
    pub fn new<I, S>(components: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parts = Vec::new();
        for c in components {
            let c = c.as_ref();
            if !is_safe_component(c) {
                return Err(CairnError::InvalidKey {
                    message: format!("invalid key component: {c:?}"),
                });
            }
            parts.push(c.to_string());
        }
        if parts.is_empty() {
            return Err(CairnError::InvalidKey {
                message: "a key must have at least one component".to_string(),
            });
        }
        Ok(Self(parts))
    }

    /// Build a single-component key.
    pub fn single(component: impl AsRef<str>) -> Result<Self> {
        Self::new([component.as_ref()])
    }

    /// The ordered components of the key.
    pub fn components(&self) -> &[String] {
        &self.0
    }

    /// Number of components. Always at least one.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for symmetry with collection APIs.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The terminal component.
    pub fn leaf(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    /// All components before the terminal one.
    pub fn parents(&self) -> &[String] {
        &self.0[..self.0.len() - 1]
    }

    /// Concatenate `self` and `other` into a longer key.
    pub fn join(&self, other: &SafeKey) -> SafeKey {
        let mut parts = self.0.clone();
        parts.extend(other.0.iter().cloned());
        SafeKey(parts)
    }

    /// Append a single validated component.
    pub fn child(&self, component: impl AsRef<str>) -> Result<SafeKey> {
        let tail = SafeKey::single(component)?;
        Ok(self.join(&tail))
    }

    /// Whether this key starts with the given component prefix.
    pub fn starts_with(&self, prefix: &[String]) -> bool {
        self.0.len() >= prefix.len() && self.0[..prefix.len()] == *prefix
    }

    /// Remove a leading component prefix, returning the remainder.
    ///
    /// Returns `None` if the key does not start with `prefix` or nothing
    /// would remain after stripping.
    pub fn strip_prefix(&self, prefix: &[String]) -> Option<SafeKey> {
        if !self.starts_with(prefix) || self.0.len() == prefix.len() {
            return None;
        }
        Some(SafeKey(self.0[prefix.len()..].to_vec()))
    }
}

impl fmt::Display for SafeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl TryFrom<&str> for SafeKey {
    type Error = CairnError;

    fn try_from(s: &str) -> Result<Self> {
        SafeKey::single(s)
    }
}

impl TryFrom<Vec<String>> for SafeKey {
    type Error = CairnError;

    fn try_from(parts: Vec<String>) -> Result<Self> {
        SafeKey::new(parts)
    }
}

impl<const N: usize> TryFrom<[&str; N]> for SafeKey {
    type Error = CairnError;

    fn try_from(parts: [&str; N]) -> Result<Self> {
        SafeKey::new(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_components() {
        for c in ["a", "Hello", "file.txt", "x-y_z~1", "(v2)", "a=b", "0"] {
            assert!(is_safe_component(c), "{c:?} should be safe");
        }
    }

    #[test]
    fn test_invalid_components() {
        for c in ["", ".", "..", "a/b", "a\\b", "a b", "a\0b", "ключ", "a\tb"] {
            assert!(!is_safe_component(c), "{c:?} should be rejected");
        }
    }

    #[test]
    fn test_length_bound() {
        let ok = "x".repeat(MAX_COMPONENT_LEN);
        let too_long = "x".repeat(MAX_COMPONENT_LEN + 1);
        assert!(is_safe_component(&ok));
        assert!(!is_safe_component(&too_long));
    }

    #[test]
    fn test_empty_key_rejected() {
        let parts: [&str; 0] = [];
        assert!(SafeKey::new(parts).is_err());
    }

    #[test]
    fn test_equality_by_components() {
        let a = SafeKey::new(["users", "alice"]).unwrap();
        let b = SafeKey::new(["users", "alice"]).unwrap();
        let c = SafeKey::new(["users", "bob"]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_join_and_strip() {
        let prefix = SafeKey::single("users").unwrap();
        let tail = SafeKey::new(["alice", "name"]).unwrap();
        let full = prefix.join(&tail);
        assert_eq!(full.components(), &["users", "alice", "name"]);
        assert!(full.starts_with(prefix.components()));
        assert_eq!(full.strip_prefix(prefix.components()), Some(tail));
        assert_eq!(full.strip_prefix(full.components()), None);
    }

    #[test]
    fn test_leaf_and_parents() {
        let k = SafeKey::new(["a", "b", "c"]).unwrap();
        assert_eq!(k.leaf(), "c");
        assert_eq!(k.parents(), &["a", "b"]);
        assert_eq!(SafeKey::single("solo").unwrap().parents(), &[] as &[String]);
    }

    #[test]
    fn test_display() {
        let k = SafeKey::new(["a", "b"]).unwrap();
        assert_eq!(k.to_string(), "a/b");
    }

    #[test]
    fn test_round_trip_through_components() {
        let k = SafeKey::new(["config", "region=eu", "v1.json"]).unwrap();
        let again = SafeKey::new(k.components().to_vec()).unwrap();
        assert_eq!(k, again);
    }
}
