//! A record of dictionaries sharing one key-space across formats.
//!
//! [`MultiFormatContainer`] groups several dictionaries that point at the
//! same root (directory or bucket prefix) but differ in serialization
//! format, and therefore in file extension. Writing `("report",)` through
//! the `json` member and through the `txt` member produces two distinct
//! items living side by side; each member only ever sees items carrying its
//! own extension.
//!
//! The container itself is deliberately not a mapping: it has no `get` or
//! `set`, so addressing it like a dictionary is a compile error. Items are
//! reached through the per-format members.

use std::collections::BTreeMap;
use std::future::Future;

use cairn_core::Result;

/// Named per-format dictionaries over a shared key-space.
pub struct MultiFormatContainer<D> {
    subdicts: BTreeMap<String, D>,
}

impl<D> MultiFormatContainer<D> {
    /// Build one member per format name using the given constructor.
    ///
    /// The constructor receives each format name and returns the dictionary
    /// configured for it (same root, format-specific codec).
    pub async fn build<I, S, F, Fut>(formats: I, mut make: F) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<D>>,
    {
        let mut subdicts = BTreeMap::new();
        for format in formats {
            let format = format.into();
            let dict = make(format.clone()).await?;
            subdicts.insert(format, dict);
        }
        Ok(Self { subdicts })
    }

    /// The member for a format, if configured.
    pub fn by_format(&self, format: &str) -> Option<&D> {
        self.subdicts.get(format)
    }

    /// All configured format names.
    pub fn formats(&self) -> Vec<&str> {
        self.subdicts.keys().map(String::as_str).collect()
    }

    /// Number of configured members.
    pub fn len(&self) -> usize {
        self.subdicts.len()
    }

    /// Whether no members are configured.
    pub fn is_empty(&self) -> bool {
        self.subdicts.is_empty()
    }
}
