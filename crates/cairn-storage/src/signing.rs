//! Digest suffixing for rendered key components.
//!
//! On case-insensitive but case-preserving filesystems (macOS HFS/APFS,
//! Windows NTFS), `Readme` and `readme` collide as filenames. To keep such
//! keys distinct, each rendered component gets a short deterministic digest
//! of its lowercase form appended: `<component>_<hex-digest-fragment>`.
//! Because the digest is computed from the lowercase text, equal-ignoring-
//! case components share a suffix while the preserved case of the stem
//! keeps the full names distinct.
//!
//! Suffixing is purely a name-mapping concern: keys inside the store never
//! carry the suffix, and listing strips it again. A filename whose suffix
//! does not verify is foreign and is ignored by the backend.

use sha2::{Digest, Sha256};

/// Hex digest of the lowercase component, truncated to `digest_len` chars.
fn digest_fragment(component: &str, digest_len: usize) -> String {
    let digest = Sha256::digest(component.to_lowercase().as_bytes());
    let full = hex::encode(digest);
    full[..digest_len.min(full.len())].to_string()
}

/// The suffix (including the `_` separator) for a component, or an empty
/// string when suffixing is disabled.
pub fn signature_suffix(component: &str, digest_len: usize) -> String {
    if digest_len == 0 {
        return String::new();
    }
    format!("_{}", digest_fragment(component, digest_len))
}

/// Append the digest suffix unless a correct one is already present.
pub fn sign_component(component: &str, digest_len: usize) -> String {
    if digest_len == 0 {
        return component.to_string();
    }
    if verified_stem(component, digest_len).is_some() {
        return component.to_string();
    }
    format!("{component}{}", signature_suffix(component, digest_len))
}

/// If `name` ends with a suffix that verifies against its stem, return the
/// stem.
fn verified_stem(name: &str, digest_len: usize) -> Option<&str> {
    if name.len() <= digest_len + 1 {
        return None;
    }
    let stem = &name[..name.len() - digest_len - 1];
    if name.ends_with(signature_suffix(stem, digest_len).as_str()) {
        Some(stem)
    } else {
        None
    }
}

/// Strip a verified digest suffix, recovering the original component.
///
/// With `digest_len == 0` the name passes through unchanged. Otherwise a
/// name without a verifying suffix is foreign and yields `None`.
pub fn unsign_component(name: &str, digest_len: usize) -> Option<String> {
    if digest_len == 0 {
        return Some(name.to_string());
    }
    verified_stem(name, digest_len).map(str::to_string)
}
