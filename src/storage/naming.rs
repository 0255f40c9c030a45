//! Display names and content keys
//!
//! A display name is made unique within the owner's namespace before the
//! content key is derived from it, so two live records can never share a key.

use crate::identity::UserId;

use std::collections::HashSet;
use uuid::Uuid;

/// Namespace of the name-based UUIDs used as content keys
pub const CONTENT_KEY_NAMESPACE: Uuid = Uuid::from_u128(0x3f2c_91d4_7a0e_4b6c_8e15_c2d9_5a47_b810);

/// Name given to uploads that arrive without one
const DEFAULT_NAME: &str = "file";

/// Outcome of name resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    pub display_name: String,
    pub content_key: String,
}

/// Split a name into base and extension at the last dot.
///
/// A leading dot does not start an extension, so `.env` has base `.env`.
pub fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(index) if index > 0 => name.split_at(index),
        _ => (name, ""),
    }
}

/// Derive the on-disk name of `display_name` for `owner_id`
pub fn content_key(owner_id: UserId, display_name: &str) -> String {
    let seed = format!("{}-{}", owner_id, display_name);
    Uuid::new_v5(&CONTENT_KEY_NAMESPACE, seed.as_bytes())
        .hyphenated()
        .to_string()
}

/// Resolve the requested name against the owner's live display names
pub fn resolve_name<I, S>(owner_id: UserId, requested: Option<&str>, live_names: I) -> ResolvedName
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let requested = sanitize(requested);
    let (base, extension) = split_name(&requested);

    let taken: HashSet<String> = live_names
        .into_iter()
        .map(|name| split_name(name.as_ref()).0.to_string())
        .collect();

    let mut candidate = base.to_string();
    let mut counter = 0u64;
    while taken.contains(&candidate) {
        counter += 1;
        candidate = format!("{}({})", base, counter);
    }

    let display_name = format!("{}{}", candidate, extension);
    let content_key = content_key(owner_id, &display_name);

    ResolvedName {
        display_name,
        content_key,
    }
}

/// Keep only the last path component; blank names become [`DEFAULT_NAME`]
fn sanitize(requested: Option<&str>) -> String {
    let name = requested
        .map(|name| name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(name))
        .unwrap_or_default();

    if name.trim().is_empty() {
        DEFAULT_NAME.to_string()
    } else {
        name.to_string()
    }
}
