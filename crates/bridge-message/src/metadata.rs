//! Bounded string-to-string metadata map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{MessageError, MessageResult};

/// Maximum number of metadata entries per message.
pub const MAX_METADATA_ENTRIES: usize = 1000;
/// Maximum length of a single metadata key, in bytes.
pub const MAX_METADATA_KEY_LEN: usize = 1024;
/// Maximum length of a single metadata value, in bytes.
pub const MAX_METADATA_VALUE_LEN: usize = 64 * 1024;
/// Maximum aggregate size of all keys and values, in bytes.
pub const MAX_METADATA_TOTAL_LEN: usize = 1024 * 1024;

/// An order-irrelevant mapping from string key to string value.
///
/// Keys are unique. Insertions and merges enforce the per-entry and
/// aggregate bounds; violations surface as
/// [`MessageError::MetadataLimit`]. Iteration order is deterministic
/// (sorted by key) so encoded output is reproducible, but readers MUST NOT
/// depend on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    /// Create an empty metadata map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look up a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// True when `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Insert a single entry, replacing any previous value for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::MetadataLimit`] when the entry or the
    /// resulting map exceeds a bound.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> MessageResult<()> {
        let key = key.into();
        let value = value.into();

        if key.len() > MAX_METADATA_KEY_LEN {
            return Err(MessageError::MetadataLimit {
                reason: format!("key length {} exceeds {MAX_METADATA_KEY_LEN}", key.len()),
            });
        }
        if value.len() > MAX_METADATA_VALUE_LEN {
            return Err(MessageError::MetadataLimit {
                reason: format!(
                    "value length {} exceeds {MAX_METADATA_VALUE_LEN}",
                    value.len()
                ),
            });
        }

        let replaced = self.0.get(&key).map_or(0, |v| key.len() + v.len());
        let added = key.len() + value.len();
        let total = self.total_len() - replaced + added;
        if total > MAX_METADATA_TOTAL_LEN {
            return Err(MessageError::MetadataLimit {
                reason: format!("aggregate size {total} exceeds {MAX_METADATA_TOTAL_LEN}"),
            });
        }
        if !self.0.contains_key(&key) && self.0.len() >= MAX_METADATA_ENTRIES {
            return Err(MessageError::MetadataLimit {
                reason: format!("entry count exceeds {MAX_METADATA_ENTRIES}"),
            });
        }

        self.0.insert(key, value);
        Ok(())
    }

    /// Merge all entries from `other` into this map. Entries from `other`
    /// win on key collision (last-write-wins).
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::MetadataLimit`] when a bound would be
    /// exceeded; entries merged before the failing one remain applied.
    pub fn merge(&mut self, other: &Metadata) -> MessageResult<()> {
        for (k, v) in &other.0 {
            self.insert(k.clone(), v.clone())?;
        }
        Ok(())
    }

    /// Iterate over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Build a metadata map from key/value pairs, enforcing all bounds.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::MetadataLimit`] when any bound is exceeded.
    pub fn try_from_pairs<K, V, I>(pairs: I) -> MessageResult<Self>
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut out = Self::new();
        for (k, v) in pairs {
            out.insert(k, v)?;
        }
        Ok(out)
    }

    fn total_len(&self) -> usize {
        self.0.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl<'a> IntoIterator for &'a Metadata {
    type Item = (&'a String, &'a String);
    type IntoIter = std::collections::btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
