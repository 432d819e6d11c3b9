//! A minimal client property list container.
//!
//! The wire-level proplist format used by `SET_CLIENT_NAME` and friends is
//! out of scope here beyond what `TagStruct` needs to encode/decode it; this
//! module is just the in-memory container the context carries.

use std::collections::BTreeMap;

/// How an update should be applied by `Context::proplist_update`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateMode {
    /// Add new entries, do not overwrite ones that already exist.
    Set,
    /// Add new entries, overwriting any that already exist.
    Merge,
    /// Replace the entire list with the given entries.
    Replace,
}

/// An ordered string-keyed property list.
///
/// Values are stored as raw bytes: most properties are UTF-8 text, but the
/// wire format allows arbitrary binary values, so `get_str` is a convenience
/// on top of the byte-oriented storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Proplist {
    entries: BTreeMap<String, Vec<u8>>,
}

impl Proplist {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    pub fn set(&mut self, key: &str, value: &[u8]) {
        self.entries.insert(key.to_owned(), value.to_owned());
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.set(key, value.as_bytes());
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(|v| v.as_slice())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply `other` to `self` according to `mode`.
    pub fn update(&mut self, mode: UpdateMode, other: &Proplist) {
        match mode {
            UpdateMode::Replace => {
                self.entries = other.entries.clone();
            }
            UpdateMode::Merge => {
                for (k, v) in other.entries.iter() {
                    self.entries.insert(k.clone(), v.clone());
                }
            }
            UpdateMode::Set => {
                for (k, v) in other.entries.iter() {
                    self.entries.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overwrites_set_does_not() {
        let mut base = Proplist::new();
        base.set_str("application.name", "old");

        let mut patch = Proplist::new();
        patch.set_str("application.name", "new");
        patch.set_str("application.version", "1.0");

        let mut set_target = base.clone();
        set_target.update(UpdateMode::Set, &patch);
        assert_eq!(set_target.get_str("application.name"), Some("old"));
        assert_eq!(set_target.get_str("application.version"), Some("1.0"));

        let mut merge_target = base.clone();
        merge_target.update(UpdateMode::Merge, &patch);
        assert_eq!(merge_target.get_str("application.name"), Some("new"));
    }

    #[test]
    fn replace_drops_unrelated_keys() {
        let mut base = Proplist::new();
        base.set_str("a", "1");
        base.set_str("b", "2");

        let mut patch = Proplist::new();
        patch.set_str("a", "9");

        base.update(UpdateMode::Replace, &patch);
        assert_eq!(base.len(), 1);
        assert_eq!(base.get_str("a"), Some("9"));
        assert_eq!(base.get_str("b"), None);
    }
}
