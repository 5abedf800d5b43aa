//! Out-of-band call metadata (headers and trailers).

use std::fmt;

use thiserror::Error;

/// Errors raised when mutating call metadata at the wrong point in the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    /// Header metadata has already been transmitted.
    #[error("header metadata already sent")]
    AlreadySent,
    /// The call has completed; its trailer can no longer change.
    #[error("call already completed")]
    CallCompleted,
}

/// String-keyed, multi-valued metadata.
///
/// Keys are opaque strings and keep their insertion order. Each key maps to
/// an ordered list of values.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, Vec<String>)>,
}

impl Metadata {
    /// Create an empty carrier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a carrier from key/value pairs, appending repeated keys.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut md = Self::new();
        for (key, value) in pairs {
            md.append(key, value);
        }
        md
    }

    /// Replace all values for `key` with `value`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.position(&key) {
            Some(idx) => self.entries[idx].1 = vec![value],
            None => self.entries.push((key, vec![value])),
        }
    }

    /// Add `value` to the values for `key`.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.position(&key) {
            Some(idx) => self.entries[idx].1.push(value),
            None => self.entries.push((key, vec![value])),
        }
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    /// All values for `key`, in insertion order.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.position(key)
            .map(|idx| self.entries[idx].1.as_slice())
            .unwrap_or(&[])
    }

    /// Remove `key`, returning its values.
    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.position(key).map(|idx| self.entries.remove(idx).1)
    }

    /// Append every value of `other` to this carrier.
    pub fn merge(&mut self, other: Metadata) {
        for (key, values) in other.entries {
            for value in values {
                self.append(key.clone(), value);
            }
        }
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Iterate over `(key, values)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no key is present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

/// Outgoing header slot: pending until transmitted, then frozen.
#[derive(Debug)]
pub(crate) enum HeaderSlot {
    Pending(Metadata),
    Sent,
}

impl HeaderSlot {
    pub(crate) fn merge(&mut self, md: Metadata) -> Result<(), MetadataError> {
        match self {
            HeaderSlot::Pending(pending) => {
                pending.merge(md);
                Ok(())
            }
            HeaderSlot::Sent => Err(MetadataError::AlreadySent),
        }
    }

    /// Mark the header as sent, returning what was pending.
    pub(crate) fn take(&mut self) -> Option<Metadata> {
        match std::mem::replace(self, HeaderSlot::Sent) {
            HeaderSlot::Pending(md) => Some(md),
            HeaderSlot::Sent => None,
        }
    }

    pub(crate) fn is_sent(&self) -> bool {
        matches!(self, HeaderSlot::Sent)
    }
}

/// Outgoing trailer slot: mutable until the call completes.
#[derive(Debug)]
pub(crate) enum TrailerSlot {
    Open(Metadata),
    Closed,
}

impl TrailerSlot {
    pub(crate) fn merge(&mut self, md: Metadata) -> Result<(), MetadataError> {
        match self {
            TrailerSlot::Open(trailer) => {
                trailer.merge(md);
                Ok(())
            }
            TrailerSlot::Closed => Err(MetadataError::CallCompleted),
        }
    }

    pub(crate) fn close(&mut self) -> Metadata {
        match std::mem::replace(self, TrailerSlot::Closed) {
            TrailerSlot::Open(md) => md,
            TrailerSlot::Closed => Metadata::new(),
        }
    }
}
