//! Call metadata (headers and trailers).
//!
//! Metadata is an ordered multimap of text keys to text values. Keys are
//! case-insensitive and stored lowercase; values keep insertion order.

use serde::{Deserialize, Serialize};

/// Inbound key whose values are echoed back as trailers.
pub const TRAILER_KEY: &str = "showcase-trailer";

/// Ordered, multi-valued metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under `key`, keeping any existing values.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let mut key = key.into();
        key.make_ascii_lowercase();
        self.entries.push((key, value.into()));
    }

    /// All values bound to `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

/// Copy every inbound `showcase-trailer` value into `trailers`.
///
/// One trailer entry per value, same key, order preserved. No-op when the
/// key is absent.
pub fn echo_trailers(inbound: &Metadata, trailers: &mut Metadata) {
    for value in inbound.get_all(TRAILER_KEY) {
        trailers.insert(TRAILER_KEY, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get_all() {
        let mut metadata = Metadata::new();
        assert!(metadata.is_empty());

        metadata.insert("X-Custom", "a");
        metadata.insert("other", "b");
        metadata.insert("x-custom", "c");

        assert_eq!(metadata.len(), 3);
        let values: Vec<_> = metadata.get_all("x-custom").collect();
        assert_eq!(values, vec!["a", "c"]);
        assert_eq!(metadata.get_all("missing").count(), 0);
    }

    #[test]
    fn test_echo_trailers_preserves_order() {
        let inbound: Metadata = [
            (TRAILER_KEY, "x"),
            ("unrelated", "ignored"),
            (TRAILER_KEY, "y"),
        ]
        .into_iter()
        .collect();

        let mut trailers = Metadata::new();
        echo_trailers(&inbound, &mut trailers);

        let entries: Vec<_> = trailers.iter().collect();
        assert_eq!(entries, vec![(TRAILER_KEY, "x"), (TRAILER_KEY, "y")]);
    }

    #[test]
    fn test_echo_trailers_without_key() {
        let inbound: Metadata = [("authorization", "token")].into_iter().collect();
        let mut trailers = Metadata::new();
        echo_trailers(&inbound, &mut trailers);
        assert!(trailers.is_empty());
    }

    #[test]
    fn test_wire_format_is_list_of_pairs() {
        let metadata: Metadata = [(TRAILER_KEY, "x")].into_iter().collect();
        let encoded = serde_json::to_value(&metadata).unwrap();
        assert_eq!(encoded, serde_json::json!([["showcase-trailer", "x"]]));

        let decoded: Metadata = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, metadata);
    }
}
