//! Whitespace word splitting shared by Expand and PagedExpand.

/// Split `text` on runs of whitespace.
///
/// Leading and trailing whitespace is ignored; empty or all-whitespace
/// input yields no words.
pub fn words(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}
