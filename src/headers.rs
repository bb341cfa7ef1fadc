//! Case-insensitive, insertion-ordered header multimap.

use std::fmt;

/// A header multimap.
///
/// Field names are stored lowercased. Each occurrence of a field keeps its
/// own value; [`Headers::get`] returns the merged view joined with `", "`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, Vec<String>)>,
}

impl Headers {
    /// Create an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|(field, _)| field.eq_ignore_ascii_case(name))
    }

    /// Replace all values of `name` with `value`.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let name = name.as_ref();
        let value = value.into();
        match self.position(name) {
            Some(idx) => self.fields[idx].1 = vec![value],
            None => self.fields.push((name.to_ascii_lowercase(), vec![value])),
        }
    }

    /// Add a value to `name`, keeping the existing ones.
    pub fn append(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let name = name.as_ref();
        let value = value.into();
        match self.position(name) {
            Some(idx) => self.fields[idx].1.push(value),
            None => self.fields.push((name.to_ascii_lowercase(), vec![value])),
        }
    }

    /// The merged value of `name`, occurrences joined with `", "`.
    pub fn get(&self, name: &str) -> Option<String> {
        self.get_all(name).map(|values| values.join(", "))
    }

    /// The first value of `name`.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get_all(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// The last value of `name`.
    pub fn last(&self, name: &str) -> Option<&str> {
        self.get_all(name)
            .and_then(|values| values.last())
            .map(String::as_str)
    }

    /// Every value of `name`, in arrival order.
    pub fn get_all(&self, name: &str) -> Option<&[String]> {
        self.position(name).map(|idx| self.fields[idx].1.as_slice())
    }

    pub(crate) fn get_all_mut(&mut self, name: &str) -> Option<&mut Vec<String>> {
        match self.position(name) {
            Some(idx) => Some(&mut self.fields[idx].1),
            None => None,
        }
    }

    /// Whether `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Remove `name`, returning its values.
    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.position(name).map(|idx| self.fields.remove(idx).1)
    }

    /// Remove every field.
    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// The number of distinct field names.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over field names and their values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.fields
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Render a lowercased field name the way it goes on the wire: each word
/// capitalized, `www` as `WWW` and a bare `te` as `TE`.
pub(crate) fn canonical_name(name: &str) -> String {
    if name.eq_ignore_ascii_case("te") {
        return "TE".to_owned();
    }
    let mut out = String::with_capacity(name.len());
    for (i, word) in name.split('-').enumerate() {
        if i > 0 {
            out.push('-');
        }
        if word.get(..3).map_or(false, |w| w.eq_ignore_ascii_case("www")) {
            out.push_str("WWW");
            out.push_str(&word[3..]);
            continue;
        }
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

/// Whether a value would split the header block it is written into.
pub(crate) fn has_line_break(value: &str) -> bool {
    value.bytes().any(|b| b == b'\r' || b == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_multimap() {
        let mut headers = Headers::new();
        headers.append("Accept", "text/html");
        headers.append("ACCEPT", "text/plain");
        assert_eq!(headers.get("accept").as_deref(), Some("text/html, text/plain"));
        assert_eq!(headers.first("Accept"), Some("text/html"));
        assert_eq!(headers.last("Accept"), Some("text/plain"));

        headers.insert("accept", "*/*");
        assert_eq!(headers.get_all("Accept").unwrap(), ["*/*".to_owned()]);
        assert_eq!(headers.len(), 1);
        assert!(headers.remove("accept").is_some());
        assert!(headers.is_empty());
    }

    #[test]
    fn wire_names() {
        assert_eq!(canonical_name("content-length"), "Content-Length");
        assert_eq!(canonical_name("www-authenticate"), "WWW-Authenticate");
        assert_eq!(canonical_name("te"), "TE");
        assert_eq!(canonical_name("x-te-thing"), "X-Te-Thing");
        assert_eq!(canonical_name("etag"), "Etag");
    }
}
