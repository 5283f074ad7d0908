//! Ordered HTTP header fields.
//!
//! Field names compare case-insensitively (RFC 9110 §5.1). Order and
//! duplicates are kept exactly as received, since a cached response is
//! replayed field for field.

/// An ordered, multi-value list of header fields.
///
/// # Examples
///
/// ```
/// use rttp_cache::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("ETag", "\"v1\"");
/// headers.insert("If-None-Match", "\"a\", W/\"b\"");
/// headers.insert("If-None-Match", "\"c\"");
///
/// assert_eq!(headers.get("etag"), Some("\"v1\""));
/// let tags: Vec<_> = headers.list("if-none-match").collect();
/// assert_eq!(tags, vec!["\"a\"", "W/\"b\"", "\"c\""]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Appends a field; an existing field of the same name is kept.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).next()
    }

    /// Every value of `name`, one per field line.
    pub fn get_all<'a, 'b>(&'a self, name: &'b str) -> impl Iterator<Item = &'a str> + use<'a, 'b> {
        self.fields
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Elements of a comma-separated list field, across all of its lines.
    /// Elements are trimmed and empty ones skipped (RFC 9110 §5.6.1).
    pub fn list<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.get_all(name)
            .flat_map(|line| line.split(','))
            .map(str::trim)
            .filter(|element| !element.is_empty())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// A copy holding only the fields named in `names`, in their original order.
    pub fn select(&self, names: &[&str]) -> Headers {
        let fields = self
            .fields
            .iter()
            .filter(|(k, _)| names.iter().any(|n| k.eq_ignore_ascii_case(n)))
            .cloned()
            .collect();
        Headers { fields }
    }

    /// Number of field lines, not distinct names.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Bytes the fields take on the wire as `name: value\r\n` lines. This is
    /// what a stored response is charged for its headers.
    pub fn wire_size(&self) -> usize {
        self.fields.iter().map(|(k, v)| k.len() + v.len() + 4).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored() -> Headers {
        let mut h = Headers::new();
        h.insert("ETag", "\"v1\"");
        h.insert("Set-Cookie", "a=1");
        h.insert("Cache-Control", "public");
        h.insert("Set-Cookie", "b=2");
        h
    }

    #[test]
    fn names_compare_case_insensitively() {
        let h = stored();
        assert_eq!(h.get("etag"), Some("\"v1\""));
        assert_eq!(h.get("CACHE-CONTROL"), Some("public"));
        assert!(h.contains("set-cookie"));
        assert!(!h.contains("vary"));
    }

    #[test]
    fn duplicates_keep_their_order() {
        let h = stored();
        let cookies: Vec<_> = h.get_all("set-cookie").collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(h.len(), 4);
    }

    #[test]
    fn list_elements_span_lines_and_skip_empties() {
        let mut h = Headers::new();
        h.insert("If-None-Match", "\"a\", ,");
        h.insert("if-none-match", " W/\"b\" ");
        let tags: Vec<_> = h.list("If-None-Match").collect();
        assert_eq!(tags, vec!["\"a\"", "W/\"b\""]);

        let mut blank = Headers::new();
        blank.insert("If-None-Match", " , ");
        assert!(blank.contains("if-none-match"));
        assert_eq!(blank.list("if-none-match").count(), 0);
    }

    #[test]
    fn select_keeps_named_fields_in_order() {
        let kept = stored().select(&["cache-control", "etag"]);
        let names: Vec<_> = kept.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["ETag", "Cache-Control"]);
    }

    #[test]
    fn wire_size_counts_separators() {
        let mut h = Headers::new();
        h.insert("ETag", "\"v1\"");
        h.insert("Vary", "Accept");
        let wire: String = h.iter().map(|(k, v)| format!("{k}: {v}\r\n")).collect();
        assert_eq!(h.wire_size(), wire.len());
    }
}
