//! Ordered header collection
//!
//! Headers are stored as name/value pairs in wire order. Lookup is
//! case-insensitive; compact forms are expanded at parse time so the map
//! only ever holds canonical names.

/// Ordered, case-insensitive header multimap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    /// Append a header, keeping wire order
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for the name, if any
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for the name, in order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace all values of the name with a single value
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.push(name, value);
    }

    /// Insert at the front (used for Via on forwarding paths)
    pub fn push_front(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(0, (name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Expand RFC 3261 compact header names to canonical form
pub fn canonical_name(name: &str) -> &str {
    match name {
        "v" | "V" => "Via",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "i" | "I" => "Call-ID",
        "m" | "M" => "Contact",
        "e" | "E" => "Content-Encoding",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "k" | "K" => "Supported",
        "s" | "S" => "Subject",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = Headers::new();
        h.push("Call-ID", "abc@host");
        assert_eq!(h.get("call-id"), Some("abc@host"));
        assert_eq!(h.get("CALL-ID"), Some("abc@host"));
    }

    #[test]
    fn multi_value_order_preserved() {
        let mut h = Headers::new();
        h.push("Route", "<sip:p1.test;lr>");
        h.push("Route", "<sip:p2.test;lr>");
        let routes: Vec<_> = h.get_all("Route").collect();
        assert_eq!(routes, vec!["<sip:p1.test;lr>", "<sip:p2.test;lr>"]);
    }

    #[test]
    fn compact_names_expand() {
        assert_eq!(canonical_name("v"), "Via");
        assert_eq!(canonical_name("i"), "Call-ID");
        assert_eq!(canonical_name("X-Custom"), "X-Custom");
    }
}
