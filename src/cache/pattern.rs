//! Key Pattern Module
//!
//! Literal or `*`-wildcard key matching for bulk invalidation.

use regex::Regex;

// == Key Pattern ==
/// A compiled key pattern.
///
/// `*` matches any run of characters (including none). A pattern without
/// `*` matches only the identical key.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    Literal(String),
    Glob(Regex),
}

impl KeyPattern {
    /// Compiles a pattern string.
    pub fn new(pattern: &str) -> Self {
        if !pattern.contains('*') {
            return KeyPattern::Literal(pattern.to_string());
        }

        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        match Regex::new(&format!("^{}$", body)) {
            Ok(re) => KeyPattern::Glob(re),
            // Every fragment is escaped, so this only fires on a regex size limit
            Err(_) => KeyPattern::Literal(pattern.to_string()),
        }
    }

    /// Returns true if `key` matches.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Literal(literal) => literal == key,
            KeyPattern::Glob(re) => re.is_match(key),
        }
    }
}
