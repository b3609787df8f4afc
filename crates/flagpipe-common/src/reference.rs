//! Attribute references.
//!
//! A reference designates an attribute, or a property nested inside an
//! object-valued attribute, of an evaluation context.
//!
//! ## Syntax
//!
//! - A string that does not start with `/` is a single literal attribute name.
//!   `"address"` and `"a/b"` both name one top-level attribute.
//! - A string that starts with `/` is a path. Components are separated by `/`,
//!   and `~1` / `~0` encode a literal `/` / `~` inside a component:
//!   `"/address/street"` or `"/a~1b"` (the attribute literally named `a/b`).

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced when parsing an attribute reference.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("attribute reference is empty")]
    Empty,

    #[error("attribute reference contains an empty path component: {0:?}")]
    EmptyComponent(String),

    #[error("attribute reference has an invalid escape sequence: {0:?}")]
    InvalidEscape(String),
}

/// A parsed attribute reference.
///
/// Two references are equal iff their component sequences are equal, so
/// `"name"` and `"/name"` are the same reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    components: Vec<String>,
}

impl Reference {
    /// Parse a reference string.
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        if input.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let Some(path) = input.strip_prefix('/') else {
            return Ok(Self::literal(input));
        };

        if path.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let components = path
            .split('/')
            .map(|raw| {
                if raw.is_empty() {
                    return Err(ReferenceError::EmptyComponent(input.to_string()));
                }
                unescape(raw).ok_or_else(|| ReferenceError::InvalidEscape(input.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { components })
    }

    /// A reference to a top-level attribute, taking the name literally.
    pub fn literal(name: &str) -> Self {
        Self {
            components: vec![name.to_string()],
        }
    }

    /// A reference built from already-unescaped path components.
    pub fn from_components<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            components: components.into_iter().map(Into::into).collect(),
        }
    }

    /// Unescaped path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Number of path components.
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    /// The top-level attribute this reference starts at.
    pub fn first(&self) -> Option<&str> {
        self.components.first().map(String::as_str)
    }

    /// Returns a new reference with one more component appended.
    pub fn child(&self, component: &str) -> Self {
        let mut components = self.components.clone();
        components.push(component.to_string());
        Self { components }
    }
}

impl fmt::Display for Reference {
    /// Writes the escaped form. A single component without `/` or `~` is written
    /// bare; everything else uses the slash syntax, so parsing the output always
    /// yields the same components.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [only] = self.components.as_slice()
            && !only.contains(['/', '~'])
        {
            return f.write_str(only);
        }
        for component in &self.components {
            write!(f, "/{}", escape(component))?;
        }
        Ok(())
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Reference::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn escape(component: &str) -> String {
    component.replace('~', "~0").replace('/', "~1")
}

fn unescape(raw: &str) -> Option<String> {
    if !raw.contains('~') {
        return Some(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '~' {
            match chars.next() {
                Some('0') => out.push('~'),
                Some('1') => out.push('/'),
                _ => return None,
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literal() {
        let r = Reference::parse("address").unwrap();
        assert_eq!(r.components(), ["address"]);

        let r = Reference::parse("a/b").unwrap();
        assert_eq!(r.depth(), 1);
        assert_eq!(r.first(), Some("a/b"));
    }

    #[test]
    fn test_parse_path() {
        let r = Reference::parse("/address/street").unwrap();
        assert_eq!(r.components(), ["address", "street"]);
    }

    #[test]
    fn test_parse_escapes() {
        let r = Reference::parse("/a~1b/c~0d").unwrap();
        assert_eq!(r.components(), ["a/b", "c~d"]);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Reference::parse(""), Err(ReferenceError::Empty));
        assert_eq!(Reference::parse("/"), Err(ReferenceError::Empty));
        assert!(matches!(
            Reference::parse("/a//b"),
            Err(ReferenceError::EmptyComponent(_))
        ));
        assert!(matches!(
            Reference::parse("/a/"),
            Err(ReferenceError::EmptyComponent(_))
        ));
        assert!(matches!(
            Reference::parse("/a~2"),
            Err(ReferenceError::InvalidEscape(_))
        ));
        assert!(matches!(
            Reference::parse("/a~"),
            Err(ReferenceError::InvalidEscape(_))
        ));
    }

    #[test]
    fn test_literal_and_path_forms_are_equal() {
        assert_eq!(
            Reference::parse("name").unwrap(),
            Reference::parse("/name").unwrap()
        );
    }

    #[test]
    fn test_display_round_trip_for_literal_with_separator() {
        for name in ["a/b", "/leading", "tilde~x", "~1", "plain"] {
            let reference = Reference::literal(name);
            let escaped = reference.to_string();
            let reparsed = Reference::parse(&escaped).unwrap();
            assert_eq!(reparsed.components(), [name], "escaped form {escaped:?}");
        }
    }

    #[test]
    fn test_display_nested_path() {
        let r = Reference::from_components(["address", "a/b"]);
        assert_eq!(r.to_string(), "/address/a~1b");
        assert_eq!(Reference::literal("plain").to_string(), "plain");
    }

    #[test]
    fn test_child() {
        let r = Reference::literal("address").child("street");
        assert_eq!(r.components(), ["address", "street"]);
    }

    #[test]
    fn test_serde() {
        let r: Reference = serde_json::from_str("\"/a~1b\"").unwrap();
        assert_eq!(r.components(), ["a/b"]);
        assert_eq!(serde_json::to_string(&r).unwrap(), "\"/a~1b\"");
        assert!(serde_json::from_str::<Reference>("\"/\"").is_err());
    }
}
