//! Evaluation contexts.
//!
//! A context is the identity/attribute bundle that a flag evaluation or an
//! analytics event pertains to. It is either a single context of one kind, or
//! a multi-context holding one single context per kind.
//!
//! Contexts built with [`ContextBuilder`] / [`MultiContextBuilder`] are
//! validated up front. Contexts decoded from JSON are only checked
//! structurally; call [`Context::validate`] before trusting them.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::reference::Reference;

/// Errors describing a malformed context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("invalid context kind: {0:?}")]
    InvalidKind(String),

    #[error("context key must not be empty")]
    EmptyKey,

    #[error("context attribute \"name\" must be a string")]
    NameNotString,

    #[error("multi-context must contain at least one context")]
    EmptyMulti,

    #[error("multi-context contains kind {0:?} more than once")]
    DuplicateKind(String),

    #[error("multi-context cannot contain another multi-context")]
    NestedMulti,

    #[error("malformed context JSON: {0}")]
    Malformed(String),
}

const MULTI_KIND: &str = "multi";
const DEFAULT_KIND: &str = "user";

/// The kind of a single context (`user`, `org`, `device`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Kind(String);

impl Kind {
    /// The default kind.
    pub fn user() -> Self {
        Self(DEFAULT_KIND.to_string())
    }

    fn multi() -> Self {
        Self(MULTI_KIND.to_string())
    }

    /// Parse and validate a kind name.
    pub fn parse(kind: &str) -> Result<Self, ContextError> {
        let kind = Self(kind.to_string());
        kind.validate()?;
        Ok(kind)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_user(&self) -> bool {
        self.0 == DEFAULT_KIND
    }

    pub fn is_multi(&self) -> bool {
        self.0 == MULTI_KIND
    }

    fn validate(&self) -> Result<(), ContextError> {
        let valid_chars = self
            .0
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if self.0.is_empty() || !valid_chars || self.0 == "kind" || self.0 == MULTI_KIND {
            return Err(ContextError::InvalidKind(self.0.clone()));
        }
        Ok(())
    }
}

impl Default for Kind {
    fn default() -> Self {
        Self::user()
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Kind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// An evaluation context.
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    kind: Kind,
    key: String,
    anonymous: bool,
    /// Optional attributes, `name` included. Sorted by attribute name.
    attributes: BTreeMap<String, Value>,
    private_attributes: Vec<Reference>,
    /// Sub-contexts of a multi-context, sorted by kind. Empty for a single context.
    contexts: Vec<Context>,
}

impl Context {
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// The context key. Empty for a multi-context.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn is_multi(&self) -> bool {
        self.kind.is_multi()
    }

    /// Names of the optional attributes, in enumeration order.
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// Value of an optional attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Private attribute references declared on this context.
    pub fn private_attributes(&self) -> &[Reference] {
        &self.private_attributes
    }

    /// The single contexts making up this context: the sub-contexts of a
    /// multi-context, or the context itself.
    pub fn contexts(&self) -> Vec<&Context> {
        if self.is_multi() {
            self.contexts.iter().collect()
        } else {
            vec![self]
        }
    }

    /// Every kind present.
    pub fn kinds(&self) -> Vec<&Kind> {
        self.contexts().into_iter().map(|c| &c.kind).collect()
    }

    /// The single context of the given kind, if present.
    pub fn as_kind(&self, kind: &Kind) -> Option<&Context> {
        self.contexts().into_iter().find(|c| &c.kind == kind)
    }

    /// Map of kind to key for every single context.
    pub fn context_keys(&self) -> BTreeMap<String, String> {
        self.contexts()
            .into_iter()
            .map(|c| (c.kind.to_string(), c.key.clone()))
            .collect()
    }

    /// A string that uniquely identifies this context's kinds and keys.
    ///
    /// A plain user context is identified by its key alone; every other
    /// context uses `kind:key` pairs with `%` and `:` escaped in the key.
    pub fn canonical_key(&self) -> String {
        if !self.is_multi() && self.kind.is_user() {
            return self.key.clone();
        }
        self.contexts()
            .into_iter()
            .map(|c| format!("{}:{}", c.kind, escape_key(&c.key)))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Look up a value by reference. Built-in attributes (`kind`, `key`,
    /// `anonymous`) are addressable; nested properties are reached through
    /// object values only.
    pub fn get_value(&self, reference: &Reference) -> Option<Value> {
        let (first, rest) = reference.components().split_first()?;
        if self.is_multi() {
            return (first == "kind" && rest.is_empty()).then(|| Value::from(MULTI_KIND));
        }
        let mut current = match first.as_str() {
            "kind" => return rest.is_empty().then(|| Value::from(self.kind.as_str())),
            "key" => return rest.is_empty().then(|| Value::from(self.key.as_str())),
            "anonymous" => return rest.is_empty().then_some(Value::Bool(self.anonymous)),
            name => self.attributes.get(name)?,
        };
        for component in rest {
            current = current.as_object()?.get(component)?;
        }
        Some(current.clone())
    }

    /// Check the context for structural validity.
    pub fn validate(&self) -> Result<(), ContextError> {
        if !self.is_multi() {
            return self.validate_single();
        }
        if self.contexts.is_empty() {
            return Err(ContextError::EmptyMulti);
        }
        let mut seen = HashSet::new();
        for context in &self.contexts {
            if context.is_multi() {
                return Err(ContextError::NestedMulti);
            }
            if !seen.insert(context.kind.as_str()) {
                return Err(ContextError::DuplicateKind(context.kind.to_string()));
            }
            context.validate_single()?;
        }
        Ok(())
    }

    fn validate_single(&self) -> Result<(), ContextError> {
        self.kind.validate()?;
        if self.key.is_empty() {
            return Err(ContextError::EmptyKey);
        }
        if let Some(name) = self.attributes.get("name")
            && !name.is_string()
        {
            return Err(ContextError::NameNotString);
        }
        Ok(())
    }

    /// Returns the context with anonymous single contexts removed, or `None`
    /// if nothing remains.
    pub fn without_anonymous_contexts(&self) -> Option<Context> {
        let remaining: Vec<Context> = self
            .contexts()
            .into_iter()
            .filter(|c| !c.anonymous)
            .cloned()
            .collect();
        match remaining.len() {
            0 => None,
            1 => remaining.into_iter().next(),
            _ if !self.is_multi() => Some(self.clone()),
            _ => Some(Self::multi_from(remaining)),
        }
    }

    /// Decode a context from its wire JSON shape.
    ///
    /// Only the shape is checked here; key and kind rules are enforced by
    /// [`Context::validate`].
    pub fn from_json(value: Value) -> Result<Self, ContextError> {
        let Value::Object(map) = value else {
            return Err(ContextError::Malformed("context must be a JSON object".into()));
        };
        let kind = match map.get("kind") {
            Some(Value::String(kind)) => kind.clone(),
            Some(_) => return Err(ContextError::Malformed("\"kind\" must be a string".into())),
            None => DEFAULT_KIND.to_string(),
        };
        if kind != MULTI_KIND {
            return Self::single_from_json(Kind(kind), map);
        }

        let mut contexts = Vec::new();
        for (kind, value) in map {
            if kind == "kind" {
                continue;
            }
            let Value::Object(sub) = value else {
                return Err(ContextError::Malformed(format!(
                    "multi-context entry {kind:?} must be an object"
                )));
            };
            contexts.push(Self::single_from_json(Kind(kind), sub)?);
        }
        Ok(Self::multi_from(contexts))
    }

    fn single_from_json(kind: Kind, map: Map<String, Value>) -> Result<Self, ContextError> {
        let mut context = Context {
            kind,
            key: String::new(),
            anonymous: false,
            attributes: BTreeMap::new(),
            private_attributes: Vec::new(),
            contexts: Vec::new(),
        };
        for (name, value) in map {
            match name.as_str() {
                "kind" => {}
                "key" => {
                    context.key = value
                        .as_str()
                        .ok_or_else(|| ContextError::Malformed("\"key\" must be a string".into()))?
                        .to_string();
                }
                "anonymous" => {
                    context.anonymous = value.as_bool().ok_or_else(|| {
                        ContextError::Malformed("\"anonymous\" must be a boolean".into())
                    })?;
                }
                "_meta" => {
                    if let Some(refs) = value.get("privateAttributes").and_then(Value::as_array) {
                        for raw in refs {
                            let raw = raw.as_str().ok_or_else(|| {
                                ContextError::Malformed("private attributes must be strings".into())
                            })?;
                            let reference = Reference::parse(raw)
                                .map_err(|e| ContextError::Malformed(e.to_string()))?;
                            context.private_attributes.push(reference);
                        }
                    }
                }
                _ => {
                    if !value.is_null() {
                        context.attributes.insert(name, value);
                    }
                }
            }
        }
        Ok(context)
    }

    fn multi_from(mut contexts: Vec<Context>) -> Self {
        contexts.sort_by(|a, b| a.kind.cmp(&b.kind));
        Context {
            kind: Kind::multi(),
            key: String::new(),
            anonymous: false,
            attributes: BTreeMap::new(),
            private_attributes: Vec::new(),
            contexts,
        }
    }
}

impl<'de> Deserialize<'de> for Context {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Context::from_json(value).map_err(serde::de::Error::custom)
    }
}

fn escape_key(key: &str) -> String {
    key.replace('%', "%25").replace(':', "%3A")
}

/// Builder for a single context.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    kind: String,
    key: String,
    anonymous: bool,
    attributes: BTreeMap<String, Value>,
    private_attributes: Vec<Reference>,
}

impl ContextBuilder {
    /// Start a `user` context with the given key.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            kind: DEFAULT_KIND.to_string(),
            key: key.into(),
            anonymous: false,
            attributes: BTreeMap::new(),
            private_attributes: Vec::new(),
        }
    }

    pub fn kind(&mut self, kind: impl Into<String>) -> &mut Self {
        self.kind = kind.into();
        self
    }

    pub fn key(&mut self, key: impl Into<String>) -> &mut Self {
        self.key = key.into();
        self
    }

    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.attributes
            .insert("name".to_string(), Value::String(name.into()));
        self
    }

    pub fn anonymous(&mut self, anonymous: bool) -> &mut Self {
        self.anonymous = anonymous;
        self
    }

    /// Set an optional attribute. `kind`, `key`, `anonymous` and `_meta` are
    /// reserved and handled like their dedicated setters (or ignored); a null
    /// value removes the attribute.
    pub fn set_value(&mut self, name: &str, value: Value) -> &mut Self {
        match (name, value) {
            ("kind", Value::String(kind)) => self.kind = kind,
            ("key", Value::String(key)) => self.key = key,
            ("anonymous", Value::Bool(anonymous)) => self.anonymous = anonymous,
            ("kind" | "key" | "anonymous" | "_meta", _) => {}
            (_, Value::Null) => {
                self.attributes.remove(name);
            }
            (_, value) => {
                self.attributes.insert(name.to_string(), value);
            }
        }
        self
    }

    pub fn add_private_attribute(&mut self, reference: Reference) -> &mut Self {
        self.private_attributes.push(reference);
        self
    }

    pub fn build(&self) -> Result<Context, ContextError> {
        let context = Context {
            kind: Kind(self.kind.clone()),
            key: self.key.clone(),
            anonymous: self.anonymous,
            attributes: self.attributes.clone(),
            private_attributes: self.private_attributes.clone(),
            contexts: Vec::new(),
        };
        context.validate()?;
        Ok(context)
    }
}

/// Builder for a multi-context.
#[derive(Debug, Clone, Default)]
pub struct MultiContextBuilder {
    contexts: Vec<Context>,
}

impl MultiContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a context. The sub-contexts of a multi-context are added individually.
    pub fn add_context(&mut self, context: Context) -> &mut Self {
        if context.is_multi() {
            self.contexts.extend(context.contexts);
        } else {
            self.contexts.push(context);
        }
        self
    }

    /// Build the multi-context. A single added context is returned as-is.
    pub fn build(&self) -> Result<Context, ContextError> {
        match self.contexts.as_slice() {
            [] => Err(ContextError::EmptyMulti),
            [only] => Ok(only.clone()),
            _ => {
                let context = Context::multi_from(self.contexts.clone());
                context.validate()?;
                Ok(context)
            }
        }
    }
}
