//! Context serialization with private attribute redaction.
//!
//! Wire shape for a single context:
//!
//! ```text
//! {"kind": "user", "key": "u1", "name": "Ann", "anonymous": true,
//!  "_meta": {"redactedAttributes": ["email", "/address/street"]}}
//! ```
//!
//! A multi-context nests each single context under its kind and drops the
//! inner `kind` field: `{"kind": "multi", "org": {"key": "o1"}, "user": {...}}`.

use std::sync::Arc;

use serde_json::{Map, Value, json};

use flagpipe_common::{Context, ContextError, Reference};

use super::redaction::{AttributeRedactionIndex, Lookup};

/// Renders contexts into their redacted wire form.
#[derive(Debug, Clone)]
pub struct ContextFormatter {
    all_attributes_private: bool,
    global: Arc<AttributeRedactionIndex>,
}

impl ContextFormatter {
    pub fn new(all_attributes_private: bool, private_attributes: &[Reference]) -> Self {
        Self {
            all_attributes_private,
            global: Arc::new(AttributeRedactionIndex::new(private_attributes)),
        }
    }

    /// Render a context. With `redact_anonymous`, every optional attribute of
    /// an anonymous context is redacted.
    pub fn render(&self, context: &Context, redact_anonymous: bool) -> Result<Value, ContextError> {
        context.validate()?;

        if !context.is_multi() {
            return Ok(Value::Object(self.render_single(context, redact_anonymous, true)));
        }

        let mut out = Map::new();
        out.insert("kind".to_string(), Value::from("multi"));
        for single in context.contexts() {
            out.insert(
                single.kind().to_string(),
                Value::Object(self.render_single(single, redact_anonymous, false)),
            );
        }
        Ok(Value::Object(out))
    }

    fn render_single(
        &self,
        context: &Context,
        redact_anonymous: bool,
        include_kind: bool,
    ) -> Map<String, Value> {
        let mut out = Map::new();
        if include_kind {
            out.insert("kind".to_string(), Value::from(context.kind().as_str()));
        }
        out.insert("key".to_string(), Value::from(context.key()));

        let redact_all =
            self.all_attributes_private || (redact_anonymous && context.is_anonymous());
        let local = (!context.private_attributes().is_empty())
            .then(|| AttributeRedactionIndex::new(context.private_attributes()));
        let mut redacted = Vec::new();

        for name in context.attribute_names() {
            let path = Reference::literal(name);
            if redact_all {
                redacted.push(path.to_string());
                continue;
            }
            let Some(value) = context.attribute(name) else {
                continue;
            };
            if let Some(kept) = self.redact_value(local.as_ref(), &path, value, &mut redacted) {
                out.insert(name.to_string(), kept);
            }
        }

        if context.is_anonymous() {
            out.insert("anonymous".to_string(), Value::Bool(true));
        }
        if !redacted.is_empty() {
            out.insert("_meta".to_string(), json!({ "redactedAttributes": redacted }));
        }
        out
    }

    /// Returns the value to write at `path`, or `None` if it is redacted.
    /// Object values with private descendants are rebuilt property by property.
    fn redact_value(
        &self,
        local: Option<&AttributeRedactionIndex>,
        path: &Reference,
        value: &Value,
        redacted: &mut Vec<String>,
    ) -> Option<Value> {
        let components = path.components();
        let global = self.global.lookup(components);
        let own = local.map_or(Lookup::NotPrivate, |local| local.lookup(components));

        if global.is_private() || own.is_private() {
            redacted.push(path.to_string());
            return None;
        }

        let descend = matches!(global, Lookup::DescendantsPrivate)
            || matches!(own, Lookup::DescendantsPrivate);
        match value {
            Value::Object(properties) if descend => {
                let mut kept = Map::new();
                for (property, child) in properties {
                    let child_path = path.child(property);
                    if let Some(child) = self.redact_value(local, &child_path, child, redacted) {
                        kept.insert(property.clone(), child);
                    }
                }
                Some(Value::Object(kept))
            }
            _ => Some(value.clone()),
        }
    }
}
