use std::collections::btree_map::{BTreeMap, Entry};
use std::collections::HashMap;

use log::warn;

use super::attribute_reference::Reference;
use super::context::{Context, Kind};
use crate::AttributeValue;

/// Builds a single-kind [Context].
///
/// Unless changed, the context is of kind "user", is not anonymous and has no attributes besides
/// its key. Invalid input such as an empty key or a malformed kind is reported by
/// [ContextBuilder::build].
#[derive(Clone, Debug)]
pub struct ContextBuilder {
    kind: String,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: HashMap<String, AttributeValue>,
    private_attributes: Vec<Reference>,
}

impl ContextBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            kind: "user".to_owned(),
            key: key.into(),
            name: None,
            anonymous: false,
            attributes: HashMap::new(),
            private_attributes: Vec::new(),
        }
    }

    /// Sets the kind. See [Kind::try_from] for what makes a kind valid.
    pub fn kind(&mut self, kind: impl Into<String>) -> &mut Self {
        self.kind = kind.into();
        self
    }

    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the built-in "anonymous" attribute, false by default.
    pub fn anonymous(&mut self, anonymous: bool) -> &mut Self {
        self.anonymous = anonymous;
        self
    }

    /// Sets an attribute that clauses can reference.
    ///
    /// The built-in attributes only take values of their own type: "kind", "key" and "name" take
    /// strings (a null clears "name") and "anonymous" takes a boolean. A value of the wrong type
    /// is ignored with a warning, as are an empty name and "_meta". Setting a custom attribute to
    /// null removes it.
    pub fn set_value(&mut self, name: &str, value: impl Into<AttributeValue>) -> &mut Self {
        let value = value.into();
        match (name, value) {
            ("kind", AttributeValue::String(kind)) => self.kind = kind,
            ("key", AttributeValue::String(key)) => self.key = key,
            ("name", AttributeValue::String(display_name)) => self.name = Some(display_name),
            ("name", AttributeValue::Null) => self.name = None,
            ("anonymous", AttributeValue::Bool(anonymous)) => self.anonymous = anonymous,
            ("" | "_meta" | "kind" | "key" | "name" | "anonymous", value) => {
                warn!("ignoring invalid value {:?} for attribute '{}'", value, name)
            }
            (_, AttributeValue::Null) => {
                self.attributes.remove(name);
            }
            (_, value) => {
                self.attributes.insert(name.to_owned(), value);
            }
        }
        self
    }

    /// Marks an attribute as private. Private attributes are still used in evaluations.
    pub fn private_attribute(&mut self, reference: impl Into<Reference>) -> &mut Self {
        self.private_attributes.push(reference.into());
        self
    }

    pub fn build(&self) -> Result<Context, String> {
        if self.kind == "multi" {
            return Err("a multi-kind context must be built with MultiContextBuilder".into());
        }
        let kind = Kind::try_from(self.kind.as_str())?;
        if self.key.is_empty() {
            return Err("context key cannot be empty".into());
        }

        Ok(Context {
            kind,
            key: self.key.clone(),
            name: self.name.clone(),
            anonymous: self.anonymous,
            attributes: self.attributes.clone(),
            private_attributes: self.private_attributes.clone(),
            members: Vec::new(),
        })
    }
}

/// Combines single-kind contexts into one multi-kind [Context].
///
/// Adding a multi-kind context adds each of its members. Every kind may appear only once.
#[derive(Clone, Debug, Default)]
pub struct MultiContextBuilder {
    contexts: Vec<Context>,
}

impl MultiContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(contexts: Vec<Context>) -> Self {
        let mut builder = Self::new();
        for context in contexts {
            builder.add_context(context);
        }
        builder
    }

    pub fn add_context(&mut self, context: Context) -> &mut Self {
        if context.is_multi() {
            self.contexts.extend(context.members);
        } else {
            self.contexts.push(context);
        }
        self
    }

    /// Builds the context. A builder holding exactly one context returns that context unchanged.
    pub fn build(&self) -> Result<Context, String> {
        let mut by_kind = BTreeMap::new();
        for context in &self.contexts {
            match by_kind.entry(context.kind.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(context.clone());
                }
                Entry::Occupied(entry) => {
                    return Err(format!(
                        "multi-kind context contains kind '{}' more than once",
                        entry.key()
                    ))
                }
            }
        }

        let mut members: Vec<Context> = by_kind.into_values().collect();
        match members.len() {
            0 => Err("multi-kind context must contain at least one context".into()),
            1 => Ok(members.remove(0)),
            _ => Ok(Context {
                kind: Kind::multi(),
                key: String::new(),
                name: None,
                anonymous: false,
                attributes: HashMap::new(),
                private_attributes: Vec::new(),
                members,
            }),
        }
    }
}
