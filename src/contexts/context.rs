use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use log::warn;
use serde::{Deserialize, Serialize};

use super::attribute_reference::Reference;
use crate::bucketing::{bucket_value, BucketPrefix};
use crate::AttributeValue;

/// Kind names the type of entity a [Context] describes, such as "user" or "org".
///
/// Kinds built through [Kind::try_from] are validated. Kinds read from flag and segment data are
/// kept as written: one that no context can carry simply never matches.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(Cow<'static, str>);

impl Kind {
    /// The default kind, "user".
    pub fn user() -> Self {
        Self(Cow::Borrowed("user"))
    }

    pub(crate) fn multi() -> Self {
        Self(Cow::Borrowed("multi"))
    }

    pub fn is_user(&self) -> bool {
        self == "user"
    }

    pub fn is_multi(&self) -> bool {
        self == "multi"
    }

    #[cfg(test)]
    // Skips validation, so tests can build kinds no context could carry.
    pub(crate) fn from(s: &str) -> Self {
        Kind(Cow::Owned(s.to_owned()))
    }

    fn validate(name: &str) -> Result<(), String> {
        match name {
            "" => Err("context kind cannot be empty".into()),
            "kind" | "multi" => Err(format!("context kind cannot be '{}'", name)),
            _ if name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_')) =>
            {
                Ok(())
            }
            _ => Err("context kind contains disallowed characters".into()),
        }
    }
}

impl Default for Kind {
    fn default() -> Self {
        Kind::user()
    }
}

impl TryFrom<String> for Kind {
    type Error = String;

    /// A valid kind is non-empty, is neither "kind" nor "multi", and contains only ASCII letters,
    /// digits, `-`, `.` and `_`.
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Kind::validate(&value)?;
        Ok(match value.as_str() {
            "user" => Kind::user(),
            _ => Kind(Cow::Owned(value)),
        })
    }
}

impl TryFrom<&str> for Kind {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Kind::try_from(value.to_owned())
    }
}

impl AsRef<str> for Kind {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Kind {
    fn eq(&self, other: &str) -> bool {
        self.as_ref() == other
    }
}

impl PartialEq<&str> for Kind {
    fn eq(&self, other: &&str) -> bool {
        self.as_ref() == *other
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl From<Kind> for String {
    fn from(kind: Kind) -> Self {
        kind.0.into_owned()
    }
}


/// Context is the subject of an evaluation: one entity of a single [Kind], or several entities
/// of distinct kinds evaluated together.
///
/// Build one with [crate::ContextBuilder], or combine several with [crate::MultiContextBuilder].
#[derive(Clone, Debug, PartialEq)]
pub struct Context {
    // "multi" for a multi-kind context
    pub(super) kind: Kind,
    // empty for a multi-kind context
    pub(super) key: String,
    pub(super) name: Option<String>,
    pub(super) anonymous: bool,
    pub(super) attributes: HashMap<String, AttributeValue>,
    pub(super) private_attributes: Vec<Reference>,
    // single-kind members of a multi-kind context, sorted by kind
    pub(super) members: Vec<Context>,
}

impl Context {
    pub fn is_multi(&self) -> bool {
        self.kind.is_multi()
    }

    /// The context's kind; "multi" for a multi-kind context.
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// The context's key. A multi-kind context has no key of its own and returns "".
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn anonymous(&self) -> bool {
        self.anonymous
    }

    /// Attribute references the application marked private. Evaluation ignores them; they
    /// travel with the context for whoever reports on it.
    pub fn private_attributes(&self) -> &[Reference] {
        &self.private_attributes
    }

    // A single-kind context is its own only member.
    fn singles(&self) -> &[Context] {
        if self.is_multi() {
            &self.members
        } else {
            std::slice::from_ref(self)
        }
    }

    /// The single-kind context of the given kind, if this context has one.
    pub fn as_kind(&self, kind: &Kind) -> Option<&Context> {
        self.singles().iter().find(|context| &context.kind == kind)
    }

    /// Every kind this context carries.
    pub fn kinds(&self) -> Vec<&Kind> {
        self.singles().iter().map(Context::kind).collect()
    }

    /// The key of each kind this context carries.
    pub fn context_keys(&self) -> HashMap<&Kind, &str> {
        self.singles()
            .iter()
            .map(|context| (context.kind(), context.key()))
            .collect()
    }

    /// Resolves an attribute reference against this context, the same way clauses do.
    ///
    /// "kind", "key", "name" and "anonymous" are built in; anything else is a custom attribute,
    /// and further path components index into object values. A multi-kind context only answers
    /// "kind"; use [Context::as_kind] to reach the attributes of one of its members.
    pub fn get_value(&self, reference: &Reference) -> Option<AttributeValue> {
        if !reference.is_valid() {
            return None;
        }

        if self.is_multi() {
            if reference.depth() == 1 && reference.component(0) == Some("kind") {
                return Some(AttributeValue::String(self.kind.to_string()));
            }
            warn!("multi-kind contexts only support the 'kind' attribute");
            return None;
        }

        let top_level = self.attribute(reference.component(0)?)?;
        (1..reference.depth()).try_fold(top_level, |value, depth| match value {
            AttributeValue::Object(mut fields) => fields.remove(reference.component(depth)?),
            _ => None,
        })
    }

    fn attribute(&self, name: &str) -> Option<AttributeValue> {
        match name {
            "kind" => Some(AttributeValue::String(self.kind.to_string())),
            "key" => Some(AttributeValue::String(self.key.clone())),
            "name" => self.name.clone().map(AttributeValue::String),
            "anonymous" => Some(AttributeValue::Bool(self.anonymous)),
            _ => self.attributes.get(name).cloned(),
        }
    }

    /// Computes this context's bucket for a rollout or weighted segment rule.
    ///
    /// The bucketing attribute is resolved on the member of `context_kind`; experiments always
    /// bucket by key. The second element of the result is true when the context has no member of
    /// that kind, in which case the bucket is 0.
    pub(crate) fn bucket(
        &self,
        by_attr: &Option<Reference>,
        prefix: BucketPrefix,
        is_experiment: bool,
        context_kind: &Kind,
    ) -> Result<(f32, bool), String> {
        let reference = match (is_experiment, by_attr) {
            (true, _) | (false, None) => Reference::new("key"),
            (false, Some(reference)) => reference.clone(),
        };

        if !reference.is_valid() {
            return Err(reference.error());
        }

        match self.as_kind(context_kind) {
            Some(context) => {
                let bucket = context
                    .get_value(&reference)
                    .and_then(|value| value.as_bucketable())
                    .and_then(|id| bucket_value(prefix, &id))
                    .unwrap_or(0.0);
                Ok((bucket, false))
            }
            // still bucket 0, but the result must not count as part of an experiment
            None => Ok((0.0, true)),
        }
    }
}
