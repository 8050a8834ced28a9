use log::warn;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};

use crate::bucketing::BucketPrefix;
use crate::contexts::attribute_reference::Reference;
use crate::contexts::context::{Context, Kind};
use crate::eval::{self, EvaluationStack};
use crate::rule::Clause;
use crate::store::Store;
use crate::util::{is_false, serialize_optional_weight};
use crate::variation::VariationWeight;
use crate::BigSegmentsStatus;

/// Segment describes a group of contexts based on context keys and/or matching rules.
#[serde_as]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    /// The unique key of the segment.
    pub key: String,
    /// An integer that is incremented by LaunchDarkly every time the configuration of the segment
    /// is changed.
    pub version: u64,

    /// A list of context keys that are always matched by this segment. Only applies to contexts
    /// of kind "user".
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub included: Vec<String>,
    /// A list of context keys that are never matched by this segment. Only applies to contexts of
    /// kind "user".
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    included_contexts: Vec<SegmentTarget>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    excluded_contexts: Vec<SegmentTarget>,

    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    rules: Vec<SegmentRule>,
    #[serde(default)]
    salt: String,

    /// Unbounded is true if this is a segment whose included list is stored separately and is
    /// not limited in size.
    ///
    /// The name is historical: "unbounded segments" was an earlier name for the product feature
    /// that is currently known as "big segments".
    #[serde(default, skip_serializing_if = "is_false")]
    pub unbounded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unbounded_context_kind: Option<Kind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    generation: Option<i64>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

/// A list of context keys of one kind.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentTarget {
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    values: Vec<String>,
    #[serde(default)]
    context_kind: Kind,
}

/// SegmentRule describes a single rule within a segment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "SegmentRuleRepr", into = "SegmentRuleRepr")]
struct SegmentRule {
    id: Option<String>,
    clauses: Vec<Clause>,
    weight: Option<VariationWeight>,
    bucket_by: Option<Reference>,
    rollout_context_kind: Option<Kind>,
}

#[serde_as]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentRuleRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    clauses: Vec<Clause>,
    #[serde(
        default,
        serialize_with = "serialize_optional_weight",
        skip_serializing_if = "Option::is_none"
    )]
    weight: Option<VariationWeight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bucket_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rollout_context_kind: Option<Kind>,
}

impl From<SegmentRuleRepr> for SegmentRule {
    fn from(repr: SegmentRuleRepr) -> Self {
        let has_context_kind = repr.rollout_context_kind.is_some();
        SegmentRule {
            id: repr.id,
            clauses: repr.clauses,
            weight: repr.weight,
            bucket_by: repr
                .bucket_by
                .map(|attr| Reference::from_attribute(attr, has_context_kind)),
            rollout_context_kind: repr.rollout_context_kind,
        }
    }
}

impl From<SegmentRule> for SegmentRuleRepr {
    fn from(rule: SegmentRule) -> Self {
        SegmentRuleRepr {
            id: rule.id,
            clauses: rule.clauses,
            weight: rule.weight,
            bucket_by: rule.bucket_by.map(String::from),
            rollout_context_kind: rule.rollout_context_kind,
        }
    }
}

impl Segment {
    /// Determines if the provided context is a part of this segment.
    ///
    /// Exclusions are checked first, then inclusions, then the segment's rules in order. Big
    /// segments consult the big segment store carried by the evaluation instead of the inline
    /// lists.
    pub(crate) fn contains(
        &self,
        context: &Context,
        store: &dyn Store,
        evaluation_stack: &mut EvaluationStack,
    ) -> Result<bool, eval::Error> {
        if self.unbounded {
            return self.contains_unbounded(context, evaluation_stack);
        }

        if self.is_excluded(context) {
            return Ok(false);
        }
        if self.is_included(context) {
            return Ok(true);
        }

        self.matches_rules(context, store, evaluation_stack)
    }

    fn is_excluded(&self, context: &Context) -> bool {
        user_key_in(&self.excluded, context) || target_matches(&self.excluded_contexts, context)
    }

    fn is_included(&self, context: &Context) -> bool {
        user_key_in(&self.included, context) || target_matches(&self.included_contexts, context)
    }

    fn matches_rules(
        &self,
        context: &Context,
        store: &dyn Store,
        evaluation_stack: &mut EvaluationStack,
    ) -> Result<bool, eval::Error> {
        for rule in &self.rules {
            if rule.matches(context, store, &self.key, &self.salt, evaluation_stack)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn contains_unbounded(
        &self,
        context: &Context,
        evaluation_stack: &mut EvaluationStack,
    ) -> Result<bool, eval::Error> {
        if self.generation.is_none() {
            // no generation means membership was never exported
            evaluation_stack.record_big_segments_status(BigSegmentsStatus::NotConfigured);
            return Err(eval::Error::BigSegmentsUnavailable);
        }

        let kind = self.unbounded_context_kind.clone().unwrap_or_default();
        let context_key = match context.as_kind(&kind) {
            Some(context) => context.key().to_string(),
            None => return Ok(false),
        };

        // a context without a membership record is not in the segment
        let included = evaluation_stack
            .check_big_segment_membership(&context_key, &self.unbounded_segment_id())?;
        Ok(included.unwrap_or(false))
    }

    /// The identifier of this segment within a big segment store [crate::Membership].
    pub fn unbounded_segment_id(&self) -> String {
        match self.generation {
            None | Some(0) => self.key.clone(),
            Some(generation) => format!("{}.g{}", self.key, generation),
        }
    }
}

fn user_key_in(keys: &[String], context: &Context) -> bool {
    if keys.is_empty() {
        return false;
    }
    context
        .as_kind(&Kind::user())
        .map(|user| keys.iter().any(|key| key == user.key()))
        .unwrap_or(false)
}

fn target_matches(targets: &[SegmentTarget], context: &Context) -> bool {
    targets.iter().any(|target| {
        context
            .as_kind(&target.context_kind)
            .map(|context| target.values.iter().any(|key| key == context.key()))
            .unwrap_or(false)
    })
}

impl SegmentRule {
    /// Determines if a context matches the provided segment rule.
    ///
    /// A context will match if all segment clauses match and the context's bucket value falls
    /// within the rule's weight, if it has one.
    fn matches(
        &self,
        context: &Context,
        store: &dyn Store,
        key: &str,
        salt: &str,
        evaluation_stack: &mut EvaluationStack,
    ) -> Result<bool, eval::Error> {
        // rules match if _all_ of their clauses do
        for clause in &self.clauses {
            if !clause.matches(context, store, evaluation_stack)? {
                return Ok(false);
            }
        }

        match self.weight {
            Some(weight) if weight >= 0.0 => {
                let prefix = BucketPrefix::KeyAndSalt(key, salt);
                let kind = self.rollout_context_kind.clone().unwrap_or_default();
                let (bucket, _) = context
                    .bucket(&self.bucket_by, prefix, false, &kind)
                    .map_err(|msg| {
                        warn!("segment {} has an invalid bucketBy: {}", key, msg);
                        eval::Error::MalformedFlag
                    })?;
                Ok(bucket < weight / 100_000.0)
            }
            _ => Ok(true),
        }
    }
}
