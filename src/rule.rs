use std::collections::HashSet;

use chrono::{self, Utc};
use log::{error, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};

use crate::attribute_value::{AttributeValue, ScalarKey};
use crate::contexts::attribute_reference::Reference;
use crate::contexts::context::{Context, Kind};
use crate::eval::{self, EvaluationStack};
use crate::store::Store;
use crate::util::is_false;
use crate::variation::VariationOrRollout;

/// How deeply segments may reference other segments through `segmentMatch` clauses before the
/// innermost reference is treated as a non-match.
pub(crate) const MAX_SEGMENT_DEPTH: usize = 20;

/// Clause describes an individual clause within a [FlagRule] or a segment rule.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "ClauseRepr", into = "ClauseRepr")]
pub struct Clause {
    // The context kind that the attribute is read from. A missing value means "user".
    context_kind: Option<Kind>,
    // Identifies the attribute; a path only when the clause names a context kind.
    attribute: Reference,
    negate: bool,
    op: Op,
    values: Vec<AttributeValue>,
    preprocessed: PreprocessedValues,
}

impl PartialEq for Clause {
    fn eq(&self, other: &Self) -> bool {
        self.context_kind == other.context_kind
            && self.attribute == other.attribute
            && self.negate == other.negate
            && self.op == other.op
            && self.values == other.values
    }
}

#[serde_as]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClauseRepr {
    #[serde(skip_serializing_if = "Option::is_none")]
    context_kind: Option<Kind>,
    #[serde(default)]
    attribute: String,
    #[serde(default)]
    negate: bool,
    #[serde(default)]
    op: Op,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    values: Vec<AttributeValue>,
}

impl From<ClauseRepr> for Clause {
    fn from(repr: ClauseRepr) -> Self {
        let attribute = Reference::from_attribute(repr.attribute, repr.context_kind.is_some());
        Clause::new(repr.context_kind, attribute, repr.negate, repr.op, repr.values)
    }
}

impl From<Clause> for ClauseRepr {
    fn from(clause: Clause) -> Self {
        ClauseRepr {
            context_kind: clause.context_kind,
            attribute: clause.attribute.into(),
            negate: clause.negate,
            op: clause.op,
            values: clause.values,
        }
    }
}

// Values parsed once when a clause is loaded instead of on every evaluation.
#[derive(Clone, Debug, Default)]
struct PreprocessedValues {
    // Present for "in" clauses whose values are all scalars.
    value_set: Option<HashSet<ScalarKey>>,
    // One entry per clause value, for operators that parse their operand.
    parsed: Vec<ParsedValue>,
}

#[derive(Clone, Debug)]
enum ParsedValue {
    Regex(Regex),
    Time(chrono::DateTime<Utc>),
    SemVer(semver::Version),
    Invalid,
}

impl PreprocessedValues {
    fn new(op: &Op, values: &[AttributeValue]) -> Self {
        match op {
            Op::In => PreprocessedValues {
                value_set: values
                    .iter()
                    .map(AttributeValue::as_scalar_key)
                    .collect::<Option<HashSet<_>>>(),
                parsed: Vec::new(),
            },
            Op::Matches => Self::parse_each(values, |value| {
                value
                    .as_str()
                    .and_then(|pattern| match Regex::new(pattern) {
                        Ok(re) => Some(ParsedValue::Regex(re)),
                        Err(e) => {
                            warn!("Invalid regex for 'matches' operator ({}): {}", e, pattern);
                            None
                        }
                    })
            }),
            Op::Before | Op::After => {
                Self::parse_each(values, |value| value.to_datetime().map(ParsedValue::Time))
            }
            Op::SemVerEqual | Op::SemVerLessThan | Op::SemVerGreaterThan => {
                Self::parse_each(values, |value| value.as_semver().map(ParsedValue::SemVer))
            }
            _ => PreprocessedValues::default(),
        }
    }

    fn parse_each<F>(values: &[AttributeValue], parse: F) -> Self
    where
        F: Fn(&AttributeValue) -> Option<ParsedValue>,
    {
        PreprocessedValues {
            value_set: None,
            parsed: values
                .iter()
                .map(|value| parse(value).unwrap_or(ParsedValue::Invalid))
                .collect(),
        }
    }
}

/// FlagRule describes a single rule within a feature flag.
///
/// A rule consists of a set of ANDed matching conditions ([Clause]) for a context, along with either
/// a fixed variation or a set of rollout percentages to use if the context matches all of the
/// clauses.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    /// A randomized identifier assigned to each rule when it is created.
    ///
    /// This is used to populate the id property of [crate::Reason::RuleMatch].
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    clauses: Vec<Clause>,

    /// Defines what variation to return if the context matches this rule.
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,

    /// Used internally by the SDK analytics event system.
    ///
    /// This field is true if the current LaunchDarkly account has experimentation enabled, has
    /// associated this flag with an experiment, and has enabled this rule for the experiment. This
    /// tells the SDK to send full event data for any evaluation that matches this rule.
    #[serde(default, skip_serializing_if = "is_false")]
    pub track_events: bool,
}

/// Op is the operator a [Clause] applies between a context value and each of its values.
///
/// Operator names that are not recognized decode to [Op::Unknown], which never matches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Op {
    In,
    StartsWith,
    EndsWith,
    Contains,
    Matches,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SegmentMatch,
    SemVerEqual,
    SemVerGreaterThan,
    SemVerLessThan,
    Unknown(String),
}

impl Default for Op {
    fn default() -> Self {
        Op::Unknown(String::new())
    }
}

impl From<String> for Op {
    fn from(name: String) -> Self {
        match name.as_str() {
            "in" => Op::In,
            "startsWith" => Op::StartsWith,
            "endsWith" => Op::EndsWith,
            "contains" => Op::Contains,
            "matches" => Op::Matches,
            "lessThan" => Op::LessThan,
            "lessThanOrEqual" => Op::LessThanOrEqual,
            "greaterThan" => Op::GreaterThan,
            "greaterThanOrEqual" => Op::GreaterThanOrEqual,
            "before" => Op::Before,
            "after" => Op::After,
            "segmentMatch" => Op::SegmentMatch,
            "semVerEqual" => Op::SemVerEqual,
            "semVerGreaterThan" => Op::SemVerGreaterThan,
            "semVerLessThan" => Op::SemVerLessThan,
            _ => Op::Unknown(name),
        }
    }
}

impl From<Op> for String {
    fn from(op: Op) -> Self {
        let name = match op {
            Op::In => "in",
            Op::StartsWith => "startsWith",
            Op::EndsWith => "endsWith",
            Op::Contains => "contains",
            Op::Matches => "matches",
            Op::LessThan => "lessThan",
            Op::LessThanOrEqual => "lessThanOrEqual",
            Op::GreaterThan => "greaterThan",
            Op::GreaterThanOrEqual => "greaterThanOrEqual",
            Op::Before => "before",
            Op::After => "after",
            Op::SegmentMatch => "segmentMatch",
            Op::SemVerEqual => "semVerEqual",
            Op::SemVerGreaterThan => "semVerGreaterThan",
            Op::SemVerLessThan => "semVerLessThan",
            Op::Unknown(name) => return name,
        };
        name.to_string()
    }
}

impl Clause {
    fn new(
        context_kind: Option<Kind>,
        attribute: Reference,
        negate: bool,
        op: Op,
        values: Vec<AttributeValue>,
    ) -> Self {
        let preprocessed = PreprocessedValues::new(&op, &values);
        Clause {
            context_kind,
            attribute,
            negate,
            op,
            values,
            preprocessed,
        }
    }

    pub(crate) fn matches(
        &self,
        context: &Context,
        store: &dyn Store,
        evaluation_stack: &mut EvaluationStack,
    ) -> Result<bool, eval::Error> {
        if let Op::SegmentMatch = self.op {
            self.matches_segment(context, store, evaluation_stack)
        } else {
            Ok(self.matches_non_segment(context))
        }
    }

    fn maybe_negate(&self, v: bool) -> bool {
        if self.negate {
            !v
        } else {
            v
        }
    }

    fn matches_segment(
        &self,
        context: &Context,
        store: &dyn Store,
        evaluation_stack: &mut EvaluationStack,
    ) -> Result<bool, eval::Error> {
        for segment_key in self.values.iter().filter_map(AttributeValue::as_str) {
            if evaluation_stack.segment_chain.contains(segment_key) {
                warn!(
                    "segment rule referencing segment {} caused a circular reference; treating it as a non-match",
                    segment_key
                );
                continue;
            }
            if evaluation_stack.segment_chain.len() >= MAX_SEGMENT_DEPTH {
                warn!(
                    "segment {} is nested more than {} levels deep; treating it as a non-match",
                    segment_key, MAX_SEGMENT_DEPTH
                );
                continue;
            }

            let segment = match store.segment(segment_key) {
                Some(segment) => segment,
                None => continue,
            };

            evaluation_stack
                .segment_chain
                .insert(segment_key.to_string());
            let result = segment.contains(context, store, evaluation_stack);
            evaluation_stack.segment_chain.remove(segment_key);

            if result? {
                return Ok(self.maybe_negate(true));
            }
        }

        Ok(self.maybe_negate(false))
    }

    pub(crate) fn matches_non_segment(&self, context: &Context) -> bool {
        if !self.attribute.is_valid() {
            warn!(
                "clause has an invalid attribute reference {}: {}",
                self.attribute,
                self.attribute.error()
            );
            return false;
        }

        if self.attribute.is_kind() {
            let any_match = context
                .kinds()
                .into_iter()
                .any(|kind| self.match_any(&AttributeValue::String(kind.to_string())));
            return self.maybe_negate(any_match);
        }

        let user_kind = Kind::user();
        let kind = self.context_kind.as_ref().unwrap_or(&user_kind);
        let actual_context = match context.as_kind(kind) {
            Some(actual_context) => actual_context,
            None => return false,
        };

        let context_value = match actual_context.get_value(&self.attribute) {
            Some(AttributeValue::Null) | None => return false,
            Some(context_value) => context_value,
        };

        match &context_value {
            AttributeValue::Array(elements) => {
                for element in elements {
                    if !element.is_scalar() {
                        error!(
                            "Attribute {} contains a nested array or object; clause cannot match",
                            self.attribute
                        );
                        return false;
                    }
                    if self.match_any(element) {
                        return self.maybe_negate(true);
                    }
                }
                self.maybe_negate(false)
            }
            AttributeValue::Object(_) => {
                warn!(
                    "Attribute {} is an object, which clauses cannot match",
                    self.attribute
                );
                false
            }
            scalar => self.maybe_negate(self.match_any(scalar)),
        }
    }

    fn match_any(&self, context_value: &AttributeValue) -> bool {
        if let (Op::In, Some(value_set)) = (&self.op, &self.preprocessed.value_set) {
            return context_value
                .as_scalar_key()
                .map(|key| value_set.contains(&key))
                .unwrap_or(false);
        }

        self.values.iter().enumerate().any(|(index, clause_value)| {
            self.op.matches(
                context_value,
                clause_value,
                self.preprocessed.parsed.get(index),
            )
        })
    }

    #[cfg(test)]
    pub(crate) fn new_match(reference: &str, value: AttributeValue, kind: Kind) -> Self {
        Clause::new(
            Some(kind),
            Reference::new(reference),
            false,
            Op::Matches,
            vec![value],
        )
    }

    #[cfg(test)]
    pub(crate) fn new_context_match(reference: &str, value: AttributeValue, kind: Kind) -> Self {
        Clause::new(Some(kind), Reference::new(reference), false, Op::In, vec![value])
    }
}

impl FlagRule {
    /// Determines whether the rule matches the provided context.
    ///
    /// A rule matches if all of its clauses do.
    pub(crate) fn matches(
        &self,
        context: &Context,
        store: &dyn Store,
        evaluation_stack: &mut EvaluationStack,
    ) -> Result<bool, eval::Error> {
        for clause in &self.clauses {
            if !clause.matches(context, store, evaluation_stack)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn new_segment_match(segment_keys: Vec<&str>, kind: Kind) -> Self {
        Self {
            id: "rule".to_string(),
            variation_or_rollout: VariationOrRollout::Variation { variation: 1 },
            clauses: vec![Clause::new(
                Some(kind),
                Reference::new("key"),
                false,
                Op::SegmentMatch,
                segment_keys
                    .into_iter()
                    .map(|key| AttributeValue::String(key.to_string()))
                    .collect(),
            )],
            track_events: false,
        }
    }
}

impl Op {
    fn matches(
        &self,
        lhs: &AttributeValue,
        rhs: &AttributeValue,
        parsed: Option<&ParsedValue>,
    ) -> bool {
        match self {
            Op::In => lhs == rhs,

            // string ops
            Op::StartsWith => string_op(lhs, rhs, |l, r| l.starts_with(r)),
            Op::EndsWith => string_op(lhs, rhs, |l, r| l.ends_with(r)),
            Op::Contains => string_op(lhs, rhs, |l, r| l.contains(r)),
            Op::Matches => match (lhs.as_str(), parsed) {
                (Some(l), Some(ParsedValue::Regex(re))) => re.is_match(l),
                (_, Some(_)) => false,
                (Some(l), None) => string_op(lhs, rhs, |_, r| match Regex::new(r) {
                    Ok(re) => re.is_match(l),
                    Err(e) => {
                        warn!("Invalid regex for 'matches' operator ({}): {}", e, r);
                        false
                    }
                }),
                (None, None) => false,
            },

            // numeric ops
            Op::LessThan => numeric_op(lhs, rhs, |l, r| l < r),
            Op::LessThanOrEqual => numeric_op(lhs, rhs, |l, r| l <= r),
            Op::GreaterThan => numeric_op(lhs, rhs, |l, r| l > r),
            Op::GreaterThanOrEqual => numeric_op(lhs, rhs, |l, r| l >= r),

            Op::Before => time_op(lhs, rhs, parsed, |l, r| l < r),
            Op::After => time_op(lhs, rhs, parsed, |l, r| l > r),

            Op::SemVerEqual => semver_op(lhs, rhs, parsed, |l, r| l == r),
            Op::SemVerLessThan => semver_op(lhs, rhs, parsed, |l, r| l < r),
            Op::SemVerGreaterThan => semver_op(lhs, rhs, parsed, |l, r| l > r),

            Op::SegmentMatch => {
                error!("segmentMatch operator should be special-cased, shouldn't get here");
                false
            }
            Op::Unknown(_) => false,
        }
    }
}

fn string_op<F: Fn(&str, &str) -> bool>(lhs: &AttributeValue, rhs: &AttributeValue, f: F) -> bool {
    match (lhs.as_str(), rhs.as_str()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn numeric_op<F: Fn(f64, f64) -> bool>(lhs: &AttributeValue, rhs: &AttributeValue, f: F) -> bool {
    match (lhs.to_f64(), rhs.to_f64()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn time_op<F: Fn(chrono::DateTime<Utc>, chrono::DateTime<Utc>) -> bool>(
    lhs: &AttributeValue,
    rhs: &AttributeValue,
    parsed: Option<&ParsedValue>,
    f: F,
) -> bool {
    let rhs = match parsed {
        Some(ParsedValue::Time(time)) => Some(*time),
        Some(_) => None,
        None => rhs.to_datetime(),
    };
    match (lhs.to_datetime(), rhs) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn semver_op<F: Fn(&semver::Version, &semver::Version) -> bool>(
    lhs: &AttributeValue,
    rhs: &AttributeValue,
    parsed: Option<&ParsedValue>,
    f: F,
) -> bool {
    let lhs = match lhs.as_semver() {
        Some(lhs) => lhs,
        None => return false,
    };
    match parsed {
        Some(ParsedValue::SemVer(rhs)) => f(&lhs, rhs),
        Some(_) => false,
        None => rhs.as_semver().map(|rhs| f(&lhs, &rhs)).unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag::Flag;
    use crate::segment::Segment;
    use crate::{ContextBuilder, MultiContextBuilder};
    use assert_json_diff::assert_json_eq;
    use maplit::hashmap;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::SystemTime;
    use test_case::test_case;

    struct TestStore;

    impl Store for TestStore {
        fn flag(&self, _flag_key: &str) -> Option<Arc<Flag>> {
            None
        }
        fn segment(&self, _segment_key: &str) -> Option<Arc<Segment>> {
            None
        }
    }

    fn astring(s: &str) -> AttributeValue {
        AttributeValue::String(s.into())
    }
    fn anum(f: f64) -> AttributeValue {
        AttributeValue::Number(f)
    }

    fn op_matches(op: Op, lhs: &AttributeValue, rhs: &AttributeValue) -> bool {
        let clause = Clause::new(None, Reference::new("attr"), false, op, vec![rhs.clone()]);
        clause.match_any(lhs)
    }

    fn clause_matches(clause: &Clause, context: &Context) -> bool {
        clause
            .matches(context, &TestStore {}, &mut EvaluationStack::default())
            .unwrap()
    }

    #[test]
    fn test_op_in() {
        // strings
        assert!(op_matches(Op::In, &astring("foo"), &astring("foo")));

        assert!(!op_matches(Op::In, &astring("foo"), &astring("bar")));
        assert!(
            !op_matches(Op::In, &astring("Foo"), &astring("foo")),
            "case sensitive"
        );

        // numbers
        assert!(op_matches(Op::In, &anum(42.0), &anum(42.0)));
        assert!(!op_matches(Op::In, &anum(42.0), &anum(3.0)));
        assert!(op_matches(Op::In, &anum(0.0), &anum(-0.0)));

        // types are never converted
        assert!(!op_matches(Op::In, &astring("42"), &anum(42.0)));
        assert!(!op_matches(Op::In, &AttributeValue::Bool(true), &astring("true")));
    }

    #[test]
    fn in_clause_uses_a_set_only_for_scalar_values() {
        let scalar = Clause::new(
            None,
            Reference::new("a"),
            false,
            Op::In,
            vec![astring("x"), anum(1.0), AttributeValue::Bool(false)],
        );
        assert!(scalar.preprocessed.value_set.is_some());
        assert!(scalar.match_any(&anum(1.0)));
        assert!(scalar.match_any(&AttributeValue::Bool(false)));
        assert!(!scalar.match_any(&astring("1")));

        let with_null = Clause::new(
            None,
            Reference::new("a"),
            false,
            Op::In,
            vec![astring("x"), AttributeValue::Null],
        );
        assert!(with_null.preprocessed.value_set.is_none());
        assert!(with_null.match_any(&astring("x")));
    }

    #[test]
    fn test_op_starts_with() {
        // degenerate cases
        assert!(op_matches(Op::StartsWith, &astring(""), &astring("")));
        assert!(op_matches(Op::StartsWith, &astring("a"), &astring("")));
        assert!(op_matches(Op::StartsWith, &astring("a"), &astring("a")));

        // test asymmetry
        assert!(op_matches(Op::StartsWith, &astring("food"), &astring("foo")));
        assert!(!op_matches(Op::StartsWith, &astring("foo"), &astring("food")));

        assert!(
            !op_matches(Op::StartsWith, &astring("Food"), &astring("foo")),
            "case sensitive"
        );
    }

    #[test]
    fn test_op_ends_with() {
        // degenerate cases
        assert!(op_matches(Op::EndsWith, &astring(""), &astring("")));
        assert!(op_matches(Op::EndsWith, &astring("a"), &astring("")));
        assert!(op_matches(Op::EndsWith, &astring("a"), &astring("a")));

        // test asymmetry
        assert!(op_matches(Op::EndsWith, &astring("food"), &astring("ood")));
        assert!(!op_matches(Op::EndsWith, &astring("ood"), &astring("food")));

        assert!(
            !op_matches(Op::EndsWith, &astring("FOOD"), &astring("ood")),
            "case sensitive"
        );
    }

    #[test]
    fn test_op_contains() {
        // degenerate cases
        assert!(op_matches(Op::Contains, &astring(""), &astring("")));
        assert!(op_matches(Op::Contains, &astring("a"), &astring("")));
        assert!(op_matches(Op::Contains, &astring("a"), &astring("a")));

        // test asymmetry
        assert!(op_matches(Op::Contains, &astring("food"), &astring("oo")));
        assert!(!op_matches(Op::Contains, &astring("oo"), &astring("food")));

        assert!(
            !op_matches(Op::Contains, &astring("FOOD"), &astring("oo")),
            "case sensitive"
        );
    }

    #[test]
    fn test_op_matches() {
        fn should_match(text: &str, pattern: &str) {
            assert!(
                op_matches(Op::Matches, &astring(text), &astring(pattern)),
                "`{}` should match `{}`",
                text,
                pattern
            );
        }

        fn should_not_match(text: &str, pattern: &str) {
            assert!(
                !op_matches(Op::Matches, &astring(text), &astring(pattern)),
                "`{}` should not match `{}`",
                text,
                pattern
            );
        }

        should_match("", "");
        should_match("a", "");
        should_match("a", "a");
        should_match("a", ".");
        should_match("hello world", "hello.*rld");
        should_match("hello world", "hello.*orl");
        should_match("hello world", "l+");
        should_match("hello world", "(world|planet)");

        should_not_match("", ".");
        should_not_match("", r"\");
        should_not_match("hello world", "aloha");
        should_not_match("hello world", "***bad regex");
    }

    #[test]
    fn test_ops_numeric() {
        // basic numeric comparisons
        assert!(op_matches(Op::LessThan, &anum(0.0), &anum(1.0)));
        assert!(!op_matches(Op::LessThan, &anum(0.0), &anum(0.0)));
        assert!(!op_matches(Op::LessThan, &anum(1.0), &anum(0.0)));

        assert!(op_matches(Op::GreaterThan, &anum(1.0), &anum(0.0)));
        assert!(!op_matches(Op::GreaterThan, &anum(0.0), &anum(0.0)));
        assert!(!op_matches(Op::GreaterThan, &anum(0.0), &anum(1.0)));

        assert!(op_matches(Op::LessThanOrEqual, &anum(0.0), &anum(1.0)));
        assert!(op_matches(Op::LessThanOrEqual, &anum(0.0), &anum(0.0)));
        assert!(!op_matches(Op::LessThanOrEqual, &anum(1.0), &anum(0.0)));

        assert!(op_matches(Op::GreaterThanOrEqual, &anum(1.0), &anum(0.0)));
        assert!(op_matches(Op::GreaterThanOrEqual, &anum(0.0), &anum(0.0)));
        assert!(!op_matches(Op::GreaterThanOrEqual, &anum(0.0), &anum(1.0)));

        // no conversions
        assert!(
            !op_matches(Op::LessThan, &astring("0"), &anum(1.0)),
            "numeric strings on LHS are not numbers"
        );
        assert!(
            !op_matches(Op::LessThan, &anum(0.0), &astring("1")),
            "numeric strings on RHS are not numbers"
        );
    }

    #[test]
    fn test_ops_time() {
        let today = SystemTime::now();
        let today_millis = today
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_millis() as f64;
        let yesterday_millis = today_millis - 86_400_000 as f64;

        // basic UNIX timestamp comparisons
        assert!(op_matches(Op::Before, &anum(yesterday_millis), &anum(today_millis)));
        assert!(!op_matches(Op::Before, &anum(today_millis), &anum(yesterday_millis)));
        assert!(!op_matches(Op::Before, &anum(today_millis), &anum(today_millis)));

        assert!(op_matches(Op::After, &anum(today_millis), &anum(yesterday_millis)));
        assert!(!op_matches(Op::After, &anum(yesterday_millis), &anum(today_millis)));
        assert!(!op_matches(Op::After, &anum(today_millis), &anum(today_millis)));

        // numeric strings are not timestamps
        assert!(!op_matches(
            Op::Before,
            &astring(&yesterday_millis.to_string()),
            &anum(today_millis)
        ));

        // date-formatted strings get parsed
        assert!(op_matches(
            Op::Before,
            &astring("2019-11-19T17:29:00.000000-07:00"),
            &anum(today_millis)
        ));
        assert!(
            op_matches(
                Op::Before,
                &astring("2019-11-19T17:29:00-07:00"),
                &anum(today_millis)
            ),
            "fractional seconds part is optional"
        );

        assert!(op_matches(
            Op::After,
            &anum(today_millis),
            &astring("2019-11-19T17:29:00.000000-07:00")
        ));

        // nonsense strings don't match
        assert!(!op_matches(Op::Before, &astring("fish"), &anum(today_millis)));
        assert!(!op_matches(Op::After, &anum(today_millis), &astring("fish")));
    }

    #[test]
    fn test_semver_ops() {
        assert!(op_matches(Op::SemVerEqual, &astring("2.0.0"), &astring("2.0.0")));

        assert!(
            op_matches(Op::SemVerEqual, &astring("2.0"), &astring("2.0.0")),
            "we allow missing components (filled in with zeroes)"
        );
        assert!(
            op_matches(Op::SemVerEqual, &astring("2"), &astring("2.0.0")),
            "we allow missing components (filled in with zeroes)"
        );

        assert!(!op_matches(Op::SemVerEqual, &astring("2.0.0"), &astring("3.0.0")));
        assert!(!op_matches(Op::SemVerEqual, &astring("2.0.0"), &astring("2.1.0")));
        assert!(!op_matches(Op::SemVerEqual, &astring("2.0.0"), &astring("2.0.1")));

        assert!(op_matches(Op::SemVerGreaterThan, &astring("3.0.0"), &astring("2.0.0")));
        assert!(op_matches(Op::SemVerGreaterThan, &astring("2.1.0"), &astring("2.0.0")));
        assert!(op_matches(Op::SemVerGreaterThan, &astring("2.0.1"), &astring("2.0.0")));
        assert!(op_matches(
            Op::SemVerGreaterThan,
            &astring("2.0.0-rc.10.green"),
            &astring("2.0.0-rc.2.green")
        ));
        assert!(
            op_matches(
                Op::SemVerGreaterThan,
                &astring("2.0.0-rc.2.red"),
                &astring("2.0.0-rc.2.green")
            ),
            "red > green"
        );
        assert!(
            op_matches(
                Op::SemVerGreaterThan,
                &astring("2.0.0-rc.2.green.1"),
                &astring("2.0.0-rc.2.green")
            ),
            "adding more version components makes it greater"
        );

        assert!(!op_matches(Op::SemVerGreaterThan, &astring("2.0.0"), &astring("2.0.0")));
        assert!(!op_matches(Op::SemVerGreaterThan, &astring("1.9.0"), &astring("2.0.0")));
        assert!(
            !op_matches(Op::SemVerGreaterThan, &astring("2.0.0-rc"), &astring("2.0.0")),
            "prerelease version < released version"
        );
        assert!(
            !op_matches(Op::SemVerGreaterThan, &astring("2.0.0+build"), &astring("2.0.0")),
            "build metadata is ignored, these versions are equal"
        );
        assert!(op_matches(Op::SemVerLessThan, &astring("1.9.9"), &astring("2.0.0")));

        assert!(!op_matches(Op::SemVerEqual, &astring("2.0.0"), &astring("200")));

        // we don't convert
        assert!(!op_matches(Op::SemVerEqual, &astring("2.0.0"), &anum(2.0)));
    }

    #[test_case("unsupportedOperator")]
    #[test_case("")]
    fn unknown_operators_never_match(name: &str) {
        let op = Op::from(name.to_string());
        assert_eq!(op, Op::Unknown(name.to_string()));
        assert!(!op_matches(op.clone(), &astring("x"), &astring("x")));

        let negated = Clause::new(None, Reference::new("a"), true, op, vec![astring("x")]);
        let context = ContextBuilder::new("key").set_value("a", "y").build().unwrap();
        assert!(
            clause_matches(&negated, &context),
            "a negated unknown operator matches like any other non-match"
        );
    }

    proptest! {
        #[test]
        fn operator_names_round_trip(name in "[a-zA-Z]{0,20}") {
            let op = Op::from(name.clone());
            prop_assert_eq!(String::from(op), name);
        }
    }

    #[test]
    fn test_clause_matches() {
        let one_val_clause = Clause::new(
            None,
            Reference::new("a"),
            false,
            Op::In,
            vec!["foo".into()],
        );
        let many_val_clause = Clause::new(
            None,
            Reference::new("a"),
            false,
            Op::In,
            vec!["foo".into(), "bar".into()],
        );
        let negated_clause = Clause::new(
            None,
            Reference::new("a"),
            true,
            Op::In,
            vec!["foo".into()],
        );
        let negated_many_val_clause = Clause::new(
            None,
            Reference::new("a"),
            true,
            Op::In,
            vec!["foo".into(), "bar".into()],
        );
        let key_clause = Clause::new(
            None,
            Reference::new("key"),
            false,
            Op::In,
            vec!["mu".into()],
        );

        let matching_context = ContextBuilder::new("mu").set_value("a", "foo").build().unwrap();
        let non_matching_context = ContextBuilder::new("nmu")
            .set_value("a", "lol")
            .build()
            .unwrap();
        let context_without_attr = ContextBuilder::new("uwa").build().unwrap();

        assert!(clause_matches(&one_val_clause, &matching_context));
        assert!(!clause_matches(&one_val_clause, &non_matching_context));
        assert!(!clause_matches(&one_val_clause, &context_without_attr));

        assert!(!clause_matches(&negated_clause, &matching_context));
        assert!(clause_matches(&negated_clause, &non_matching_context));

        assert!(
            !clause_matches(&negated_clause, &context_without_attr),
            "targeting missing attribute does not match even when negated"
        );

        assert!(
            clause_matches(&many_val_clause, &matching_context),
            "requires only one of the values"
        );
        assert!(!clause_matches(&many_val_clause, &non_matching_context));
        assert!(!clause_matches(&many_val_clause, &context_without_attr));

        assert!(
            !clause_matches(&negated_many_val_clause, &matching_context),
            "requires all values are missing"
        );
        assert!(clause_matches(&negated_many_val_clause, &non_matching_context));

        assert!(
            !clause_matches(&negated_many_val_clause, &context_without_attr),
            "targeting missing attribute does not match even when negated"
        );

        assert!(
            clause_matches(&key_clause, &matching_context),
            "should match key"
        );
        assert!(
            !clause_matches(&key_clause, &non_matching_context),
            "should not match non-matching key"
        );

        let context_with_many = ContextBuilder::new("uwm")
            .set_value("a", vec!["foo", "bar", "lol"])
            .build()
            .unwrap();

        assert!(clause_matches(&one_val_clause, &context_with_many));
        assert!(clause_matches(&many_val_clause, &context_with_many));

        assert!(!clause_matches(&negated_clause, &context_with_many));
        assert!(!clause_matches(&negated_many_val_clause, &context_with_many));
    }

    #[test]
    fn nested_collections_never_match() {
        let clause = Clause::new(None, Reference::new("a"), false, Op::In, vec!["foo".into()]);
        let negated = Clause::new(None, Reference::new("a"), true, Op::In, vec!["foo".into()]);

        let nested_array = ContextBuilder::new("key")
            .set_value(
                "a",
                AttributeValue::Array(vec!["foo".into(), AttributeValue::Array(vec![])]),
            )
            .build()
            .unwrap();
        // The first element matches before the nested array is reached.
        assert!(clause_matches(&clause, &nested_array));

        let nested_first = ContextBuilder::new("key")
            .set_value(
                "a",
                AttributeValue::Array(vec![AttributeValue::Array(vec![]), "foo".into()]),
            )
            .build()
            .unwrap();
        assert!(!clause_matches(&clause, &nested_first));
        assert!(!clause_matches(&negated, &nested_first));

        let object = ContextBuilder::new("key")
            .set_value("a", hashmap! {"foo" => "bar"})
            .build()
            .unwrap();
        assert!(!clause_matches(&clause, &object));
        assert!(!clause_matches(&negated, &object));
    }

    #[test]
    fn test_clause_matches_anonymous_attribute() {
        let clause = Clause::new(
            None,
            Reference::new("anonymous"),
            false,
            Op::In,
            vec![true.into()],
        );

        let anon_context = ContextBuilder::new("anon").anonymous(true).build().unwrap();
        let non_anon_context = ContextBuilder::new("nonanon")
            .anonymous(false)
            .build()
            .unwrap();
        let implicitly_non_anon_context = ContextBuilder::new("implicit").build().unwrap();

        assert!(clause_matches(&clause, &anon_context));
        assert!(!clause_matches(&clause, &non_anon_context));
        assert!(!clause_matches(&clause, &implicitly_non_anon_context));
    }

    #[test]
    fn test_clause_matches_custom_attributes() {
        for attr in ["custom", "custom1"] {
            let clause = Clause::new(
                None,
                Reference::new(attr),
                false,
                Op::In,
                vec!["match".into()],
            );

            let matching_context = ContextBuilder::new("mu")
                .set_value(attr, "match")
                .build()
                .unwrap();
            let non_matching_context = ContextBuilder::new("nmu")
                .set_value(attr, "nope")
                .build()
                .unwrap();
            let context_with_null = ContextBuilder::new("uwa")
                .set_value(attr, AttributeValue::Null)
                .build()
                .unwrap();

            assert!(
                clause_matches(&clause, &matching_context),
                "should match {}",
                attr
            );
            assert!(
                !clause_matches(&clause, &non_matching_context),
                "should not match non-matching {}",
                attr
            );
            assert!(
                !clause_matches(&clause, &context_with_null),
                "should not match context with null {}",
                attr
            );
        }
    }

    #[test]
    fn clause_reads_from_its_context_kind() {
        let clause = Clause::new_context_match("name", "Acme".into(), Kind::from("org"));

        let user = ContextBuilder::new("u").name("Acme").build().unwrap();
        let org = ContextBuilder::new("o")
            .kind("org")
            .name("Acme")
            .build()
            .unwrap();
        let multi = MultiContextBuilder::of(vec![user.clone(), org.clone()])
            .build()
            .unwrap();

        assert!(!clause_matches(&clause, &user));
        assert!(clause_matches(&clause, &org));
        assert!(clause_matches(&clause, &multi));
    }

    #[test]
    fn kind_clause_matches_any_kind_of_a_multi_context() {
        let clause: Clause = serde_json::from_value(json!({
            "attribute": "kind",
            "op": "in",
            "values": ["org"]
        }))
        .unwrap();

        let multi = MultiContextBuilder::of(vec![
            ContextBuilder::new("u").build().unwrap(),
            ContextBuilder::new("o").kind("org").build().unwrap(),
            ContextBuilder::new("d").kind("device").build().unwrap(),
        ])
        .build()
        .unwrap();
        let user = ContextBuilder::new("u").build().unwrap();

        assert!(clause_matches(&clause, &multi));
        assert!(!clause_matches(&clause, &user));

        let negated: Clause = serde_json::from_value(json!({
            "attribute": "kind",
            "op": "in",
            "values": ["org"],
            "negate": true
        }))
        .unwrap();
        assert!(!clause_matches(&negated, &multi));
        assert!(clause_matches(&negated, &user));
    }

    #[test]
    fn attribute_is_literal_without_context_kind() {
        let literal: Clause = serde_json::from_value(json!({
            "attribute": "/a/b",
            "op": "in",
            "values": ["x"]
        }))
        .unwrap();
        let path: Clause = serde_json::from_value(json!({
            "contextKind": "user",
            "attribute": "/a/b",
            "op": "in",
            "values": ["x"]
        }))
        .unwrap();

        let slashed_name = ContextBuilder::new("k").set_value("/a/b", "x").build().unwrap();
        let nested = ContextBuilder::new("k")
            .set_value("a", hashmap! {"b" => "x"})
            .build()
            .unwrap();

        assert!(clause_matches(&literal, &slashed_name));
        assert!(!clause_matches(&literal, &nested));
        assert!(clause_matches(&path, &nested));
        assert!(!clause_matches(&path, &slashed_name));
    }

    #[test]
    fn invalid_attribute_never_matches() {
        let clause: Clause = serde_json::from_value(json!({
            "contextKind": "user",
            "attribute": "//",
            "op": "in",
            "values": ["x"],
            "negate": true
        }))
        .unwrap();
        let context = ContextBuilder::new("k").build().unwrap();
        assert!(!clause_matches(&clause, &context));
    }

    #[test]
    fn clause_decodes_tolerantly_and_encodes_exactly() {
        let clause: Clause =
            serde_json::from_value(json!({"op": "in", "values": null, "extra": 1})).unwrap();
        assert_eq!(clause.op, Op::In);
        assert!(clause.values.is_empty());
        assert!(!clause.attribute.is_valid());

        let json = json!({
            "contextKind": "org",
            "attribute": "/address/city",
            "op": "startsWith",
            "values": ["Spring", 1, true, null],
            "negate": true
        });
        let clause: Clause = serde_json::from_value(json.clone()).unwrap();
        assert_json_eq!(serde_json::to_value(&clause).unwrap(), json);
    }

    #[test]
    fn rule_requires_all_clauses() {
        let rule: FlagRule = serde_json::from_value(json!({
            "id": "r",
            "variation": 0,
            "clauses": [
                {"attribute": "a", "op": "in", "values": ["x"]},
                {"attribute": "b", "op": "in", "values": ["y"]}
            ]
        }))
        .unwrap();

        let both = ContextBuilder::new("k")
            .set_value("a", "x")
            .set_value("b", "y")
            .build()
            .unwrap();
        let one = ContextBuilder::new("k").set_value("a", "x").build().unwrap();

        let mut stack = EvaluationStack::default();
        assert!(rule.matches(&both, &TestStore {}, &mut stack).unwrap());
        assert!(!rule.matches(&one, &TestStore {}, &mut stack).unwrap());
    }

    #[test]
    fn segment_match_for_missing_segment_is_false() {
        let rule = FlagRule::new_segment_match(vec!["missing"], Kind::user());
        let context = ContextBuilder::new("k").build().unwrap();
        let mut stack = EvaluationStack::default();
        assert!(!rule.matches(&context, &TestStore {}, &mut stack).unwrap());
        assert!(stack.segment_chain.is_empty());
    }
}
