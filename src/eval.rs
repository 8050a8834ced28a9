use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::big_segments::{BigSegmentStoreWrapper, BigSegmentsStatus, Membership};
use crate::contexts::context::Context;
use crate::flag::{Flag, Target};
use crate::flag_value::FlagValue;
use crate::store::Store;
use crate::variation::{BucketResult, VariationIndex};
use log::warn;
use serde::Serialize;

/// One prerequisite evaluation performed while evaluating `target_flag_key`.
pub struct PrerequisiteEvent {
    pub target_flag_key: String,
    pub context: Context,
    pub prerequisite_flag: Arc<Flag>,
    pub prerequisite_result: Detail<FlagValue>,
}

/// Receives a [PrerequisiteEvent] for every prerequisite [evaluate] visits, in evaluation order.
pub trait PrerequisiteEventRecorder {
    fn record(&self, event: PrerequisiteEvent);
}

const PREALLOCATED_PREREQUISITE_CHAIN_SIZE: usize = 20;
const PREALLOCATED_SEGMENT_CHAIN_SIZE: usize = 20;

/// State carried through a single evaluation: the flags and segments currently being visited, and
/// what has been learned from the big segment store so far.
pub(crate) struct EvaluationStack<'a> {
    pub(crate) prerequisite_flag_chain: HashSet<String>,
    pub(crate) segment_chain: HashSet<String>,
    big_segments: Option<&'a BigSegmentStoreWrapper>,
    // Keyed by context key; None when the store has no record for the context.
    big_segment_memberships: HashMap<String, Option<Membership>>,
    big_segments_status: Option<BigSegmentsStatus>,
    // Set once a prerequisite cycle is found; the whole evaluation then fails as malformed.
    prerequisite_cycle: bool,
}

impl<'a> EvaluationStack<'a> {
    fn new(big_segments: Option<&'a BigSegmentStoreWrapper>) -> Self {
        // Preallocate some space for prerequisite_flag_chain and segment_chain on the stack. We
        // can get up to that many levels of nested prerequisites or nested segments before
        // appending to the slice will cause a heap allocation.
        Self {
            prerequisite_flag_chain: HashSet::with_capacity(PREALLOCATED_PREREQUISITE_CHAIN_SIZE),
            segment_chain: HashSet::with_capacity(PREALLOCATED_SEGMENT_CHAIN_SIZE),
            big_segments,
            big_segment_memberships: HashMap::new(),
            big_segments_status: None,
            prerequisite_cycle: false,
        }
    }

    /// Keeps the first status that is not healthy.
    pub(crate) fn record_big_segments_status(&mut self, status: BigSegmentsStatus) {
        match self.big_segments_status {
            None | Some(BigSegmentsStatus::Healthy) => self.big_segments_status = Some(status),
            Some(_) => (),
        }
    }

    /// Looks up whether the context with `context_key` is explicitly included in or excluded from
    /// the big segment identified by `segment_ref`. The store is queried at most once per context
    /// key during an evaluation.
    pub(crate) fn check_big_segment_membership(
        &mut self,
        context_key: &str,
        segment_ref: &str,
    ) -> Result<Option<bool>, Error> {
        let wrapper = match self.big_segments {
            Some(wrapper) => wrapper,
            None => {
                self.record_big_segments_status(BigSegmentsStatus::NotConfigured);
                return Err(Error::BigSegmentsUnavailable);
            }
        };

        if !self.big_segment_memberships.contains_key(context_key) {
            match wrapper.query(context_key) {
                Ok((membership, status)) => {
                    self.record_big_segments_status(status);
                    self.big_segment_memberships
                        .insert(context_key.to_string(), membership);
                }
                Err(e) => {
                    warn!("big segment membership query failed: {}", e);
                    self.record_big_segments_status(BigSegmentsStatus::StoreError);
                    return Err(Error::BigSegmentsUnavailable);
                }
            }
        }

        Ok(self
            .big_segment_memberships
            .get(context_key)
            .and_then(Option::as_ref)
            .and_then(|membership| membership.check(segment_ref)))
    }
}

impl Default for EvaluationStack<'_> {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Evaluate a feature flag for the specified [Context].
///
/// The evaluator does not know anything about analytics events; generating any appropriate
/// analytics events is the responsibility of the caller. The caller can provide an optional
/// [PrerequisiteEventRecorder] which will be notified if any additional evaluations were done due
/// to prerequisites.
///
/// Flags that reference big segments evaluate with a [Reason::Error] of
/// [Error::BigSegmentsUnavailable]; use [evaluate_with_big_segments] to supply a store.
pub fn evaluate<'a>(
    store: &dyn Store,
    flag: &'a Flag,
    context: &Context,
    prerequisite_event_recorder: Option<&dyn PrerequisiteEventRecorder>,
) -> Detail<&'a FlagValue> {
    evaluate_with_big_segments(store, flag, context, None, prerequisite_event_recorder)
}

/// Evaluate a feature flag for the specified [Context], consulting `big_segments` for the
/// membership of any big segment the flag references.
pub fn evaluate_with_big_segments<'a>(
    store: &dyn Store,
    flag: &'a Flag,
    context: &Context,
    big_segments: Option<&BigSegmentStoreWrapper>,
    prerequisite_event_recorder: Option<&dyn PrerequisiteEventRecorder>,
) -> Detail<&'a FlagValue> {
    let mut evaluation_stack = EvaluationStack::new(big_segments);
    let mut detail = evaluate_internal(
        store,
        flag,
        context,
        prerequisite_event_recorder,
        &mut evaluation_stack,
    );
    detail.big_segments_status = evaluation_stack.big_segments_status;
    detail
}

fn evaluate_internal<'a>(
    store: &dyn Store,
    flag: &'a Flag,
    context: &Context,
    prerequisite_event_recorder: Option<&dyn PrerequisiteEventRecorder>,
    evaluation_stack: &mut EvaluationStack,
) -> Detail<&'a FlagValue> {
    if !flag.on {
        return flag.off_value(Reason::Off);
    }

    if evaluation_stack.prerequisite_flag_chain.contains(&flag.key) {
        warn!("prerequisite relationship to {} caused a circular reference; this is probably a temporary condition due to an incomplete update", flag.key);
        evaluation_stack.prerequisite_cycle = true;
        return Detail::err(Error::MalformedFlag);
    }

    evaluation_stack
        .prerequisite_flag_chain
        .insert(flag.key.clone());
    let prerequisite_failure = check_prerequisites(
        store,
        flag,
        context,
        prerequisite_event_recorder,
        evaluation_stack,
    );
    evaluation_stack.prerequisite_flag_chain.remove(&flag.key);

    if let Some(detail) = prerequisite_failure {
        return detail;
    }

    if let Some(variation_index) = any_target_match_variation(context, flag) {
        return flag.variation(variation_index, Reason::TargetMatch);
    }

    for (rule_index, rule) in flag.rules.iter().enumerate() {
        match rule.matches(context, store, evaluation_stack) {
            Err(e) => {
                warn!("rule {} of flag {} could not be evaluated: {:?}", rule_index, flag.key, e);
                return Detail::err(e);
            }
            Ok(true) => {
                let result = flag.resolve_variation_or_rollout(&rule.variation_or_rollout, context);
                return match result {
                    Ok(BucketResult {
                        variation_index,
                        in_experiment,
                    }) => {
                        let reason = Reason::RuleMatch {
                            rule_index,
                            rule_id: rule.id.clone(),
                            in_experiment,
                        };
                        flag.variation(variation_index, reason)
                    }
                    Err(e) => Detail::err(e),
                };
            }
            Ok(false) => (),
        }
    }

    let result = flag.resolve_variation_or_rollout(&flag.fallthrough, context);
    match result {
        Ok(BucketResult {
            variation_index,
            in_experiment,
        }) => {
            let reason = Reason::Fallthrough { in_experiment };
            flag.variation(variation_index, reason)
        }
        Err(e) => Detail::err(e),
    }
}

// Returns the result for `flag` if one of its prerequisites is not met.
fn check_prerequisites<'a>(
    store: &dyn Store,
    flag: &'a Flag,
    context: &Context,
    prerequisite_event_recorder: Option<&dyn PrerequisiteEventRecorder>,
    evaluation_stack: &mut EvaluationStack,
) -> Option<Detail<&'a FlagValue>> {
    for prereq in &flag.prerequisites {
        let prereq_flag = match store.flag(&prereq.key) {
            Some(prereq_flag) => prereq_flag,
            None => {
                return Some(flag.off_value(Reason::PrerequisiteFailed {
                    prerequisite_key: prereq.key.to_string(),
                }))
            }
        };

        let prerequisite_result = evaluate_internal(
            store,
            &prereq_flag,
            context,
            prerequisite_event_recorder,
            evaluation_stack,
        );

        if evaluation_stack.prerequisite_cycle {
            return Some(Detail::err(Error::MalformedFlag));
        }

        let variation_index = prerequisite_result.variation_index;

        if let Some(recorder) = prerequisite_event_recorder {
            recorder.record(PrerequisiteEvent {
                target_flag_key: flag.key.clone(),
                context: context.clone(),
                prerequisite_flag: prereq_flag.clone(),
                prerequisite_result: prerequisite_result.map(|v| v.clone()),
            });
        }

        if !prereq_flag.on || variation_index != Some(prereq.variation) {
            return Some(flag.off_value(Reason::PrerequisiteFailed {
                prerequisite_key: prereq.key.to_string(),
            }));
        }
    }

    None
}

fn any_target_match_variation(context: &Context, flag: &Flag) -> Option<VariationIndex> {
    if flag.context_targets.is_empty() {
        return flag
            .targets
            .iter()
            .find_map(|target| target_match_variation(context, target));
    }

    flag.context_targets.iter().find_map(|context_target| {
        if context_target.context_kind.is_user() && context_target.values.is_empty() {
            // placeholder for the legacy user targets of the same variation
            flag.targets
                .iter()
                .filter(|target| target.variation == context_target.variation)
                .find_map(|target| target_match_variation(context, target))
        } else {
            target_match_variation(context, context_target)
        }
    })
}

fn target_match_variation(context: &Context, target: &Target) -> Option<VariationIndex> {
    let key = context.as_kind(&target.context_kind)?.key();
    target
        .values
        .iter()
        .any(|value| value == key)
        .then_some(target.variation)
}

/// The outcome of [evaluate]: the served value together with why it was chosen.
#[derive(Clone, Debug, PartialEq)]
pub struct Detail<T> {
    /// The served variation, or None when evaluation failed and the flag offers no fallback.
    pub value: Option<T>,

    /// Position of [Detail::value] among the flag's variations. None whenever the value did not
    /// come from the flag.
    pub variation_index: Option<VariationIndex>,

    pub reason: Reason,

    /// Health of the big segment store, present only if a big segment was consulted.
    pub big_segments_status: Option<BigSegmentsStatus>,
}

impl<T> Detail<T> {
    /// A detail without a value, explained by `reason`.
    pub fn empty(reason: Reason) -> Detail<T> {
        Detail {
            value: None,
            variation_index: None,
            reason,
            big_segments_status: None,
        }
    }

    pub fn err(error: Error) -> Detail<T> {
        Detail::empty(Reason::Error { error })
    }

    pub fn map<U, F>(self, f: F) -> Detail<U>
    where
        F: FnOnce(T) -> U,
    {
        Detail {
            value: self.value.map(f),
            variation_index: self.variation_index,
            reason: self.reason,
            big_segments_status: self.big_segments_status,
        }
    }

    /// Turns a detail without a value into an error detail.
    pub fn should_have_value(mut self, e: Error) -> Detail<T> {
        if self.value.is_none() {
            self.reason = Reason::Error { error: e };
            self.variation_index = None;
        }
        self
    }

    /// Substitutes the caller's `default` when there is no value. The reason is kept, so callers
    /// can still tell why the default was served.
    pub fn or(mut self, default: T) -> Detail<T> {
        if self.value.is_none() {
            self.value = Some(default);
            self.variation_index = None;
        }
        self
    }
}

/// Why an evaluation produced its value. Serializes to the `{"kind": ...}` form used in
/// analytics events.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum Reason {
    /// The flag is off and served its off variation.
    Off,
    /// The context's key is listed in one of the flag's targets.
    TargetMatch,
    /// The context matched the rule at `rule_index`.
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        rule_index: usize,
        #[serde(skip_serializing_if = "String::is_empty")]
        rule_id: String,
        /// True when the variation came from an experiment rollout and was not marked untracked.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// A prerequisite was off, missing, or served a variation other than the required one.
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed { prerequisite_key: String },
    /// No target or rule matched, so the fallthrough was served.
    #[serde(rename_all = "camelCase")]
    Fallthrough {
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// The flag could not be evaluated.
    Error {
        #[serde(rename = "errorKind")]
        error: Error,
    },
}

impl Reason {
    pub fn is_in_experiment(&self) -> bool {
        match self {
            Reason::RuleMatch { in_experiment, .. } | Reason::Fallthrough { in_experiment } => {
                *in_experiment
            }
            _ => false,
        }
    }
}

/// The kind of failure reported by [Reason::Error].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Error {
    /// Evaluation was attempted before any flag data arrived.
    ClientNotReady,
    FlagNotFound,
    /// The flag data is inconsistent, e.g. it names a variation that does not exist or its
    /// prerequisites form a cycle.
    MalformedFlag,
    /// The served value does not have the type the caller asked for.
    WrongType,
    Exception,
    /// A big segment's membership could not be determined, because no big segment store is
    /// configured or the store failed.
    BigSegmentsUnavailable,
}
