use log::warn;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};

use crate::contexts::context::{Context, Kind};
use crate::eval::{self, Detail, Reason};
use crate::flag_value::FlagValue;
use crate::rule::FlagRule;
use crate::util::is_false;
use crate::variation::{BucketResult, VariationIndex, VariationOrRollout};

/// Flag describes an individual feature flag.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    /// The unique string key of the feature flag.
    pub key: String,
    /// Version is an integer that is incremented by LaunchDarkly every time the configuration of
    /// the flag is changed.
    pub version: u64,

    #[serde(default)]
    pub(crate) on: bool,

    /// A list of context keys that are targeted for particular variations. Only applies to
    /// contexts of kind "user".
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub(crate) targets: Vec<Target>,
    /// Targets by context kind. An entry of kind "user" with no values stands in for the legacy
    /// target list with the same variation, marking where it is checked.
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub(crate) context_targets: Vec<Target>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub(crate) rules: Vec<FlagRule>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub(crate) prerequisites: Vec<Prereq>,

    #[serde(default)]
    pub(crate) fallthrough: VariationOrRollout,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) off_variation: Option<VariationIndex>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    variations: Vec<FlagValue>,

    #[serde(default, skip_serializing_if = "is_false")]
    client_side: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_side_availability: Option<ClientSideAvailability>,

    #[serde(default)]
    salt: String,

    /// Used internally by the SDK analytics event system.
    ///
    /// This field is true if the current LaunchDarkly account has data export enabled, and has
    /// turned on the "send detailed event information for this flag" option for this flag. This
    /// tells the SDK to send full event data for each flag evaluation, rather than only aggregate
    /// data in a summary event.
    #[serde(default, skip_serializing_if = "is_false")]
    pub track_events: bool,
    /// Used internally by the SDK analytics event system.
    ///
    /// This field is true if the current LaunchDarkly account has experimentation enabled, has
    /// associated this flag with an experiment, and has enabled "default rule" for the
    /// experiment. This tells the SDK to send full event data for any evaluation where this flag
    /// had targeting turned on but the context did not match any targets or rules.
    #[serde(default, skip_serializing_if = "is_false")]
    pub track_events_fallthrough: bool,
    /// Used internally by the SDK analytics event system.
    ///
    /// This field is non-zero if debugging for this flag has been turned on temporarily in the
    /// LaunchDarkly dashboard. Debugging always is for a limited time, so the field specifies a
    /// Unix millisecond timestamp when this mode should expire. Until then, the SDK will send full
    /// event data for each evaluation of this flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
    /// Controls how often evaluations of this flag are sampled into analytics events; 1 out of
    /// every `sampling_ratio` evaluations is kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_ratio: Option<u32>,
    /// Keeps evaluations of this flag out of summary events.
    #[serde(default, skip_serializing_if = "is_false")]
    pub exclude_from_summaries: bool,
    /// Settings that only apply to migration flags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationFlagParameters>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

/// Prereq describes a requirement that another feature flag return a specific variation.
///
/// A prerequisite condition is met if the specified prerequisite flag has targeting turned on and
/// returns the specified variation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prereq {
    /// The key of the feature flag to be evaluated as a prerequisite.
    pub key: String,
    /// The index of the variation that the prerequisite flag must return.
    pub variation: VariationIndex,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Target {
    #[serde(default, skip_serializing_if = "Kind::is_user")]
    pub(crate) context_kind: Kind,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub(crate) values: Vec<String>,
    pub(crate) variation: VariationIndex,
}

/// ClientSideAvailability describes which client-side SDKs may evaluate a flag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSideAvailability {
    #[serde(default)]
    pub using_mobile_key: bool,
    #[serde(default)]
    pub using_environment_id: bool,
}

/// Parameters of a migration flag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationFlagParameters {
    /// Controls how often consistency checks are run; 1 out of every `check_ratio` operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_ratio: Option<u32>,
}

impl Flag {
    /// Returns the variation at `index` with the given reason, or a malformed flag error if the
    /// index is out of range.
    pub fn variation(&self, index: VariationIndex, reason: Reason) -> Detail<&FlagValue> {
        Detail {
            value: self.variations.get(index),
            variation_index: Some(index),
            reason,
            big_segments_status: None,
        }
        .should_have_value(eval::Error::MalformedFlag)
    }

    /// Returns the off variation, or no value at all if the flag has none.
    pub fn off_value(&self, reason: Reason) -> Detail<&FlagValue> {
        match self.off_variation {
            Some(index) => self.variation(index, reason),
            None => Detail::empty(reason),
        }
    }

    /// Whether client-side JavaScript SDKs may evaluate this flag.
    pub fn using_environment_id(&self) -> bool {
        match &self.client_side_availability {
            Some(availability) => availability.using_environment_id,
            None => self.client_side,
        }
    }

    /// Whether mobile SDKs may evaluate this flag. Flags from before availability was configurable
    /// are always available to them.
    pub fn using_mobile_key(&self) -> bool {
        match &self.client_side_availability {
            Some(availability) => availability.using_mobile_key,
            None => true,
        }
    }

    pub(crate) fn resolve_variation_or_rollout(
        &self,
        vr: &VariationOrRollout,
        context: &Context,
    ) -> Result<BucketResult, eval::Error> {
        match vr.variation(&self.key, context, &self.salt) {
            Ok(Some(result)) => Ok(result),
            Ok(None) => Err(eval::Error::MalformedFlag),
            Err(msg) => {
                warn!("flag {} has an invalid bucketBy: {}", self.key, msg);
                Err(eval::Error::MalformedFlag)
            }
        }
    }

    /// Returns true if evaluations with this reason should send full analytics events.
    pub fn is_experimentation_enabled(&self, reason: &Reason) -> bool {
        match reason {
            _ if reason.is_in_experiment() => true,
            Reason::Fallthrough { .. } => self.track_events_fallthrough,
            Reason::RuleMatch { rule_index, .. } => self
                .rules
                .get(*rule_index)
                .map(|rule| rule.track_events)
                .unwrap_or(false),
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_boolean_flag_with_segment_match(segment_keys: Vec<&str>, kind: Kind) -> Self {
        Self {
            key: "feature".to_string(),
            version: 1,
            on: true,
            targets: vec![],
            context_targets: vec![],
            rules: vec![FlagRule::new_segment_match(segment_keys, kind)],
            prerequisites: vec![],
            fallthrough: VariationOrRollout::Variation { variation: 0 },
            off_variation: Some(0),
            variations: vec![FlagValue::Bool(false), FlagValue::Bool(true)],
            client_side: false,
            client_side_availability: None,
            salt: "xyz".to_string(),
            track_events: false,
            track_events_fallthrough: false,
            debug_events_until_date: None,
            sampling_ratio: None,
            exclude_from_summaries: false,
            migration: None,
            deleted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::store::Store;
    use crate::test_common::TestStore;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;
    use spectral::prelude::*;

    use super::*;
    use crate::eval::Reason::*;
    use test_case::test_case;

    #[test_case(true)]
    #[test_case(false)]
    fn handles_old_flag_schema(client_side: bool) {
        let json = &format!(
            r#"{{
            "key": "flag",
            "version": 42,
            "on": false,
            "targets": [],
            "rules": [],
            "prerequisites": [],
            "fallthrough": {{"variation": 1}},
            "offVariation": 0,
            "variations": [false, true],
            "clientSide": {},
            "salt": "salty"
        }}"#,
            client_side
        );

        let flag: Flag = serde_json::from_str(json).unwrap();
        assert_that!(flag.client_side_availability).is_none();
        assert_eq!(flag.using_environment_id(), client_side);
        assert!(flag.using_mobile_key());
    }

    #[test_case(true)]
    #[test_case(false)]
    fn handles_new_flag_schema(using_environment_id: bool) {
        let json = &format!(
            r#"{{
            "key": "flag",
            "version": 42,
            "on": false,
            "targets": [],
            "rules": [],
            "prerequisites": [],
            "fallthrough": {{"variation": 1}},
            "offVariation": 0,
            "variations": [false, true],
            "clientSide": true,
            "clientSideAvailability": {{
                "usingEnvironmentId": {},
                "usingMobileKey": false
            }},
            "salt": "salty"
        }}"#,
            using_environment_id
        );

        let flag: Flag = serde_json::from_str(json).unwrap();
        assert_eq!(flag.using_environment_id(), using_environment_id);
        assert!(!flag.using_mobile_key());
    }

    #[test]
    fn minimal_flag_decodes_with_defaults() {
        let flag: Flag = serde_json::from_value(json!({
            "key": "flag",
            "version": 1,
            "targets": null,
            "unknownProperty": {"nested": true}
        }))
        .unwrap();

        assert!(!flag.on);
        assert_that!(flag.targets).is_empty();
        assert_that!(flag.context_targets).is_empty();
        assert_that!(flag.rules).is_empty();
        assert_that!(flag.prerequisites).is_empty();
        assert_that!(flag.variations).is_empty();
        assert_that!(flag.fallthrough).is_equal_to(VariationOrRollout::Malformed);
        assert_that!(flag.off_variation).is_none();
    }

    #[test]
    fn flag_without_version_is_rejected() {
        let result: Result<Flag, _> = serde_json::from_value(json!({"key": "flag", "on": true}));
        assert_that!(result).is_err();
    }

    #[test]
    fn flag_encodes_every_field_it_decodes() {
        let json = json!({
            "key": "flag",
            "version": 7,
            "on": true,
            "targets": [{"values": ["alice"], "variation": 0}],
            "contextTargets": [
                {"contextKind": "org", "values": ["acme"], "variation": 1},
                {"values": [], "variation": 0}
            ],
            "rules": [{
                "id": "rule-1",
                "clauses": [{"attribute": "name", "op": "in", "values": ["x"], "negate": false}],
                "rollout": {
                    "kind": "experiment",
                    "seed": 61,
                    "variations": [
                        {"variation": 0, "weight": 10000},
                        {"variation": 1, "weight": 90000, "untracked": true}
                    ]
                },
                "trackEvents": true
            }],
            "prerequisites": [{"key": "other", "variation": 1}],
            "fallthrough": {"variation": 1},
            "offVariation": 0,
            "variations": [false, true],
            "clientSide": true,
            "clientSideAvailability": {"usingMobileKey": true, "usingEnvironmentId": true},
            "salt": "salty",
            "trackEvents": true,
            "trackEventsFallthrough": true,
            "debugEventsUntilDate": 1500000000000u64,
            "samplingRatio": 10,
            "excludeFromSummaries": true,
            "migration": {"checkRatio": 5},
            "deleted": true
        });

        let flag: Flag = serde_json::from_value(json.clone()).unwrap();
        assert_json_eq!(serde_json::to_value(&flag).unwrap(), json);
    }

    #[test]
    fn off_value_out_of_range_is_malformed() {
        let mut flag = Flag::new_boolean_flag_with_segment_match(vec![], Kind::user());
        flag.off_variation = Some(5);
        let detail = flag.off_value(Off);
        assert_that!(detail.value).is_none();
        assert_that!(detail.reason).is_equal_to(Error {
            error: eval::Error::MalformedFlag,
        });
    }

    #[test]
    fn is_experimentation_enabled() {
        let store = TestStore::new();

        let flag = store.flag("flag").unwrap();
        asserting!("defaults to false")
            .that(&flag.is_experimentation_enabled(&Off))
            .is_false();
        asserting!("false for fallthrough if trackEventsFallthrough is false")
            .that(&flag.is_experimentation_enabled(&Fallthrough {
                in_experiment: false,
            }))
            .is_false();

        let flag = store.flag("flagWithRuleExclusion").unwrap();
        asserting!("true for fallthrough if trackEventsFallthrough is true")
            .that(&flag.is_experimentation_enabled(&Fallthrough {
                in_experiment: false,
            }))
            .is_true();
        asserting!("true for rule if rule.trackEvents is true")
            .that(&flag.is_experimentation_enabled(&RuleMatch {
                rule_index: 0,
                rule_id: flag.rules.first().unwrap().id.clone(),
                in_experiment: false,
            }))
            .is_true();

        let flag = store.flag("flagWithExperiment").unwrap();
        asserting!("true for fallthrough if reason says it is")
            .that(&flag.is_experimentation_enabled(&Fallthrough {
                in_experiment: true,
            }))
            .is_true();
        asserting!("false for fallthrough if reason says it is")
            .that(&flag.is_experimentation_enabled(&Fallthrough {
                in_experiment: false,
            }))
            .is_false();
        // note this flag doesn't even have a rule - doesn't matter, we go by the reason
        asserting!("true for rule if reason says it is")
            .that(&flag.is_experimentation_enabled(&RuleMatch {
                rule_index: 42,
                rule_id: "lol".into(),
                in_experiment: true,
            }))
            .is_true();
        asserting!("false for rule if reason says it is")
            .that(&flag.is_experimentation_enabled(&RuleMatch {
                rule_index: 42,
                rule_id: "lol".into(),
                in_experiment: false,
            }))
            .is_false();
    }
}
