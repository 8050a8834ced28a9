use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{serde_as, DefaultOnNull};

use crate::bucketing::BucketPrefix;
use crate::contexts::attribute_reference::Reference;
use crate::contexts::context::{Context, Kind};
use crate::util::serialize_weight;

pub type VariationIndex = usize;

#[derive(Debug, PartialEq)]
pub(crate) struct BucketResult {
    pub variation_index: VariationIndex,
    pub in_experiment: bool,
}

impl From<&VariationIndex> for BucketResult {
    fn from(variation_index: &VariationIndex) -> Self {
        BucketResult {
            variation_index: *variation_index,
            in_experiment: false, // single variations are never in an experiment
        }
    }
}

/// RolloutKind describes whether a rollout is a plain percentage rollout or an experiment.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum RolloutKind {
    /// Rollout is the default kind, used for any value other than "experiment".
    #[default]
    Rollout,
    /// Experiment buckets by key only, and reports whether the result was part of the experiment.
    Experiment,
}

impl RolloutKind {
    fn is_rollout(&self) -> bool {
        *self == RolloutKind::Rollout
    }
}

impl Serialize for RolloutKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            RolloutKind::Rollout => serializer.serialize_str("rollout"),
            RolloutKind::Experiment => serializer.serialize_str("experiment"),
        }
    }
}

impl<'de> Deserialize<'de> for RolloutKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let kind = Option::<String>::deserialize(deserializer)?;
        Ok(match kind.as_deref() {
            Some("experiment") => RolloutKind::Experiment,
            _ => RolloutKind::Rollout,
        })
    }
}

/// Rollout describes how contexts are split across variations by percentage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "RolloutRepr", into = "RolloutRepr")]
pub struct Rollout {
    pub(crate) kind: RolloutKind,
    pub(crate) context_kind: Option<Kind>,
    pub(crate) bucket_by: Option<Reference>,
    pub(crate) variations: Vec<WeightedVariation>,
    pub(crate) seed: Option<i64>,
}

#[serde_as]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RolloutRepr {
    #[serde(default, skip_serializing_if = "RolloutKind::is_rollout")]
    kind: RolloutKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    context_kind: Option<Kind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bucket_by: Option<String>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    variations: Vec<WeightedVariation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
}

impl From<RolloutRepr> for Rollout {
    fn from(repr: RolloutRepr) -> Self {
        let has_context_kind = repr.context_kind.is_some();
        Rollout {
            kind: repr.kind,
            context_kind: repr.context_kind,
            bucket_by: repr
                .bucket_by
                .map(|attr| Reference::from_attribute(attr, has_context_kind)),
            variations: repr.variations,
            seed: repr.seed,
        }
    }
}

impl From<Rollout> for RolloutRepr {
    fn from(rollout: Rollout) -> Self {
        RolloutRepr {
            kind: rollout.kind,
            context_kind: rollout.context_kind,
            bucket_by: rollout.bucket_by.map(String::from),
            variations: rollout.variations,
            seed: rollout.seed,
        }
    }
}

impl Rollout {
    #[cfg(test)]
    fn with_variations<V: Into<Vec<WeightedVariation>>>(variations: V) -> Self {
        Rollout {
            kind: RolloutKind::Rollout,
            context_kind: None,
            bucket_by: None,
            seed: None,
            variations: variations.into(),
        }
    }

    fn bucket(
        &self,
        flag_key: &str,
        context: &Context,
        salt: &str,
    ) -> Result<Option<BucketResult>, String> {
        let is_experiment = self.kind == RolloutKind::Experiment;

        let prefix = match self.seed {
            Some(seed) => BucketPrefix::Seed(seed),
            None => BucketPrefix::KeyAndSalt(flag_key, salt),
        };

        let context_kind = self.context_kind.clone().unwrap_or_default();
        let (bucket, kind_missing) =
            context.bucket(&self.bucket_by, prefix, is_experiment, &context_kind)?;
        let is_experiment = is_experiment && !kind_missing;

        let mut sum = 0.0;
        for variation in &self.variations {
            sum += variation.weight / 100_000.0;
            if bucket < sum {
                return Ok(Some(variation.as_bucket_result(is_experiment)));
            }
        }

        // Weights that do not add up to 100000 leave a gap at the top of the range.
        Ok(self
            .variations
            .last()
            .map(|var| var.as_bucket_result(is_experiment)))
    }
}

/// VariationOrRollout is either a fixed variation index or a percentage rollout.
///
/// Data errors may produce rules with neither or both of a variation and a rollout. Neither decodes
/// to [VariationOrRollout::Malformed]; when both are present the variation wins.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "VariationOrRolloutRepr", into = "VariationOrRolloutRepr")]
pub enum VariationOrRollout {
    Variation {
        variation: VariationIndex,
    },
    Rollout {
        rollout: Rollout,
    },
    #[default]
    Malformed,
}

#[derive(Serialize, Deserialize)]
struct VariationOrRolloutRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    variation: Option<VariationIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rollout: Option<Rollout>,
}

impl From<VariationOrRolloutRepr> for VariationOrRollout {
    fn from(repr: VariationOrRolloutRepr) -> Self {
        match (repr.variation, repr.rollout) {
            (Some(variation), _) => VariationOrRollout::Variation { variation },
            (None, Some(rollout)) => VariationOrRollout::Rollout { rollout },
            (None, None) => VariationOrRollout::Malformed,
        }
    }
}

impl From<VariationOrRollout> for VariationOrRolloutRepr {
    fn from(vr: VariationOrRollout) -> Self {
        match vr {
            VariationOrRollout::Variation { variation } => VariationOrRolloutRepr {
                variation: Some(variation),
                rollout: None,
            },
            VariationOrRollout::Rollout { rollout } => VariationOrRolloutRepr {
                variation: None,
                rollout: Some(rollout),
            },
            VariationOrRollout::Malformed => VariationOrRolloutRepr {
                variation: None,
                rollout: None,
            },
        }
    }
}

pub(crate) type VariationWeight = f32;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct WeightedVariation {
    pub variation: VariationIndex,
    #[serde(serialize_with = "serialize_weight")]
    pub weight: VariationWeight,
    #[serde(default, skip_serializing_if = "crate::util::is_false")]
    pub untracked: bool,
}

impl WeightedVariation {
    #[cfg(test)]
    fn new(variation: VariationIndex, weight: VariationWeight) -> Self {
        WeightedVariation {
            variation,
            weight,
            untracked: false,
        }
    }

    fn as_bucket_result(&self, is_experiment: bool) -> BucketResult {
        BucketResult {
            variation_index: self.variation,
            in_experiment: is_experiment && !self.untracked,
        }
    }
}

impl VariationOrRollout {
    /// Resolves the variation for a context. `Ok(None)` means the data names no usable
    /// variation; `Err` means a rollout's bucketing attribute reference is invalid.
    pub(crate) fn variation(
        &self,
        flag_key: &str,
        context: &Context,
        salt: &str,
    ) -> Result<Option<BucketResult>, String> {
        match self {
            VariationOrRollout::Variation { variation: var } => Ok(Some(var.into())),
            VariationOrRollout::Rollout { rollout } => rollout.bucket(flag_key, context, salt),
            VariationOrRollout::Malformed => Ok(None),
        }
    }
}
