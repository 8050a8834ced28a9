use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;
use thiserror::Error;

use crate::bucketing::big_segment_context_hash;
use crate::config::BigSegmentsConfig;

/// The big segments a single context belongs to, as recorded by a [BigSegmentStore].
///
/// Segments are identified by [crate::Segment::unbounded_segment_id].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Membership {
    included: HashSet<String>,
    excluded: HashSet<String>,
}

impl Membership {
    pub fn new<I, E>(included: I, excluded: E) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        Self {
            included: included.into_iter().map(Into::into).collect(),
            excluded: excluded.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns `Some(true)` if the context is included in the segment, `Some(false)` if it is
    /// excluded and `None` if the store says nothing about it. Inclusion takes precedence.
    pub fn check(&self, segment_ref: &str) -> Option<bool> {
        if self.included.contains(segment_ref) {
            Some(true)
        } else if self.excluded.contains(segment_ref) {
            Some(false)
        } else {
            None
        }
    }
}

/// Information about the state of a [BigSegmentStore].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoreMetadata {
    /// When the store was last synchronized with the service, if ever.
    pub last_up_to_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum BigSegmentStoreError {
    #[error("big segment store query failed: {0}")]
    Query(String),
}

/// A read-only view of the external database that holds big segment memberships.
pub trait BigSegmentStore: Send + Sync {
    /// Look up the memberships of the context whose key hashes to `context_hash`. `None` means
    /// the store holds no record for it.
    fn get_membership(&self, context_hash: &str)
        -> Result<Option<Membership>, BigSegmentStoreError>;

    fn get_metadata(&self) -> Result<Option<StoreMetadata>, BigSegmentStoreError>;
}

/// BigSegmentsStatus describes the state of the big segment store at the time an evaluation
/// consulted it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BigSegmentsStatus {
    /// The store was queried and its data is current.
    Healthy,
    /// The store was queried but has not been updated recently.
    Stale,
    /// A big segment was referenced but no store is configured.
    NotConfigured,
    /// The store could not be queried.
    StoreError,
}

/// Couples a [BigSegmentStore] with the configuration used to judge its health.
pub struct BigSegmentStoreWrapper {
    store: Arc<dyn BigSegmentStore>,
    config: BigSegmentsConfig,
}

impl BigSegmentStoreWrapper {
    pub fn new(store: Arc<dyn BigSegmentStore>, config: BigSegmentsConfig) -> Self {
        Self { store, config }
    }

    /// Reports whether the store is reachable and up to date.
    pub fn status(&self) -> BigSegmentsStatus {
        match self.store.get_metadata() {
            Err(e) => {
                warn!("{}", e);
                BigSegmentsStatus::StoreError
            }
            Ok(metadata) => match metadata.and_then(|m| m.last_up_to_date) {
                Some(last_up_to_date) if !self.is_stale(last_up_to_date) => {
                    BigSegmentsStatus::Healthy
                }
                _ => BigSegmentsStatus::Stale,
            },
        }
    }

    fn is_stale(&self, last_up_to_date: DateTime<Utc>) -> bool {
        let age = Utc::now().signed_duration_since(last_up_to_date);
        match age.to_std() {
            Ok(age) => age > self.config.stale_after,
            // in the future
            Err(_) => false,
        }
    }

    /// Fetch the memberships of the context with the given key.
    pub(crate) fn query(
        &self,
        context_key: &str,
    ) -> Result<(Option<Membership>, BigSegmentsStatus), BigSegmentStoreError> {
        let membership = self
            .store
            .get_membership(&big_segment_context_hash(context_key))?;
        Ok((membership, self.status()))
    }
}
