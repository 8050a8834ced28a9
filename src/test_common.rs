#![cfg(test)]

use crate::big_segments::{BigSegmentStore, BigSegmentStoreError, Membership, StoreMetadata};
use crate::bucketing::big_segment_context_hash;
use crate::flag::Flag;
use crate::segment::Segment;
use crate::store::Store;
use crate::PrerequisiteEvent;
use crate::PrerequisiteEventRecorder;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

pub struct TestStore {
    flags: HashMap<String, Arc<Flag>>,
    segments: HashMap<String, Arc<Segment>>,
}

impl TestStore {
    pub fn new() -> Self {
        Self::from_json(
            json!({
                "flag": {
                    "key": "flag",
                    "version": 42,
                    "on": false,
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                },
                "flagWithRuleExclusion": {
                    "key": "flag",
                    "version": 42,
                    "on": false,
                    "rules": [
                        {
                            "variation": 0,
                            "id": "6a7755ac-e47a-40ea-9579-a09dd5f061bd",
                            "clauses": [
                                {
                                    "attribute": "platform",
                                    "op": "in",
                                    "values": ["web", "aem", "ios"]
                                }
                            ],
                            "trackEvents": true
                        }
                    ],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty",
                    "trackEventsFallthrough": true,
                    "debugEventsUntilDate": 1500000000
                },
                "flagWithMatchesOpOnGroups": {
                    "key": "flagWithMatchesOpOnGroups",
                    "version": 42,
                    "on": true,
                    "rules": [
                        {
                            "variation": 0,
                            "id": "6a7755ac-e47a-40ea-9579-a09dd5f061bd",
                            "clauses": [{"attribute": "groups", "op": "matches", "values": ["^\\w+"]}],
                            "trackEvents": true
                        }
                    ],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty",
                    "trackEventsFallthrough": true,
                    "debugEventsUntilDate": 1500000000
                },
                "flagWithMatchesOpOnKinds": {
                    "key": "flagWithMatchesOpOnKinds",
                    "version": 42,
                    "on": true,
                    "rules": [
                        {
                            "variation": 0,
                            "id": "6a7755ac-e47a-40ea-9579-a09dd5f061bd",
                            "clauses": [{"attribute": "kind", "op": "matches", "values": ["^[ou]"]}],
                            "trackEvents": true
                        }
                    ],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty",
                    "trackEventsFallthrough": true,
                    "debugEventsUntilDate": 1500000000
                },
                "flagWithMatchesOpOnKindsAttributeReference": {
                    "key": "flagWithMatchesOpOnKindsAttributeReference",
                    "version": 42,
                    "on": true,
                    "rules": [
                        {
                            "variation": 0,
                            "id": "6a7755ac-e47a-40ea-9579-a09dd5f061bd",
                            "clauses": [
                                {
                                    "attribute": "/kind",
                                    "op": "matches",
                                    "values": ["^[ou]"],
                                    "contextKind": "arbitrary"
                                }
                            ],
                            "trackEvents": true
                        }
                    ],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty",
                    "trackEventsFallthrough": true,
                    "debugEventsUntilDate": 1500000000
                },
                "flagWithMatchesOpOnKindsPlainAttributeReference": {
                    "key": "flagWithMatchesOpOnKindsPlainAttributeReference",
                    "version": 42,
                    "on": true,
                    "rules": [
                        {
                            "variation": 0,
                            "id": "6a7755ac-e47a-40ea-9579-a09dd5f061bd",
                            "clauses": [
                                {
                                    "attribute": "kind",
                                    "op": "matches",
                                    "values": ["^[ou]"],
                                    "contextKind": "arbitrary"
                                }
                            ],
                            "trackEvents": true
                        }
                    ],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty",
                    "trackEventsFallthrough": true,
                    "debugEventsUntilDate": 1500000000
                },
                "flagWithExperiment": {
                    "key": "flagWithExperiment",
                    "version": 42,
                    "on": true,
                    "fallthrough": {
                        "rollout": {
                            "kind": "experiment",
                            "seed": 61,
                            "variations": [
                                {"variation": 0, "weight": 10000, "untracked": false},
                                {"variation": 1, "weight": 20000, "untracked": false},
                                {"variation": 0, "weight": 70000, "untracked": true}
                            ]
                        }
                    },
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty",
                    "trackEventsFallthrough": false,
                    "debugEventsUntilDate": 1500000000
                },
                "flagWithExperimentTargetingContext": {
                    "key": "flagWithExperimentTargetingContext",
                    "version": 42,
                    "on": true,
                    "fallthrough": {
                        "rollout": {
                            "kind": "experiment",
                            "contextKind": "org",
                            "seed": 61,
                            "variations": [
                                {"variation": 0, "weight": 10000, "untracked": false},
                                {"variation": 1, "weight": 20000, "untracked": false},
                                {"variation": 0, "weight": 70000, "untracked": true}
                            ]
                        }
                    },
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty",
                    "trackEventsFallthrough": false,
                    "debugEventsUntilDate": 1500000000
                },
                "flagWithRolloutBucketBy": {
                    "key": "rollout",
                    "on": true,
                    "rules": [
                        {
                            "rollout": {
                                "variations": [
                                    {"variation": 0, "weight": 50000},
                                    {"variation": 1, "weight": 50000},
                                    {"variation": 2, "weight": 0}
                                ],
                                "bucketBy": "ld_quid"
                            },
                            "id": "6a7755ac-e47a-40ea-9579-a09dd5f061bd",
                            "clauses": [
                                {
                                    "attribute": "platform",
                                    "op": "in",
                                    "values": ["web", "aem", "ios"]
                                }
                            ]
                        }
                    ],
                    "fallthrough": {"variation": 2},
                    "offVariation": 1,
                    "variations": ["rollout1", "rollout2", "rollout3"],
                    "salt": "ce2634f116d741a7ad1b7ef363f6f9bc",
                    "trackEventsFallthrough": false,
                    "debugEventsUntilDate": null,
                    "version": 7
                },
                "flagWithTarget": {
                    "key": "flagWithTarget",
                    "version": 42,
                    "on": false,
                    "targets": [{"values": ["bob"], "variation": 0}],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                },
                "flagWithContextTarget": {
                    "key": "flagWithContextTarget",
                    "version": 42,
                    "on": true,
                    "targets": [{"values": ["bob"], "variation": 1}],
                    "contextTargets": [
                        {"contextKind": "org", "values": ["LaunchDarkly"], "variation": 1},
                        {"contextKind": "user", "variation": 1}
                    ],
                    "fallthrough": {"variation": 0},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                },
                "flagWithMissingPrereq": {
                    "key": "flagWithMissingPrereq",
                    "version": 42,
                    "on": true,
                    "prerequisites": [{"key": "badPrereq", "variation": 1}],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                },
                "flagWithOffPrereq": {
                    "key": "flagWithOffPrereq",
                    "version": 42,
                    "on": true,
                    "prerequisites": [{"key": "offPrereq", "variation": 1}],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                },
                "flagWithFirstPrereqAsPrereqToSecondPrereq": {
                    "key": "flagWithFirstPrereqAsPrereqToSecondPrereq",
                    "version": 42,
                    "on": true,
                    "prerequisites": [
                        {"key": "prereq", "variation": 1},
                        {"key": "flagWithSatisfiedPrereq", "variation": 1}
                    ],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                },
                "flagWithNestedPrereq": {
                    "key": "flagWithNestedPrereq",
                    "version": 42,
                    "on": true,
                    "prerequisites": [{"key": "flagWithSatisfiedPrereq", "variation": 1}],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                },
                "flagWithSatisfiedPrereq": {
                    "key": "flagWithSatisfiedPrereq",
                    "version": 42,
                    "on": true,
                    "prerequisites": [{"key": "prereq", "variation": 1}],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                },
                "prereq": {
                    "key": "prereq",
                    "version": 42,
                    "on": true,
                    "targets": [{"values": ["bob"], "variation": 0}],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                },
                "offPrereq": {
                    "key": "offPrereq",
                    "version": 42,
                    "on": false,
                    "fallthrough": {"variation": 1},
                    "offVariation": 1,
                    "variations": [false, true],
                    "salt": "salty"
                },
                "flagWithInRule": {
                    "key": "flagWithInRule",
                    "version": 42,
                    "on": false,
                    "rules": [
                        {
                            "id": "in-rule",
                            "clauses": [{"attribute": "team", "op": "in", "values": ["Avengers"]}],
                            "variation": 0
                        }
                    ],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                },
                "flagWithSegmentMatchRule": {
                    "key": "flagWithSegmentMatchRule",
                    "version": 42,
                    "on": true,
                    "rules": [
                        {
                            "id": "match-rule",
                            "clauses": [
                                {
                                    "contextKind": "user",
                                    "attribute": "key",
                                    "op": "segmentMatch",
                                    "values": ["segment"]
                                }
                            ],
                            "variation": 0
                        }
                    ],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                },
                "flagWithPrereqWhichDuplicatesSegmentRuleCheck": {
                    "key": "flagWithPrereqWhichDuplicatesSegmentRuleCheck",
                    "version": 42,
                    "on": true,
                    "rules": [
                        {
                            "id": "match-rule",
                            "clauses": [
                                {
                                    "contextKind": "user",
                                    "attribute": "key",
                                    "op": "segmentMatch",
                                    "values": ["segment"]
                                }
                            ],
                            "variation": 0
                        }
                    ],
                    "prerequisites": [{"key": "flagWithSegmentMatchRule", "variation": 0}],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                },
                "flagWithMalformedRule": {
                    "key": "flagWithMalformedRule",
                    "version": 42,
                    "on": false,
                    "rules": [
                        {
                            "id": "in-rule",
                            "clauses": [{"attribute": "key", "op": "in", "values": ["yes"]}]
                        }
                    ],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                }
            }),
            json!({
                "segment": {
                    "key": "segment",
                    "included": ["alice"],
                    "includedContexts": [{"contextKind": "user"}],
                    "salt": "salty",
                    "version": 1
                }
            }),
        )
    }

    pub fn from_json(flags: Value, segments: Value) -> Self {
        let flags: HashMap<String, Flag> = serde_json::from_value(flags).unwrap();
        let segments: HashMap<String, Segment> = serde_json::from_value(segments).unwrap();
        Self {
            flags: flags.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
            segments: segments.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
        }
    }

    pub fn update_flag(&mut self, flag_key: &str, fun: fn(&mut Flag) -> ()) {
        let flag = self.flags.get_mut(flag_key).unwrap();
        fun(Arc::make_mut(flag));
    }

    /// An owned copy of a flag, for tests that modify it before evaluating.
    pub fn flag_copy(&self, flag_key: &str) -> Flag {
        self.flags.get(flag_key).map(|f| (**f).clone()).unwrap()
    }
}

impl Store for TestStore {
    fn flag(&self, flag_key: &str) -> Option<Arc<Flag>> {
        self.flags.get(flag_key).cloned()
    }

    fn segment(&self, segment_key: &str) -> Option<Arc<Segment>> {
        self.segments.get(segment_key).cloned()
    }
}

pub struct InMemoryPrerequisiteEventRecorder {
    pub events: RefCell<Vec<PrerequisiteEvent>>,
}

impl PrerequisiteEventRecorder for InMemoryPrerequisiteEventRecorder {
    fn record(&self, event: PrerequisiteEvent) {
        self.events.borrow_mut().push(event);
    }
}

/// A big segment store backed by a map from context hash to membership.
pub struct TestBigSegmentStore {
    memberships: Mutex<HashMap<String, Membership>>,
    last_up_to_date: Mutex<Option<DateTime<Utc>>>,
    unavailable: Mutex<bool>,
    pub queries: Mutex<usize>,
}

impl TestBigSegmentStore {
    pub fn new() -> Self {
        Self {
            memberships: Mutex::new(HashMap::new()),
            last_up_to_date: Mutex::new(Some(Utc::now())),
            unavailable: Mutex::new(false),
            queries: Mutex::new(0),
        }
    }

    pub fn set_membership(&self, context_key: &str, membership: Membership) {
        self.memberships
            .lock()
            .insert(big_segment_context_hash(context_key), membership);
    }

    pub fn set_last_up_to_date(&self, last_up_to_date: Option<DateTime<Utc>>) {
        *self.last_up_to_date.lock() = last_up_to_date;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    fn check_available(&self) -> Result<(), BigSegmentStoreError> {
        if *self.unavailable.lock() {
            return Err(BigSegmentStoreError::Query("store is down".into()));
        }
        Ok(())
    }
}

impl BigSegmentStore for TestBigSegmentStore {
    fn get_membership(
        &self,
        context_hash: &str,
    ) -> Result<Option<Membership>, BigSegmentStoreError> {
        *self.queries.lock() += 1;
        self.check_available()?;
        Ok(self.memberships.lock().get(context_hash).cloned())
    }

    fn get_metadata(&self) -> Result<Option<StoreMetadata>, BigSegmentStoreError> {
        self.check_available()?;
        Ok(Some(StoreMetadata {
            last_up_to_date: *self.last_up_to_date.lock(),
        }))
    }
}
