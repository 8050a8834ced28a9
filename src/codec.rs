//! JSON encoding of flags and segments, and decoding of the payloads carried by stream events.

use std::collections::HashMap;

use log::warn;
use serde::Deserialize;
use serde_with::{serde_as, DefaultOnNull};
use thiserror::Error;

use crate::flag::Flag;
use crate::segment::Segment;
use crate::store::{AllData, DataKind, ItemDescriptor};

pub const PUT_EVENT: &str = "put";
pub const PATCH_EVENT: &str = "patch";
pub const DELETE_EVENT: &str = "delete";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to decode {entity}: {source}")]
    Decode {
        entity: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {entity}: {source}")]
    Encode {
        entity: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl CodecError {
    fn decode(entity: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| CodecError::Decode { entity, source }
    }

    fn encode(entity: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| CodecError::Encode { entity, source }
    }
}

pub fn decode_flag(json: &str) -> Result<Flag, CodecError> {
    serde_json::from_str(json).map_err(CodecError::decode("flag"))
}

pub fn encode_flag(flag: &Flag) -> Result<String, CodecError> {
    serde_json::to_string(flag).map_err(CodecError::encode("flag"))
}

pub fn decode_segment(json: &str) -> Result<Segment, CodecError> {
    serde_json::from_str(json).map_err(CodecError::decode("segment"))
}

pub fn encode_segment(segment: &Segment) -> Result<String, CodecError> {
    serde_json::to_string(segment).map_err(CodecError::encode("segment"))
}

#[derive(Deserialize)]
struct PutData {
    #[serde(default)]
    path: Option<String>,
    data: PutPayload,
}

#[serde_as]
#[derive(Deserialize)]
struct PutPayload {
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    flags: HashMap<String, Flag>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    segments: HashMap<String, Segment>,
}

#[derive(Deserialize)]
struct PatchData {
    path: String,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct DeleteData {
    path: String,
    version: u64,
}

/// A change to apply to the data store, decoded from a single stream event.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreUpdate {
    /// Replace the whole data set.
    Init(AllData),
    /// Insert, replace or delete one item, subject to version gating.
    Upsert {
        kind: DataKind,
        key: String,
        item: ItemDescriptor,
    },
}

/// Decode the payload of a stream event.
///
/// Returns `Ok(None)` for events that carry nothing to apply: unknown event names, and paths
/// that name neither flags nor segments. A payload that fails to decode, including an item
/// without a version, is an error.
pub fn parse_event(event_name: &str, data: &str) -> Result<Option<StoreUpdate>, CodecError> {
    match event_name {
        PUT_EVENT => {
            let put: PutData = serde_json::from_str(data).map_err(CodecError::decode("put"))?;
            if let Some(path) = put.path.as_deref().filter(|path| *path != "/") {
                warn!("Received put event with unknown path: {}", path);
                return Ok(None);
            }
            Ok(Some(StoreUpdate::Init(AllData {
                flags: put
                    .data
                    .flags
                    .into_iter()
                    .map(|(key, flag)| (key, ItemDescriptor::flag(flag)))
                    .collect(),
                segments: put
                    .data
                    .segments
                    .into_iter()
                    .map(|(key, segment)| (key, ItemDescriptor::segment(segment)))
                    .collect(),
            })))
        }
        PATCH_EVENT => {
            let patch: PatchData =
                serde_json::from_str(data).map_err(CodecError::decode("patch"))?;
            let (kind, key) = match parse_path(&patch.path) {
                Some(parsed) => parsed,
                None => {
                    warn!("Received patch event with unknown path: {}", patch.path);
                    return Ok(None);
                }
            };
            let item = match kind {
                DataKind::Flags => ItemDescriptor::flag(
                    serde_json::from_value(patch.data).map_err(CodecError::decode("flag"))?,
                ),
                DataKind::Segments => ItemDescriptor::segment(
                    serde_json::from_value(patch.data).map_err(CodecError::decode("segment"))?,
                ),
            };
            Ok(Some(StoreUpdate::Upsert {
                kind,
                key: key.to_string(),
                item,
            }))
        }
        DELETE_EVENT => {
            let delete: DeleteData =
                serde_json::from_str(data).map_err(CodecError::decode("delete"))?;
            match parse_path(&delete.path) {
                Some((kind, key)) => Ok(Some(StoreUpdate::Upsert {
                    kind,
                    key: key.to_string(),
                    item: ItemDescriptor::tombstone(delete.version),
                })),
                None => {
                    warn!("Received delete event with unknown path: {}", delete.path);
                    Ok(None)
                }
            }
        }
        _ => Ok(None),
    }
}

fn parse_path(path: &str) -> Option<(DataKind, &str)> {
    [DataKind::Flags, DataKind::Segments]
        .into_iter()
        .find_map(|kind| {
            path.strip_prefix('/')?
                .strip_prefix(kind.namespace())?
                .strip_prefix('/')
                .map(|key| (kind, key))
        })
        .filter(|(_, key)| !key.is_empty())
}
