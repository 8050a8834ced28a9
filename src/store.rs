use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use crate::flag::Flag;
use crate::segment::Segment;

/// Store is an interface for read access to the feature flags and segments an evaluation needs.
///
/// Every lookup hands out a shared reference to an immutable item, so a concurrent writer
/// replacing an item never affects an evaluation already holding the previous version.
pub trait Store {
    /// Retrieve the flag with key `flag_key`.
    fn flag(&self, flag_key: &str) -> Option<Arc<Flag>>;

    /// Retrieve the segment with key `segment_key`.
    fn segment(&self, segment_key: &str) -> Option<Arc<Segment>>;
}

/// The two namespaces of items held by a [DataStore].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataKind {
    Flags,
    Segments,
}

impl DataKind {
    /// The path segment used for this kind in stream payloads.
    pub fn namespace(&self) -> &'static str {
        match self {
            DataKind::Flags => "flags",
            DataKind::Segments => "segments",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StorageItem {
    Flag(Arc<Flag>),
    Segment(Arc<Segment>),
}

/// ItemDescriptor pairs an item with its version. A descriptor without an item is a tombstone:
/// the item was deleted, and the version is kept so that older updates are still rejected.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemDescriptor {
    pub version: u64,
    pub item: Option<StorageItem>,
}

impl ItemDescriptor {
    /// Wrap a flag, producing a tombstone if the flag is marked as deleted.
    pub fn flag(flag: Flag) -> Self {
        if flag.deleted {
            return Self::tombstone(flag.version);
        }
        Self {
            version: flag.version,
            item: Some(StorageItem::Flag(Arc::new(flag))),
        }
    }

    /// Wrap a segment, producing a tombstone if the segment is marked as deleted.
    pub fn segment(segment: Segment) -> Self {
        if segment.deleted {
            return Self::tombstone(segment.version);
        }
        Self {
            version: segment.version,
            item: Some(StorageItem::Segment(Arc::new(segment))),
        }
    }

    pub fn tombstone(version: u64) -> Self {
        Self {
            version,
            item: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.item.is_none()
    }
}

/// A complete data set, as delivered by a `put` event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AllData {
    pub flags: HashMap<String, ItemDescriptor>,
    pub segments: HashMap<String, ItemDescriptor>,
}

/// DataStore is the versioned store written by the stream synchronizer.
///
/// Implementations must never let a key's version go backwards: [DataStore::upsert] only applies
/// an item whose version is strictly greater than the one currently stored, tombstones included.
pub trait DataStore: Send + Sync {
    /// Replace the entire contents of the store and mark it initialized.
    fn init(&self, data: AllData);

    /// Insert or replace a single item. Returns false if the update was rejected because the
    /// store already holds the same or a newer version.
    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> bool;

    /// Retrieve the descriptor stored for a key, tombstones included.
    fn get(&self, kind: DataKind, key: &str) -> Option<ItemDescriptor>;

    /// Whether [DataStore::init] has been called at least once.
    fn initialized(&self) -> bool;
}

/// An immutable, point-in-time view of an [InMemoryDataStore].
#[derive(Clone, Debug, Default)]
pub struct DataSnapshot {
    data: AllData,
    initialized: bool,
}

impl DataSnapshot {
    fn items(&self, kind: DataKind) -> &HashMap<String, ItemDescriptor> {
        match kind {
            DataKind::Flags => &self.data.flags,
            DataKind::Segments => &self.data.segments,
        }
    }

    fn items_mut(&mut self, kind: DataKind) -> &mut HashMap<String, ItemDescriptor> {
        match kind {
            DataKind::Flags => &mut self.data.flags,
            DataKind::Segments => &mut self.data.segments,
        }
    }

    /// Keys of all live (not deleted) flags.
    pub fn flag_keys(&self) -> impl Iterator<Item = &str> {
        self.data
            .flags
            .iter()
            .filter(|(_, descriptor)| !descriptor.is_tombstone())
            .map(|(key, _)| key.as_str())
    }
}

impl Store for DataSnapshot {
    fn flag(&self, flag_key: &str) -> Option<Arc<Flag>> {
        match self.data.flags.get(flag_key)?.item.as_ref()? {
            StorageItem::Flag(flag) => Some(flag.clone()),
            StorageItem::Segment(_) => None,
        }
    }

    fn segment(&self, segment_key: &str) -> Option<Arc<Segment>> {
        match self.data.segments.get(segment_key)?.item.as_ref()? {
            StorageItem::Segment(segment) => Some(segment.clone()),
            StorageItem::Flag(_) => None,
        }
    }
}

/// The default [DataStore]: an in-memory map published as copy-on-write snapshots.
///
/// Readers take the current [DataSnapshot] without waiting for writers. Writers build the next
/// snapshot from the current one and swap it in, so a `put` becomes visible all at once.
#[derive(Default)]
pub struct InMemoryDataStore {
    data: RwLock<Arc<DataSnapshot>>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        InMemoryDataStore::default()
    }

    /// The current contents of the store. Later writes do not affect the returned snapshot.
    pub fn snapshot(&self) -> Arc<DataSnapshot> {
        self.data.read().clone()
    }
}

impl DataStore for InMemoryDataStore {
    fn init(&self, data: AllData) {
        *self.data.write() = Arc::new(DataSnapshot {
            data,
            initialized: true,
        });
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> bool {
        // Upgradable reads exclude each other, serializing writers without blocking readers.
        let current = self.data.upgradable_read();
        if let Some(existing) = current.items(kind).get(key) {
            if existing.version >= item.version {
                return false;
            }
        }

        let mut next = DataSnapshot::clone(&current);
        next.items_mut(kind).insert(key.to_string(), item);
        *RwLockUpgradableReadGuard::upgrade(current) = Arc::new(next);
        true
    }

    fn get(&self, kind: DataKind, key: &str) -> Option<ItemDescriptor> {
        self.data.read().items(kind).get(key).cloned()
    }

    fn initialized(&self) -> bool {
        self.data.read().initialized
    }
}

impl Store for InMemoryDataStore {
    fn flag(&self, flag_key: &str) -> Option<Arc<Flag>> {
        self.data.read().flag(flag_key)
    }

    fn segment(&self, segment_key: &str) -> Option<Arc<Segment>> {
        self.data.read().segment(segment_key)
    }
}
