use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

/// Ordered key/value pairs read from a snapshot
pub type KvIterator<'a> = Box<dyn Iterator<Item = (Bytes, Bytes)> + Send + 'a>;

/// Frozen, point-in-time view of a store
pub trait Snapshot: Send + Sync {
    /// Pairs with `start <= key <= end` in key order; an empty bound is open
    fn range(&self, start: &[u8], end: &[u8]) -> KvIterator<'_>;

    /// Number of keys captured by the snapshot
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared handle to a snapshot; the view lives as long as any clone
pub type SnapshotHandle = Arc<dyn Snapshot>;

/// Storage engine able to produce consistent snapshots
pub trait Engine: Send + Sync {
    /// Capture the current contents
    fn snapshot(&self) -> SnapshotHandle;

    /// Iterate a snapshot between `start` and `end`, at most `limit` pairs (`-1` = no limit)
    fn iterator<'a>(
        &self,
        start: &[u8],
        end: &[u8],
        limit: i64,
        snapshot: &'a SnapshotHandle,
    ) -> KvIterator<'a> {
        let iter = snapshot.range(start, end);
        match usize::try_from(limit) {
            Ok(limit) => Box::new(iter.take(limit)),
            Err(_) => iter,
        }
    }
}

/// In-memory ordered store
///
/// Snapshots copy the map, so later writes never show up in a transfer
/// that is already running.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Bytes, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.data.write().insert(key.into(), value.into());
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.read().get(key).cloned()
    }

    pub fn del(&self, key: &[u8]) -> bool {
        self.data.write().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for MemoryStore
where
    K: Into<Bytes>,
    V: Into<Bytes>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            data: RwLock::new(
                iter.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl Engine for MemoryStore {
    fn snapshot(&self) -> SnapshotHandle {
        let data = self.data.read().clone();
        debug!("Captured snapshot of {} keys", data.len());
        Arc::new(MemorySnapshot { data })
    }
}

/// Snapshot produced by [`MemoryStore`]
#[derive(Debug)]
pub struct MemorySnapshot {
    data: BTreeMap<Bytes, Bytes>,
}

impl Snapshot for MemorySnapshot {
    fn range(&self, start: &[u8], end: &[u8]) -> KvIterator<'_> {
        if !start.is_empty() && !end.is_empty() && start > end {
            return Box::new(std::iter::empty());
        }

        let lower = if start.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Included(start)
        };
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Included(end)
        };

        Box::new(
            self.data
                .range::<[u8], _>((lower, upper))
                .map(|(k, v)| (k.clone(), v.clone())),
        )
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}
