//! Concurrent per-tag-key inverted index: tag value -> series id set.

use crate::lock_order::{self, LockRank};
use crate::series_id_set::SeriesIdSet;
use crate::types::SeriesId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Inverted index for one tag key of one measurement.
///
/// Sets are shared as `Arc<SeriesIdSet>` and mutated copy-on-write, so a set returned by
/// [`TagValueIndex::load`] or handed to a range callback is an immutable snapshot: a concurrent
/// writer clones before modifying instead of tearing it.
#[derive(Debug)]
pub struct TagValueIndex {
    key: String,
    values: RwLock<HashMap<Arc<str>, Arc<SeriesIdSet>>>,
}

impl TagValueIndex {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Tag key this index covers.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Adds `id` under `value`, creating the value entry on demand.
    /// Returns false if the id was already present.
    pub fn insert(&self, value: &str, id: SeriesId) -> bool {
        let mut values = lock_order::write(&self.values, LockRank::TagValues, &self.key);
        match values.get_mut(value) {
            Some(set) => Arc::make_mut(set).add(id),
            None => {
                values.insert(Arc::from(value), Arc::new(SeriesIdSet::from_sorted(vec![id])));
                true
            }
        }
    }

    /// Removes `id` from `value`, dropping the value entry once it is empty.
    /// Returns false if the id was not present.
    pub fn remove(&self, value: &str, id: SeriesId) -> bool {
        let mut values = lock_order::write(&self.values, LockRank::TagValues, &self.key);
        let Some(set) = values.get_mut(value) else {
            return false;
        };
        if !Arc::make_mut(set).remove(id) {
            return false;
        }
        if set.is_empty() {
            values.remove(value);
        }
        true
    }

    /// Ids carrying `value`; empty if the value was never seen.
    pub fn load(&self, value: &str) -> Arc<SeriesIdSet> {
        let values = lock_order::read(&self.values, LockRank::TagValues, &self.key);
        values
            .get(value)
            .cloned()
            .unwrap_or_else(|| Arc::new(SeriesIdSet::new()))
    }

    pub fn contains(&self, value: &str) -> bool {
        let values = lock_order::read(&self.values, LockRank::TagValues, &self.key);
        values.contains_key(value)
    }

    /// Number of distinct values.
    pub fn cardinality(&self) -> usize {
        let values = lock_order::read(&self.values, LockRank::TagValues, &self.key);
        values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cardinality() == 0
    }

    /// Distinct values in ascending order.
    pub fn values(&self) -> Vec<String> {
        let mut out: Vec<String> = {
            let values = lock_order::read(&self.values, LockRank::TagValues, &self.key);
            values.keys().map(|v| v.to_string()).collect()
        };
        out.sort_unstable();
        out
    }

    /// Calls `f` for each value and its ids until `f` returns false.
    ///
    /// Entries are snapshotted under the read lock and the callback runs after it is released, so
    /// `f` may call back into this index. Each entry present at snapshot time is visited exactly
    /// once; values inserted afterwards are not visited.
    ///
    /// The snapshot copies one `(Arc<str>, Arc<SeriesIdSet>)` pair per value up front, so every
    /// call costs O(cardinality) pointer clones even when `f` stops at the first entry. No id set
    /// is copied.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&str, &SeriesIdSet) -> bool,
    {
        for (value, ids) in self.snapshot() {
            if !f(&value, &ids) {
                break;
            }
        }
    }

    /// Like [`TagValueIndex::range`] without early termination.
    pub fn range_all<F>(&self, mut f: F)
    where
        F: FnMut(&str, &SeriesIdSet),
    {
        self.range(|value, ids| {
            f(value, ids);
            true
        });
    }

    /// Sets of every value accepted by `filter`, evaluated on a snapshot without holding the lock.
    pub fn load_matching<F>(&self, mut filter: F) -> Vec<Arc<SeriesIdSet>>
    where
        F: FnMut(&str) -> bool,
    {
        self.snapshot()
            .into_iter()
            .filter(|(value, _)| filter(value))
            .map(|(_, ids)| ids)
            .collect()
    }

    /// Approximate heap footprint in bytes.
    pub fn bytes(&self) -> usize {
        let values = lock_order::read(&self.values, LockRank::TagValues, &self.key);
        let entries: usize = values
            .iter()
            .map(|(value, ids)| value.len() + ids.bytes() + 2 * std::mem::size_of::<usize>())
            .sum();
        std::mem::size_of::<Self>() + self.key.len() + entries
    }

    fn snapshot(&self) -> Vec<(Arc<str>, Arc<SeriesIdSet>)> {
        let values = lock_order::read(&self.values, LockRank::TagValues, &self.key);
        values
            .iter()
            .map(|(value, ids)| (Arc::clone(value), Arc::clone(ids)))
            .collect()
    }
}
