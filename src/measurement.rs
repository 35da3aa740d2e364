//! Per-measurement series registry, tag indexes and grouping.

use crate::error::{invariant_violation, IndexError};
use crate::lock_order::{self, LockRank};
use crate::predicate::{self, Predicate};
use crate::series::Series;
use crate::series_id_set::SeriesIdSet;
use crate::tag_value_index::TagValueIndex;
use crate::types::SeriesId;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Default number of matched series above which `tag_sets` groups in parallel.
pub const DEFAULT_PARALLEL_GROUPING_THRESHOLD: usize = 4096;

/// One output group of [`Measurement::tag_sets`]: the series sharing one combination of
/// dimension values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagGroup {
    /// Dimension (tag key) names, in request order.
    pub dimensions: Vec<String>,
    /// Value of each dimension for this group; empty string when a series lacks the tag.
    pub tag_values: Vec<String>,
    pub series_ids: SeriesIdSet,
    /// Keys of the member series, in id order.
    pub series_keys: Vec<String>,
}

impl TagGroup {
    /// Renders the group's dimension values as `k1=v1,k2=v2`.
    pub fn key(&self) -> String {
        self.dimensions
            .iter()
            .zip(&self.tag_values)
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// What happened to a series offered to [`Measurement::add_series_within`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddOutcome {
    Added,
    Rejected,
    LimitReached { current: u64, limit: u64 },
}

#[derive(Debug, Default)]
struct MeasurementState {
    /// Live series plus tombstoned ones awaiting reaping.
    series_by_id: HashMap<SeriesId, Arc<Series>>,
    /// Live series only.
    series_by_key: HashMap<String, Arc<Series>>,
    tag_indexes: BTreeMap<String, Arc<TagValueIndex>>,
    /// Ids of live series.
    series_ids: SeriesIdSet,
    /// Dropped ids still present in `series_by_id`.
    tombstones: Vec<SeriesId>,
}

impl MeasurementState {
    fn reap(&mut self) -> usize {
        let n = self.tombstones.len();
        for id in self.tombstones.drain(..) {
            self.series_by_id.remove(&id);
        }
        n
    }
}

/// All series of one measurement, with a [`TagValueIndex`] per tag key.
///
/// One `RwLock` guards the registries and the tag-index map; each tag index has its own lock.
/// Mutations hold the measurement write lock for their whole duration and take tag-index locks
/// one at a time in ascending key order. Reads clone the tag index they need under a short read
/// lock and release it before touching the index.
#[derive(Debug)]
pub struct Measurement {
    database: String,
    name: String,
    state: RwLock<MeasurementState>,
    /// Multi-step reads in flight; physical removal is deferred while non-zero.
    readers: AtomicUsize,
    parallel_grouping_threshold: usize,
}

/// Registers an in-flight read for as long as it lives.
struct ReadGuard<'a>(&'a AtomicUsize);

impl<'a> ReadGuard<'a> {
    fn new(readers: &'a AtomicUsize) -> Self {
        readers.fetch_add(1, Ordering::SeqCst);
        ReadGuard(readers)
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Measurement {
    pub fn new(database: impl Into<String>, name: impl Into<String>) -> Arc<Measurement> {
        Self::with_parallel_grouping_threshold(database, name, DEFAULT_PARALLEL_GROUPING_THRESHOLD)
    }

    pub fn with_parallel_grouping_threshold(
        database: impl Into<String>,
        name: impl Into<String>,
        threshold: usize,
    ) -> Arc<Measurement> {
        Arc::new(Measurement {
            database: database.into(),
            name: name.into(),
            state: RwLock::new(MeasurementState::default()),
            readers: AtomicUsize::new(0),
            parallel_grouping_threshold: threshold,
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers `series` and indexes its tags.
    ///
    /// Returns false without changing anything when `series` is `None`, belongs to another
    /// measurement, has been dropped, or its id or key is already registered.
    ///
    /// The [`Index`](crate::Index) owns id allocation, limits and the live count, so outside
    /// tests series enter a measurement only through [`Measurement::add_series_within`].
    #[cfg(test)]
    pub(crate) fn add_series(&self, series: Option<Arc<Series>>) -> bool {
        match series {
            Some(series) => self.add_series_within(series, None) == AddOutcome::Added,
            None => false,
        }
    }

    /// Registers `series` unless the measurement already holds `limit` live series. The cap is
    /// checked under the write lock.
    pub(crate) fn add_series_within(&self, series: Arc<Series>, limit: Option<u64>) -> AddOutcome {
        if !series.is_owned_by(self) || series.is_deleted() {
            return AddOutcome::Rejected;
        }

        let mut state = self.write_state();
        let id = series.id();
        // A dropped id is never registered again, even once its tombstone is reaped.
        if series.is_deleted()
            || state.series_by_id.contains_key(&id)
            || state.series_by_key.contains_key(series.key())
        {
            return AddOutcome::Rejected;
        }
        if let Some(limit) = limit {
            let current = state.series_ids.len() as u64;
            if current >= limit {
                return AddOutcome::LimitReached { current, limit };
            }
        }
        if self.readers.load(Ordering::SeqCst) == 0 {
            state.reap();
        }

        state.series_by_id.insert(id, Arc::clone(&series));
        state
            .series_by_key
            .insert(series.key().to_owned(), Arc::clone(&series));
        state.series_ids.add(id);

        // Tags are sorted by key, so tag-index locks are taken in ascending order.
        for tag in series.tags() {
            let index = Arc::clone(
                state
                    .tag_indexes
                    .entry(tag.key.clone())
                    .or_insert_with(|| Arc::new(TagValueIndex::new(tag.key.clone()))),
            );
            if !index.insert(&tag.value, id) {
                invariant_violation(format_args!(
                    "new series {} already present in tag index {}={} of measurement {}",
                    id, tag.key, tag.value, self.name
                ));
            }
        }
        AddOutcome::Added
    }

    /// Drops `series` from every structure of this measurement and sets its tombstone.
    ///
    /// Idempotent: returns false if the series is not registered here (already dropped, never
    /// added, or owned by another measurement). While reads are in flight the id stays resolvable
    /// through [`Measurement::series`] until the tombstone is reaped.
    ///
    /// Crate-internal: callers drop through [`Index::drop_series`](crate::Index::drop_series),
    /// which also records the id in the global deleted set and releases the series budget.
    pub(crate) fn drop_series(&self, series: &Arc<Series>) -> bool {
        if !series.is_owned_by(self) {
            return false;
        }

        let mut state = self.write_state();
        match state.series_by_key.get(series.key()) {
            Some(registered) if registered.id() == series.id() => {}
            _ => return false,
        }

        let id = series.id();
        series.mark_deleted();
        state.series_by_key.remove(series.key());
        state.series_ids.remove(id);

        for tag in series.tags() {
            let Some(index) = state.tag_indexes.get(&tag.key).cloned() else {
                invariant_violation(format_args!(
                    "series {} of measurement {} has tag key {} with no tag index",
                    id, self.name, tag.key
                ));
            };
            if !index.remove(&tag.value, id) {
                invariant_violation(format_args!(
                    "series {} missing from tag index {}={} of measurement {}",
                    id, tag.key, tag.value, self.name
                ));
            }
            if index.is_empty() {
                state.tag_indexes.remove(&tag.key);
            }
        }

        if self.readers.load(Ordering::SeqCst) == 0 {
            state.series_by_id.remove(&id);
            state.reap();
        } else {
            state.tombstones.push(id);
        }
        true
    }

    /// Physically removes tombstoned series if no read is in flight. Returns how many were
    /// removed.
    pub fn reap_tombstones(&self) -> usize {
        let mut state = self.write_state();
        if self.readers.load(Ordering::SeqCst) == 0 {
            state.reap()
        } else {
            0
        }
    }

    /// Number of dropped series still awaiting physical removal.
    pub fn tombstone_count(&self) -> usize {
        self.read_state().tombstones.len()
    }

    /// Series by id, including dropped series not yet reaped (check [`Series::is_deleted`]).
    pub fn series(&self, id: SeriesId) -> Option<Arc<Series>> {
        self.read_state().series_by_id.get(&id).cloned()
    }

    /// Live series by canonical key.
    pub fn series_by_key(&self, key: &str) -> Option<Arc<Series>> {
        self.read_state().series_by_key.get(key).cloned()
    }

    /// Snapshot of live series ids.
    pub fn series_ids(&self) -> SeriesIdSet {
        self.read_state().series_ids.clone()
    }

    /// Keys of live series, ordered by id.
    pub fn series_keys(&self) -> Vec<String> {
        let state = self.read_state();
        state
            .series_ids
            .iter()
            .filter_map(|id| state.series_by_id.get(&id))
            .map(|s| s.key().to_owned())
            .collect()
    }

    /// Appends the keys of `ids` to `dst`, skipping unknown or dropped ids.
    pub fn append_series_keys_by_id<I>(&self, dst: &mut Vec<String>, ids: I)
    where
        I: IntoIterator<Item = SeriesId>,
    {
        let state = self.read_state();
        for id in ids {
            if let Some(s) = state.series_by_id.get(&id) {
                if !s.is_deleted() {
                    dst.push(s.key().to_owned());
                }
            }
        }
    }

    pub fn series_n(&self) -> usize {
        self.read_state().series_ids.len()
    }

    pub fn has_series(&self) -> bool {
        self.series_n() > 0
    }

    /// Tag keys with at least one live series, ascending.
    pub fn tag_keys(&self) -> Vec<String> {
        self.read_state().tag_indexes.keys().cloned().collect()
    }

    pub fn has_tag_key(&self, key: &str) -> bool {
        self.read_state().tag_indexes.contains_key(key)
    }

    /// Distinct live values of tag `key`, ascending.
    pub fn tag_values(&self, key: &str) -> Vec<String> {
        self.tag_value_index(key)
            .map(|index| index.values())
            .unwrap_or_default()
    }

    /// Number of distinct live values of tag `key`.
    pub fn cardinality(&self, key: &str) -> usize {
        self.tag_value_index(key)
            .map(|index| index.cardinality())
            .unwrap_or(0)
    }

    pub fn tag_value_index(&self, key: &str) -> Option<Arc<TagValueIndex>> {
        self.read_state().tag_indexes.get(key).cloned()
    }

    /// Resolves `predicate` to the ids of matching live series.
    pub fn ids_for_expr(&self, predicate: &Predicate) -> SeriesIdSet {
        let _reader = ReadGuard::new(&self.readers);
        predicate::evaluate(self, predicate)
    }

    /// Groups the live series in `filter` by their values for `dimensions`.
    ///
    /// One group per distinct combination, ordered by the combination. A series lacking a
    /// dimension tag groups under the empty string. With no dimensions every match lands in a
    /// single group; with no matches there are no groups.
    pub fn tag_sets<S>(&self, filter: &SeriesIdSet, dimensions: &[S]) -> Vec<TagGroup>
    where
        S: AsRef<str> + Sync,
    {
        let _reader = ReadGuard::new(&self.readers);
        let matched: Vec<Arc<Series>> = {
            let state = self.read_state();
            state
                .series_ids
                .intersect(filter)
                .iter()
                .filter_map(|id| state.series_by_id.get(&id).cloned())
                .collect()
        };

        let group_key = |s: &Arc<Series>| -> Vec<String> {
            dimensions
                .iter()
                .map(|d| s.tag(d.as_ref()).unwrap_or("").to_owned())
                .collect()
        };
        let keyed: Vec<Vec<String>> = if matched.len() >= self.parallel_grouping_threshold {
            matched.par_iter().map(group_key).collect()
        } else {
            matched.iter().map(group_key).collect()
        };

        let mut groups: BTreeMap<Vec<String>, (Vec<SeriesId>, Vec<String>)> = BTreeMap::new();
        for (values, series) in keyed.into_iter().zip(&matched) {
            let (ids, keys) = groups.entry(values).or_default();
            ids.push(series.id());
            keys.push(series.key().to_owned());
        }

        let dimensions: Vec<String> = dimensions.iter().map(|d| d.as_ref().to_owned()).collect();
        groups
            .into_iter()
            .map(|(tag_values, (ids, series_keys))| TagGroup {
                dimensions: dimensions.clone(),
                tag_values,
                series_ids: SeriesIdSet::from_sorted(ids),
                series_keys,
            })
            .collect()
    }

    /// Approximate heap footprint in bytes.
    pub fn bytes(&self) -> usize {
        let state = self.read_state();
        let series: usize = state.series_by_id.values().map(|s| s.bytes()).sum();
        let indexes: usize = state.tag_indexes.values().map(|i| i.bytes()).sum();
        std::mem::size_of::<Self>()
            + self.database.len()
            + self.name.len()
            + series
            + indexes
            + state.series_ids.bytes()
            + state.tombstones.capacity() * std::mem::size_of::<SeriesId>()
    }

    /// Cross-checks registries, the live id set, tombstones and every tag index.
    pub fn verify(&self) -> Result<(), IndexError> {
        let state = self.read_state();
        let fail = |msg: String| Err(IndexError::Inconsistent(format!("{}: {}", self.name, msg)));

        if state.series_by_key.len() != state.series_ids.len() {
            return fail(format!(
                "{} series by key but {} live ids",
                state.series_by_key.len(),
                state.series_ids.len()
            ));
        }
        for (key, s) in &state.series_by_key {
            if s.key() != key || s.is_deleted() || !state.series_ids.contains(s.id()) {
                return fail(format!("live series {} ({}) is not registered as live", s.id(), key));
            }
            match state.series_by_id.get(&s.id()) {
                Some(by_id) if Arc::ptr_eq(by_id, s) => {}
                _ => return fail(format!("series {} missing from id registry", s.id())),
            }
            for tag in s.tags() {
                let indexed = state
                    .tag_indexes
                    .get(&tag.key)
                    .map(|index| index.load(&tag.value).contains(s.id()))
                    .unwrap_or(false);
                if !indexed {
                    return fail(format!(
                        "series {} not indexed under {}={}",
                        s.id(),
                        tag.key,
                        tag.value
                    ));
                }
            }
        }
        for (id, s) in &state.series_by_id {
            if s.is_deleted() != state.tombstones.contains(id) {
                return fail(format!("series {} tombstone state disagrees", id));
            }
        }

        // Tag indexes are visited in ascending key order, one lock at a time.
        for (key, index) in &state.tag_indexes {
            let mut bad = None;
            index.range(|value, ids| {
                for id in ids {
                    let ok = state.series_ids.contains(id)
                        && state
                            .series_by_id
                            .get(&id)
                            .is_some_and(|s| s.tag(key) == Some(value));
                    if !ok {
                        bad = Some(format!("tag index {}={} holds stale id {}", key, value, id));
                        return false;
                    }
                }
                true
            });
            if let Some(msg) = bad {
                return fail(msg);
            }
            if index.is_empty() {
                return fail(format!("tag index {} is empty", key));
            }
        }
        Ok(())
    }

    fn read_state(&self) -> lock_order::Ordered<std::sync::RwLockReadGuard<'_, MeasurementState>> {
        lock_order::read(&self.state, LockRank::Measurement, &self.name)
    }

    fn write_state(
        &self,
    ) -> lock_order::Ordered<std::sync::RwLockWriteGuard<'_, MeasurementState>> {
        lock_order::write(&self.state, LockRank::Measurement, &self.name)
    }
}
