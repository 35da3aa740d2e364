//! The series index: measurements by name, series id allocation, cardinality limits and the
//! global set of dropped ids.

use crate::config::IndexConfig;
use crate::error::IndexError;
use crate::lock_order::{self, LockRank};
use crate::measurement::{AddOutcome, Measurement, TagGroup};
use crate::predicate::Predicate;
use crate::series::Series;
use crate::series_id_set::SeriesIdSet;
use crate::telemetry::{index_metrics, IndexEvent};
use crate::types::{series_key, SeriesId, TagSet, Tags};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Scope reported when the index-wide series limit is hit.
pub const GLOBAL_CARDINALITY_SCOPE: &str = "global";

const MEASUREMENTS_LOCK: &str = "measurements";
const DELETED_LOCK: &str = "deleted";

/// Point-in-time counters for one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexStats {
    pub measurements: usize,
    pub series: u64,
    pub deleted: usize,
    pub tombstones: usize,
    pub bytes: usize,
}

/// In-memory index of every series of one shard.
///
/// Measurements are created lazily and never removed. Series ids are allocated from a single
/// counter, are unique for the life of the index and are never reused: re-creating a dropped tag
/// combination yields a new id.
#[derive(Debug)]
pub struct Index {
    config: IndexConfig,
    measurements: RwLock<HashMap<String, Arc<Measurement>>>,
    /// Every id ever dropped. Append-only.
    deleted: RwLock<SeriesIdSet>,
    next_series_id: AtomicU64,
    /// Live series across all measurements.
    series_n: AtomicU64,
}

impl Default for Index {
    fn default() -> Self {
        Index::new(IndexConfig::default())
    }
}

impl Index {
    pub fn new(config: IndexConfig) -> Self {
        Self {
            config,
            measurements: RwLock::new(HashMap::new()),
            deleted: RwLock::new(SeriesIdSet::new()),
            next_series_id: AtomicU64::new(1),
            series_n: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Returns the series for (`measurement`, `tags`), creating it (and the measurement) on first
    /// sight.
    ///
    /// Existing series are always returned. Creating a new one fails with
    /// `SeriesCardinalityLimitExceeded` if it would exceed the global or per-measurement limit.
    pub fn create_series_if_not_exists(
        &self,
        measurement: &str,
        tags: &TagSet,
    ) -> Result<Arc<Series>, IndexError> {
        if measurement.is_empty() {
            return Err(IndexError::InvalidSeries(
                "measurement name must not be empty".to_string(),
            ));
        }
        if tags.keys().any(|k| k.is_empty()) {
            return Err(IndexError::InvalidSeries(format!(
                "empty tag key in series of measurement {}",
                measurement
            )));
        }

        let tags = Tags::from(tags);
        let key = series_key(measurement, &tags);
        let m = self.create_measurement_if_not_exists(measurement);

        loop {
            if let Some(existing) = m.series_by_key(&key) {
                return Ok(existing);
            }

            self.reserve_series_slot()?;
            let id = self.next_series_id.fetch_add(1, Ordering::SeqCst);
            let series = Series::new(id, &m, tags.clone());
            match m.add_series_within(Arc::clone(&series), self.config.max_series_per_measurement)
            {
                AddOutcome::Added => {
                    let live = self.series_n.load(Ordering::SeqCst);
                    index_metrics::record_series_created(live);
                    self.config.event_listener.on_event(IndexEvent::SeriesCreated {
                        measurement: measurement.to_string(),
                        id,
                        key: series.key().to_string(),
                    });
                    return Ok(series);
                }
                AddOutcome::Rejected => {
                    // A concurrent caller registered the same key first; return theirs.
                    self.series_n.fetch_sub(1, Ordering::SeqCst);
                }
                AddOutcome::LimitReached { current, limit } => {
                    self.series_n.fetch_sub(1, Ordering::SeqCst);
                    return Err(self.limit_exceeded(measurement, current, limit));
                }
            }
        }
    }

    /// Claims one unit of the global series budget.
    fn reserve_series_slot(&self) -> Result<(), IndexError> {
        match self.config.max_series {
            None => {
                self.series_n.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Some(limit) => self
                .series_n
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < limit).then_some(n + 1)
                })
                .map(|_| ())
                .map_err(|current| self.limit_exceeded(GLOBAL_CARDINALITY_SCOPE, current, limit)),
        }
    }

    fn limit_exceeded(&self, scope: &str, current: u64, limit: u64) -> IndexError {
        index_metrics::record_cardinality_rejection();
        self.config
            .event_listener
            .on_event(IndexEvent::CardinalityLimitExceeded {
                scope: scope.to_string(),
                current,
                limit,
            });
        IndexError::SeriesCardinalityLimitExceeded {
            current,
            limit,
            scope: scope.to_string(),
        }
    }

    /// Looks up `name`, creating an empty measurement if it does not exist yet.
    pub fn create_measurement_if_not_exists(&self, name: &str) -> Arc<Measurement> {
        if let Some(m) = self.measurement(name) {
            return m;
        }

        let (m, count) = {
            let mut measurements =
                lock_order::write(&self.measurements, LockRank::Index, MEASUREMENTS_LOCK);
            if let Some(m) = measurements.get(name) {
                return Arc::clone(m);
            }
            let m = Measurement::with_parallel_grouping_threshold(
                self.config.database.clone(),
                name,
                self.config.parallel_grouping_threshold,
            );
            measurements.insert(name.to_string(), Arc::clone(&m));
            (m, measurements.len())
        };

        index_metrics::record_measurements(count);
        self.config
            .event_listener
            .on_event(IndexEvent::MeasurementCreated {
                measurement: name.to_string(),
            });
        m
    }

    pub fn measurement(&self, name: &str) -> Option<Arc<Measurement>> {
        lock_order::read(&self.measurements, LockRank::Index, MEASUREMENTS_LOCK)
            .get(name)
            .cloned()
    }

    /// Measurement names, ascending.
    pub fn measurement_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            lock_order::read(&self.measurements, LockRank::Index, MEASUREMENTS_LOCK)
                .keys()
                .cloned()
                .collect();
        names.sort_unstable();
        names
    }

    pub fn measurement_n(&self) -> usize {
        lock_order::read(&self.measurements, LockRank::Index, MEASUREMENTS_LOCK).len()
    }

    /// Live series for (`measurement`, `tags`), without creating anything.
    pub fn find_series(&self, measurement: &str, tags: &TagSet) -> Option<Arc<Series>> {
        let m = self.measurement(measurement)?;
        m.series_by_key(&series_key(measurement, &Tags::from(tags)))
    }

    /// Drops `series` and records its id in the global deleted set.
    ///
    /// Returns false if the series is not live in this index.
    pub fn drop_series(&self, series: &Arc<Series>) -> bool {
        let Some(m) = series.measurement() else {
            return false;
        };
        match self.measurement(m.name()) {
            Some(mine) if Arc::ptr_eq(&mine, &m) => {}
            _ => return false,
        }
        if !m.drop_series(series) {
            return false;
        }

        lock_order::write(&self.deleted, LockRank::Index, DELETED_LOCK).add(series.id());
        let live = self.series_n.fetch_sub(1, Ordering::SeqCst) - 1;

        index_metrics::record_series_dropped(live);
        self.config.event_listener.on_event(IndexEvent::SeriesDropped {
            measurement: m.name().to_string(),
            id: series.id(),
            key: series.key().to_string(),
        });
        true
    }

    pub fn is_deleted(&self, id: SeriesId) -> bool {
        lock_order::read(&self.deleted, LockRank::Index, DELETED_LOCK).contains(id)
    }

    /// Snapshot of every id dropped so far.
    pub fn deleted_series_ids(&self) -> SeriesIdSet {
        lock_order::read(&self.deleted, LockRank::Index, DELETED_LOCK).clone()
    }

    /// Removes ids dropped so far from `ids`, for callers whose evaluation overlapped a drop.
    pub fn filter_deleted(&self, ids: &SeriesIdSet) -> SeriesIdSet {
        let deleted = lock_order::read(&self.deleted, LockRank::Index, DELETED_LOCK);
        if deleted.is_empty() {
            return ids.clone();
        }
        ids.reject(&deleted)
    }

    /// Live ids of `measurement` matching `predicate` (all live ids when `None`).
    pub fn ids_for_expr(&self, measurement: &str, predicate: Option<&Predicate>) -> SeriesIdSet {
        let start = Instant::now();
        let Some(m) = self.measurement(measurement) else {
            return SeriesIdSet::new();
        };
        let ids = match predicate {
            Some(p) => m.ids_for_expr(p),
            None => m.series_ids(),
        };
        let ids = self.filter_deleted(&ids);
        index_metrics::record_ids_for_expr(start.elapsed());
        ids
    }

    /// Resolves `predicate` within `measurement` and groups the matches by `dimensions`.
    pub fn tag_sets<S>(
        &self,
        measurement: &str,
        predicate: Option<&Predicate>,
        dimensions: &[S],
    ) -> Vec<TagGroup>
    where
        S: AsRef<str> + Sync,
    {
        let start = Instant::now();
        let Some(m) = self.measurement(measurement) else {
            return Vec::new();
        };
        let ids = self.ids_for_expr(measurement, predicate);
        let groups = m.tag_sets(&ids, dimensions);
        index_metrics::record_tag_sets(start.elapsed());
        groups
    }

    /// Live series across all measurements.
    pub fn series_n(&self) -> u64 {
        self.series_n.load(Ordering::SeqCst)
    }

    /// Physically removes tombstoned series in every measurement with no read in flight.
    pub fn reap_tombstones(&self) -> usize {
        let reaped: usize = self
            .measurements_snapshot()
            .iter()
            .map(|m| m.reap_tombstones())
            .sum();
        if reaped > 0 {
            index_metrics::record_tombstones_reaped(reaped);
            self.config
                .event_listener
                .on_event(IndexEvent::TombstonesReaped { reaped });
        }
        reaped
    }

    pub fn stats(&self) -> IndexStats {
        let measurements = self.measurements_snapshot();
        IndexStats {
            measurements: measurements.len(),
            series: self.series_n(),
            deleted: lock_order::read(&self.deleted, LockRank::Index, DELETED_LOCK).len(),
            tombstones: measurements.iter().map(|m| m.tombstone_count()).sum(),
            bytes: measurements.iter().map(|m| m.bytes()).sum(),
        }
    }

    /// Runs [`Measurement::verify`] on every measurement and checks the live series count.
    ///
    /// Meaningful only while no series are being created or dropped.
    pub fn verify(&self) -> Result<(), IndexError> {
        let measurements = self.measurements_snapshot();
        let mut live = 0u64;
        for m in &measurements {
            m.verify()?;
            live += m.series_n() as u64;
        }
        let counted = self.series_n();
        if live != counted {
            return Err(IndexError::Inconsistent(format!(
                "{} live series in measurements but index counts {}",
                live, counted
            )));
        }
        Ok(())
    }

    fn measurements_snapshot(&self) -> Vec<Arc<Measurement>> {
        lock_order::read(&self.measurements, LockRank::Index, MEASUREMENTS_LOCK)
            .values()
            .cloned()
            .collect()
    }
}
