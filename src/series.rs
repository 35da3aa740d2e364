use crate::measurement::Measurement;
use crate::types::{series_key, SeriesId, Tags};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// One time series: a measurement plus a fixed tag combination, identified by a numeric id.
///
/// Everything except the tombstone flag is immutable after construction, so readers may inspect
/// `tags` without any lock. The back-reference to the owning measurement is weak; a series never
/// keeps its measurement alive.
#[derive(Debug)]
pub struct Series {
    id: SeriesId,
    key: String,
    tags: Tags,
    deleted: AtomicBool,
    measurement: Weak<Measurement>,
}

impl Series {
    /// Creates a series owned by `measurement`. The canonical key is derived from the
    /// measurement name and `tags`. Ids are minted by the [`Index`](crate::Index).
    pub(crate) fn new(id: SeriesId, measurement: &Arc<Measurement>, tags: Tags) -> Arc<Series> {
        let key = series_key(measurement.name(), &tags);
        Arc::new(Series {
            id,
            key,
            tags,
            deleted: AtomicBool::new(false),
            measurement: Arc::downgrade(measurement),
        })
    }

    pub fn id(&self) -> SeriesId {
        self.id
    }

    /// Canonical key, `measurement,k1=v1,k2=v2`.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Value of tag `key`, if the series carries it.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key)
    }

    /// True once the series has been dropped. Never reset.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Owning measurement, if it is still alive.
    pub fn measurement(&self) -> Option<Arc<Measurement>> {
        self.measurement.upgrade()
    }

    pub(crate) fn is_owned_by(&self, measurement: &Measurement) -> bool {
        std::ptr::eq(self.measurement.as_ptr(), measurement)
    }

    /// Sets the tombstone. Returns false if it was already set.
    pub(crate) fn mark_deleted(&self) -> bool {
        !self.deleted.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.key.len()
            + self
                .tags
                .iter()
                .map(|t| t.key.len() + t.value.len() + std::mem::size_of::<crate::types::Tag>())
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tag;

    #[test]
    fn new_series_derives_key_and_owner() {
        let m = Measurement::new("db0", "cpu");
        let other = Measurement::new("db0", "mem");
        let s = Series::new(
            7,
            &m,
            Tags::new(vec![Tag::new("region", "us"), Tag::new("host", "a")]),
        );
        assert_eq!(s.id(), 7);
        assert_eq!(s.key(), "cpu,host=a,region=us");
        assert_eq!(s.tag("host"), Some("a"));
        assert!(s.is_owned_by(&m));
        assert!(!s.is_owned_by(&other));
        assert!(Arc::ptr_eq(&s.measurement().unwrap(), &m));
    }

    #[test]
    fn tombstone_is_set_once() {
        let m = Measurement::new("db0", "cpu");
        let s = Series::new(1, &m, Tags::default());
        assert!(!s.is_deleted());
        assert!(s.mark_deleted());
        assert!(!s.mark_deleted());
        assert!(s.is_deleted());
    }

    #[test]
    fn series_does_not_keep_measurement_alive() {
        let m = Measurement::new("db0", "cpu");
        let s = Series::new(1, &m, Tags::default());
        drop(m);
        assert!(s.measurement().is_none());
    }
}
