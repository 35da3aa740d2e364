//! Sorted, duplicate-free set of series identifiers with merge-walk set algebra.

use crate::types::SeriesId;
use serde::{Deserialize, Serialize};

/// A strictly ascending, duplicate-free sequence of series ids.
///
/// Binary operations (`intersect`, `union`, `reject`) walk both inputs once (O(n + m)) and return
/// a new canonical set; operands are never mutated. Because the representation is always sorted,
/// structural equality is set equality.
///
/// The set itself is not synchronized. Shared instances (for example the per-tag-value sets inside
/// a `TagValueIndex`) are only touched while holding the owner's lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesIdSet {
    ids: Vec<SeriesId>,
}

impl SeriesIdSet {
    pub fn new() -> Self {
        Self { ids: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: Vec::with_capacity(capacity),
        }
    }

    /// Wraps an already strictly ascending vector without copying.
    pub fn from_sorted(ids: Vec<SeriesId>) -> Self {
        debug_assert!(
            ids.windows(2).all(|w| w[0] < w[1]),
            "from_sorted requires strictly ascending ids"
        );
        Self { ids }
    }

    /// Sorts and deduplicates arbitrary ids.
    pub fn from_unsorted(mut ids: Vec<SeriesId>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self { ids }
    }

    /// Inserts `id` at its sorted position. Returns false if it was already present.
    pub fn add(&mut self, id: SeriesId) -> bool {
        // Ids are assigned monotonically, so appending is the common case.
        match self.ids.last() {
            None => {
                self.ids.push(id);
                true
            }
            Some(&last) if id > last => {
                self.ids.push(id);
                true
            }
            _ => match self.ids.binary_search(&id) {
                Ok(_) => false,
                Err(pos) => {
                    self.ids.insert(pos, id);
                    true
                }
            },
        }
    }

    /// Removes `id`. Returns false if it was not present.
    pub fn remove(&mut self, id: SeriesId) -> bool {
        match self.ids.binary_search(&id) {
            Ok(pos) => {
                self.ids.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, id: SeriesId) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> std::iter::Copied<std::slice::Iter<'_, SeriesId>> {
        self.ids.iter().copied()
    }

    pub fn as_slice(&self) -> &[SeriesId] {
        &self.ids
    }

    pub fn into_vec(self) -> Vec<SeriesId> {
        self.ids
    }

    /// True iff both sets hold the same ids.
    pub fn equals(&self, other: &SeriesIdSet) -> bool {
        self.ids.len() == other.ids.len() && self.ids == other.ids
    }

    /// Ids present in both sets.
    pub fn intersect(&self, other: &SeriesIdSet) -> SeriesIdSet {
        let (l, r) = (&self.ids, &other.ids);
        let mut out = Vec::with_capacity(l.len().min(r.len()));
        let (mut i, mut j) = (0, 0);
        while i < l.len() && j < r.len() {
            if l[i] == r[j] {
                out.push(l[i]);
                i += 1;
                j += 1;
            } else if l[i] < r[j] {
                i += 1;
            } else {
                j += 1;
            }
        }
        SeriesIdSet { ids: out }
    }

    /// Ids present in either set.
    pub fn union(&self, other: &SeriesIdSet) -> SeriesIdSet {
        let (l, r) = (&self.ids, &other.ids);
        let mut out = Vec::with_capacity(l.len() + r.len());
        let (mut i, mut j) = (0, 0);
        while i < l.len() && j < r.len() {
            if l[i] == r[j] {
                out.push(l[i]);
                i += 1;
                j += 1;
            } else if l[i] < r[j] {
                out.push(l[i]);
                i += 1;
            } else {
                out.push(r[j]);
                j += 1;
            }
        }
        out.extend_from_slice(&l[i..]);
        out.extend_from_slice(&r[j..]);
        SeriesIdSet { ids: out }
    }

    /// Ids of `self` that are not in `other`. Ids only in `other` are dropped.
    pub fn reject(&self, other: &SeriesIdSet) -> SeriesIdSet {
        let (l, r) = (&self.ids, &other.ids);
        let mut out = Vec::with_capacity(l.len());
        let (mut i, mut j) = (0, 0);
        while i < l.len() && j < r.len() {
            if l[i] == r[j] {
                i += 1;
                j += 1;
            } else if l[i] < r[j] {
                out.push(l[i]);
                i += 1;
            } else {
                j += 1;
            }
        }
        out.extend_from_slice(&l[i..]);
        SeriesIdSet { ids: out }
    }

    /// Union of many sets in one pass; cheaper than folding `union` when there are many inputs.
    pub fn union_all<'a, I>(sets: I) -> SeriesIdSet
    where
        I: IntoIterator<Item = &'a SeriesIdSet>,
    {
        let sets: Vec<&SeriesIdSet> = sets.into_iter().collect();
        match sets.len() {
            0 => SeriesIdSet::new(),
            1 => sets[0].clone(),
            2 => sets[0].union(sets[1]),
            _ => {
                let total = sets.iter().map(|s| s.len()).sum();
                let mut ids = Vec::with_capacity(total);
                for s in sets {
                    ids.extend_from_slice(&s.ids);
                }
                SeriesIdSet::from_unsorted(ids)
            }
        }
    }

    /// Approximate heap footprint in bytes.
    pub fn bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.ids.capacity() * std::mem::size_of::<SeriesId>()
    }
}

impl FromIterator<SeriesId> for SeriesIdSet {
    fn from_iter<I: IntoIterator<Item = SeriesId>>(iter: I) -> Self {
        SeriesIdSet::from_unsorted(iter.into_iter().collect())
    }
}

impl From<Vec<SeriesId>> for SeriesIdSet {
    fn from(ids: Vec<SeriesId>) -> Self {
        SeriesIdSet::from_unsorted(ids)
    }
}

impl<'a> IntoIterator for &'a SeriesIdSet {
    type Item = SeriesId;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, SeriesId>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn ids(v: &[u64]) -> SeriesIdSet {
        SeriesIdSet::from_sorted(v.to_vec())
    }

    fn random_set(rng: &mut ChaCha8Rng) -> SeriesIdSet {
        let n = rng.random_range(0..40);
        (0..n).map(|_| rng.random_range(0..64u64)).collect()
    }

    #[test]
    fn equals() {
        let ids1 = ids(&[1, 2, 3]);
        let ids2 = ids(&[1, 2, 3]);
        let ids3 = ids(&[4, 5, 6]);
        assert!(ids1.equals(&ids2));
        assert!(!ids1.equals(&ids3));
        assert!(!ids1.equals(&ids(&[1, 2])));
    }

    #[test]
    fn intersect() {
        // Covers both pointer-advance branches and exit when the right side runs out.
        let got = ids(&[1, 3, 4, 5, 6]).intersect(&ids(&[1, 2, 3, 7]));
        assert_eq!(got, ids(&[1, 3]));

        // Exit when the left side runs out.
        let got = ids(&[1]).intersect(&ids(&[1, 2]));
        assert_eq!(got, ids(&[1]));
    }

    #[test]
    fn union() {
        let got = ids(&[1, 2, 3, 7]).union(&ids(&[1, 3, 4, 5, 6]));
        assert_eq!(got, ids(&[1, 2, 3, 4, 5, 6, 7]));

        let got = ids(&[1]).union(&ids(&[1, 2]));
        assert_eq!(got, ids(&[1, 2]));

        let got = ids(&[1, 3, 4, 5, 6]).union(&ids(&[1, 2, 3, 7]));
        assert_eq!(got, ids(&[1, 2, 3, 4, 5, 6, 7]));
    }

    #[test]
    fn reject() {
        let got = ids(&[1, 2, 3, 7]).reject(&ids(&[1, 3, 4, 5, 6]));
        assert_eq!(got, ids(&[2, 7]));

        let got = ids(&[1, 3, 4, 5, 6]).reject(&ids(&[1, 2, 3, 7]));
        assert_eq!(got, ids(&[4, 5, 6]));

        let got = ids(&[1]).reject(&ids(&[1, 2]));
        assert!(got.is_empty());
    }

    #[test]
    fn operations_do_not_mutate_operands() {
        let a = ids(&[1, 3, 5]);
        let b = ids(&[3, 4]);
        let _ = a.intersect(&b);
        let _ = a.union(&b);
        let _ = a.reject(&b);
        assert_eq!(a, ids(&[1, 3, 5]));
        assert_eq!(b, ids(&[3, 4]));
    }

    #[test]
    fn add_and_remove_keep_order() {
        let mut s = SeriesIdSet::new();
        assert!(s.add(5));
        assert!(s.add(1));
        assert!(s.add(9));
        assert!(s.add(3));
        assert!(!s.add(3));
        assert_eq!(s.as_slice(), &[1, 3, 5, 9]);
        assert!(s.contains(5));

        assert!(s.remove(5));
        assert!(!s.remove(5));
        assert!(!s.contains(5));
        assert_eq!(s.as_slice(), &[1, 3, 9]);
    }

    #[test]
    fn clone_is_independent() {
        let a = ids(&[1, 2]);
        let mut b = a.clone();
        b.add(3);
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 3);
    }

    #[test]
    fn from_iterator_sorts_and_dedups() {
        let s: SeriesIdSet = vec![5, 1, 5, 3, 1].into_iter().collect();
        assert_eq!(s.as_slice(), &[1, 3, 5]);
    }

    #[test]
    fn union_all_matches_folded_union() {
        let sets = vec![ids(&[1, 4]), ids(&[2, 4, 8]), ids(&[]), ids(&[3, 8, 9])];
        let folded = sets
            .iter()
            .fold(SeriesIdSet::new(), |acc, s| acc.union(s));
        assert_eq!(SeriesIdSet::union_all(&sets), folded);
        assert!(SeriesIdSet::union_all(std::iter::empty()).is_empty());
    }

    #[test]
    fn algebra_laws_hold_for_random_sets() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x5345_5249_4553);
        for _ in 0..500 {
            let a = random_set(&mut rng);
            let b = random_set(&mut rng);

            assert_eq!(a.intersect(&b), b.intersect(&a));
            assert_eq!(a.union(&b), b.union(&a));
            assert_eq!(a.reject(&b).union(&a.intersect(&b)), a);
            assert_eq!(a.intersect(&a), a);
            assert_eq!(a.union(&a), a);
            assert!(a.reject(&a).is_empty());

            for id in a.union(&b).iter() {
                assert_eq!(a.intersect(&b).contains(id), a.contains(id) && b.contains(id));
                assert_eq!(a.reject(&b).contains(id), a.contains(id) && !b.contains(id));
            }
            assert!(a.union(&b).as_slice().windows(2).all(|w| w[0] < w[1]));
        }
    }
}
