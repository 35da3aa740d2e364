//! Lock-order checking for the index's three lock tiers.
//!
//! Every lock in the crate is acquired through [`read`] or [`write`], which record the
//! acquisition on a thread-local stack in debug builds and panic if the new lock ranks at or
//! below one already held. Release builds compile the bookkeeping away.
//!
//! Order: `Index` before `Measurement` before `TagValues`. Several `TagValues` locks may be held
//! together only in ascending tag-key order.

use std::ops::{Deref, DerefMut};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum LockRank {
    Index = 0,
    Measurement = 1,
    TagValues = 2,
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD: std::cell::RefCell<Vec<(LockRank, String)>> =
        const { std::cell::RefCell::new(Vec::new()) };
}

/// Marker for one recorded acquisition; unrecords it on drop.
#[derive(Debug)]
pub(crate) struct Held {
    #[cfg(debug_assertions)]
    rank: LockRank,
    #[cfg(debug_assertions)]
    label: String,
}

/// Records that the current thread is about to block on a lock of `rank`.
///
/// Panics in debug builds when the acquisition would break the lock order.
#[cfg_attr(not(debug_assertions), allow(unused_variables))]
pub(crate) fn acquire(rank: LockRank, label: &str) -> Held {
    #[cfg(debug_assertions)]
    {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            for (held_rank, held_label) in held.iter() {
                let ordered = *held_rank < rank
                    || (*held_rank == LockRank::TagValues
                        && rank == LockRank::TagValues
                        && held_label.as_str() < label);
                if !ordered {
                    panic!(
                        "lock order violation: acquiring {:?}({}) while holding {:?}({})",
                        rank, label, held_rank, held_label
                    );
                }
            }
            held.push((rank, label.to_owned()));
        });
        Held {
            rank,
            label: label.to_owned(),
        }
    }
    #[cfg(not(debug_assertions))]
    {
        Held {}
    }
}

impl Drop for Held {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            // Thread-local may already be gone during thread teardown.
            let _ = HELD.try_with(|held| {
                let mut held = held.borrow_mut();
                if let Some(pos) = held
                    .iter()
                    .rposition(|(r, l)| *r == self.rank && *l == self.label)
                {
                    held.remove(pos);
                }
            });
        }
    }
}

/// A lock guard paired with its lock-order record. The guard is released before the record.
pub(crate) struct Ordered<G> {
    guard: G,
    _held: Held,
}

impl<G: Deref> Deref for Ordered<G> {
    type Target = G::Target;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<G: DerefMut> DerefMut for Ordered<G> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// Poisoning means a writer panicked mid-mutation; the structure can no longer be trusted.
pub(crate) fn read<'a, T>(
    lock: &'a RwLock<T>,
    rank: LockRank,
    label: &str,
) -> Ordered<RwLockReadGuard<'a, T>> {
    let held = acquire(rank, label);
    let guard = lock.read().expect("series index lock poisoned");
    Ordered { guard, _held: held }
}

pub(crate) fn write<'a, T>(
    lock: &'a RwLock<T>,
    rank: LockRank,
    label: &str,
) -> Ordered<RwLockWriteGuard<'a, T>> {
    let held = acquire(rank, label);
    let guard = lock.write().expect("series index lock poisoned");
    Ordered { guard, _held: held }
}
