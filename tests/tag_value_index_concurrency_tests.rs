//! Adversarial concurrency tests for the per-tag-key value index.
//! Principles: hammer it from several threads, assume it deadlocks or tears, prove otherwise.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use ugnos_index::TagValueIndex;

const WORKERS: usize = 4;
const RUN_FOR: Duration = Duration::from_secs(2);
const WATCHDOG: Duration = Duration::from_secs(30);

fn random_value(rng: &mut ChaCha8Rng) -> String {
    // One of 52 single-letter values starting at 'A'.
    let c = char::from(65 + rng.random_range(0..52u8));
    c.to_string()
}

/// Four workers issue random inserts, removes, loads and range scans for a fixed duration.
/// A lock-order bug or a callback that runs under the lock shows up as a watchdog timeout.
#[test]
fn breakit_random_operations_finish_before_watchdog() {
    let index = Arc::new(TagValueIndex::new("host"));
    let stop = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = mpsc::channel();

    let mut handles = Vec::new();
    for worker in 0..WORKERS {
        let index = Arc::clone(&index);
        let stop = Arc::clone(&stop);
        let done_tx = done_tx.clone();
        handles.push(thread::spawn(move || {
            let mut rng = ChaCha8Rng::seed_from_u64(0xC0FFEE + worker as u64);
            let start = Instant::now();
            let mut ops = 0u64;
            while start.elapsed() < RUN_FOR && !stop.load(Ordering::Relaxed) {
                let value = random_value(&mut rng);
                let id = rng.random_range(0..1000u64);
                match rng.random_range(0..7u8) {
                    0 => {
                        let _ = index.bytes();
                    }
                    1 => {
                        assert!(index.cardinality() <= 52);
                    }
                    2 => {
                        let _ = index.contains(&value);
                    }
                    3 => {
                        index.insert(&value, id);
                    }
                    4 => {
                        let ids = index.load(&value);
                        assert!(ids.as_slice().windows(2).all(|w| w[0] < w[1]));
                    }
                    5 => {
                        let mut seen = 0;
                        index.range(|v, ids| {
                            assert!(!v.is_empty());
                            assert!(!ids.is_empty());
                            seen += 1;
                            seen < 10
                        });
                    }
                    _ => {
                        // Callbacks re-enter the index; a range that held its lock would deadlock here.
                        index.range_all(|v, _| {
                            if rng.random_range(0..4u8) == 0 {
                                index.remove(v, id);
                            }
                        });
                    }
                }
                ops += 1;
            }
            done_tx.send(ops).expect("watchdog receiver gone");
        }));
    }
    drop(done_tx);

    let deadline = Instant::now() + WATCHDOG;
    let mut total = 0u64;
    for _ in 0..WORKERS {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match done_rx.recv_timeout(remaining) {
            Ok(ops) => total += ops,
            Err(_) => {
                stop.store(true, Ordering::Relaxed);
                panic!("tag value index workers did not finish within {:?}", WATCHDOG);
            }
        }
    }
    for h in handles {
        h.join().expect("worker panicked");
    }
    assert!(total > 0);

    // Structure is still coherent: every value has a non-empty, sorted set.
    index.range_all(|v, ids| {
        assert!(!ids.is_empty(), "empty set left behind for {}", v);
        assert!(ids.as_slice().windows(2).all(|w| w[0] < w[1]));
    });
}

/// A set loaded before concurrent writers run must not change underneath the reader.
#[test]
fn breakit_loaded_snapshot_is_not_torn_by_writers() {
    let index = Arc::new(TagValueIndex::new("host"));
    for id in 0..100 {
        index.insert("a", id);
    }
    let snapshot = index.load("a");

    let writers: Vec<_> = (0..WORKERS as u64)
        .map(|w| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for id in 0..100 {
                    if id % WORKERS as u64 == w {
                        index.remove("a", id);
                        index.insert("a", 1000 + id);
                    }
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    assert_eq!(snapshot.as_slice(), (0..100).collect::<Vec<u64>>().as_slice());
    assert_eq!(
        index.load("a").as_slice(),
        (1000..1100).collect::<Vec<u64>>().as_slice()
    );
}

/// Concurrent inserts of distinct ids under one value all land exactly once.
#[test]
fn breakit_concurrent_inserts_are_not_lost() {
    let index = Arc::new(TagValueIndex::new("region"));
    let handles: Vec<_> = (0..WORKERS as u64)
        .map(|w| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for i in 0..500u64 {
                    assert!(index.insert("us", i * WORKERS as u64 + w));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let ids = index.load("us");
    assert_eq!(ids.len(), 500 * WORKERS);
    assert_eq!(ids.as_slice().first(), Some(&0));
    assert_eq!(ids.as_slice().last(), Some(&(500 * WORKERS as u64 - 1)));
}
