//! End-to-end scenarios for every property listed in spec.md's testable
//! properties section: mutex safety, RwLock exclusion, semaphore bound,
//! barrier rendezvous, channel FIFO/total-delivery/auto-close, and SJB
//! round-trip/GC integrity, driven through the crate's public API exactly
//! as an embedding application would use it.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier as StdBarrier};
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde_json::json;

use syncmem::{Barrier, Mutex, RwLock, Semaphore, SharedJsonBuffer};

#[test]
fn mutex_increment_is_exact_under_contention() {
    const THREADS: usize = 4;
    const INCREMENTS: usize = 10_000;

    let mutex = Arc::new(Mutex::new(0u64));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    let mut guard = mutex.lock_blocking();
                    *guard += 1;
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(*mutex.lock_blocking(), (THREADS * INCREMENTS) as u64);
}

#[test]
fn rwlock_never_lets_a_write_overlap_another_critical_section() {
    const READERS: usize = 6;

    let lock = Arc::new(RwLock::new(0i64));
    let overlap_detected = Arc::new(AtomicUsize::new(0));
    let writers_inside = Arc::new(AtomicI32::new(0));

    let start = Arc::new(StdBarrier::new(READERS + 1));

    let mut handles = Vec::new();
    for _ in 0..READERS {
        let lock = Arc::clone(&lock);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..200 {
                let guard = lock.read_blocking();
                let _ = *guard;
                thread::yield_now();
            }
        }));
    }

    {
        let lock = Arc::clone(&lock);
        let overlap_detected = Arc::clone(&overlap_detected);
        let writers_inside = Arc::clone(&writers_inside);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for i in 0..200 {
                let mut guard = lock.write_blocking();
                if writers_inside.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlap_detected.fetch_add(1, Ordering::SeqCst);
                }
                *guard = i;
                writers_inside.fetch_sub(1, Ordering::SeqCst);
            }
        }));
    }

    start.wait();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(overlap_detected.load(Ordering::SeqCst), 0);
}

#[test]
fn semaphore_never_admits_more_than_its_permit_count() {
    const CAPACITY: i32 = 2;
    const THREADS: usize = 8;

    let sem = Arc::new(Semaphore::new(CAPACITY));
    let inside = Arc::new(AtomicI32::new(0));
    let max_observed = Arc::new(AtomicI32::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let sem = Arc::clone(&sem);
            let inside = Arc::clone(&inside);
            let max_observed = Arc::clone(&max_observed);
            thread::spawn(move || {
                for _ in 0..50 {
                    let permit = sem.acquire_blocking(1);
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_observed.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_micros(50));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(max_observed.load(Ordering::SeqCst) <= CAPACITY);
}

#[test]
fn barrier_rendezvous_elects_exactly_one_leader_per_round() {
    const PARTICIPANTS: i32 = 5;
    const ROUNDS: usize = 20;

    let barrier = Arc::new(Barrier::new(PARTICIPANTS));
    let leaders_per_round = Arc::new(
        (0..ROUNDS)
            .map(|_| AtomicUsize::new(0))
            .collect::<Vec<_>>(),
    );

    let handles: Vec<_> = (0..PARTICIPANTS)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            let leaders_per_round = Arc::clone(&leaders_per_round);
            thread::spawn(move || {
                for round in 0..ROUNDS {
                    let result = barrier.wait_blocking();
                    if result.leader {
                        leaders_per_round[round].fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    for count in leaders_per_round.iter() {
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn channel_preserves_fifo_order_single_producer_single_consumer() {
    const COUNT: u32 = 1_000;

    let (tx, rx) = syncmem::channel::bounded(16, 4);
    let producer = thread::spawn(move || {
        for i in 0..COUNT {
            tx.send(&i.to_le_bytes()).unwrap();
        }
    });

    let mut received = Vec::with_capacity(COUNT as usize);
    for _ in 0..COUNT {
        let bytes = rx.recv().unwrap();
        received.push(u32::from_le_bytes(bytes.try_into().unwrap()));
    }

    producer.join().unwrap();
    assert_eq!(received, (0..COUNT).collect::<Vec<_>>());
}

#[test]
fn channel_delivers_every_item_from_every_producer_then_auto_closes() {
    const PRODUCERS: u32 = 4;
    const PER_PRODUCER: u32 = 500;

    let (tx, mut rx) = syncmem::channel::bounded(32, 4);
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    tx.send(&(p * PER_PRODUCER + i).to_le_bytes()).unwrap();
                }
            })
        })
        .collect();
    drop(tx);

    let mut received = Vec::new();
    for bytes in rx.by_ref() {
        received.push(u32::from_le_bytes(bytes.unwrap().try_into().unwrap()));
    }

    for producer in producers {
        producer.join().unwrap();
    }

    received.sort_unstable();
    assert_eq!(received, (0..PRODUCERS * PER_PRODUCER).collect::<Vec<_>>());
    assert!(rx.recv().is_err());
}

#[test]
fn shared_json_buffer_round_trips_a_nested_structure() {
    let sjb = SharedJsonBuffer::new();
    let root = sjb.root().unwrap();

    root.set(
        "profile",
        json!({"name": "ada", "tags": ["admin", "beta"], "level": 3}),
    )
    .unwrap();

    let profile = root.get_handle("profile").unwrap();
    assert_eq!(profile.get("name").unwrap(), json!("ada"));
    assert_eq!(profile.get("level").unwrap(), json!(3));

    profile.set("level", json!(4)).unwrap();
    assert_eq!(root.get_handle("profile").unwrap().get("level").unwrap(), json!(4));

    assert!(profile.delete("tags"));
    assert!(!profile.delete("tags"));
}

#[test]
fn shared_json_buffer_survives_gc_churn_without_losing_subtree_identity() {
    let sjb = SharedJsonBuffer::with_capacity(1 << 16);
    let root = sjb.root().unwrap();
    root.set("anchor", json!({"hits": 0})).unwrap();
    let anchor = root.get_handle("anchor").unwrap();

    let mut rng = rand::thread_rng();
    for i in 0..50 {
        let key: String = format!("scratch_{i}");
        let value: String = (0..rng.gen_range(8..64))
            .map(|_| rng.gen_range(b'a'..=b'z') as char)
            .collect();
        root.set(&key, json!(value)).unwrap();

        let hits = anchor.get("hits").unwrap().as_i64().unwrap();
        anchor.set("hits", json!(hits + 1)).unwrap();
    }

    assert_eq!(anchor.get("hits").unwrap(), json!(50));
    assert_eq!(root.get_handle("anchor").unwrap().get("hits").unwrap(), json!(50));
}
