//! End-to-end scenarios for the synchronization primitives.
//!
//! Each test is a concrete multi-thread scenario exercising the ordering,
//! fairness, or accounting promise of one primitive, driven the way a
//! service would drive it.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use taskutil::sync::{FifoLock, OrderedSynchronizer, Pool, RwLock, SimplePool};
use taskutil::test_utils::init_test_logging;
use taskutil::timeout::{try_with_timeout, TimeoutError};
use taskutil::{test_complete, test_phase};

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

#[test]
fn ordered_fan_in_fills_slots_in_order() {
    init_test("ordered_fan_in_fills_slots_in_order");

    let sync = Arc::new(OrderedSynchronizer::new());
    let slots = Arc::new(Mutex::new(vec![0_u64; 10]));

    // Submit in reverse order; delivery must still be 1, 2, ..., 10.
    let handles: Vec<_> = (1..=10_u64)
        .rev()
        .map(|i| {
            let sync = Arc::clone(&sync);
            let slots = Arc::clone(&slots);
            thread::spawn(move || {
                sync.put(
                    || {
                        let mut slots = slots.lock().unwrap();
                        // Every earlier slot must already be filled when
                        // this callback runs.
                        assert!(slots[..(i as usize - 1)].iter().all(|&v| v != 0));
                        slots[i as usize - 1] = i;
                        Ok::<(), Infallible>(())
                    },
                    i,
                )
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("producer panicked").expect("put failed");
    }

    let slots = slots.lock().unwrap().clone();
    assert_eq!(slots, (1..=10).collect::<Vec<_>>());
    test_complete!("ordered_fan_in_fills_slots_in_order");
}

#[test]
fn rw_writer_preference_blocks_late_reader() {
    init_test("rw_writer_preference_blocks_late_reader");

    let lock = Arc::new(RwLock::new(0_u32));
    let writer_released = Arc::new(AtomicBool::new(false));

    // T1 holds a read lock.
    let t1_guard = lock.read().expect("t1 read");

    // T2 queues as a writer.
    let t2 = {
        let lock = Arc::clone(&lock);
        let writer_released = Arc::clone(&writer_released);
        thread::spawn(move || {
            let mut guard = lock.write().expect("t2 write");
            *guard = 1;
            writer_released.store(true, Ordering::Release);
            drop(guard);
        })
    };

    // Wait until T2 is visibly pending.
    while !lock.is_write_locked() {
        thread::yield_now();
    }

    // T3 starts a read; it must not get the lock until T2 has released.
    let t3 = {
        let lock = Arc::clone(&lock);
        let writer_released = Arc::clone(&writer_released);
        thread::spawn(move || {
            let guard = lock.read().expect("t3 read");
            (writer_released.load(Ordering::Acquire), *guard)
        })
    };

    thread::sleep(Duration::from_millis(20));
    drop(t1_guard);

    let (released_first, observed) = t3.join().expect("t3 panicked");
    assert!(released_first, "late reader overtook the pending writer");
    assert_eq!(observed, 1, "late reader must see the writer's update");
    t2.join().expect("t2 panicked");
    test_complete!("rw_writer_preference_blocks_late_reader");
}

#[test]
fn fifo_lock_exit_order_equals_arrival_order() {
    init_test("fifo_lock_exit_order_equals_arrival_order");
    const TASKS: usize = 16;

    let lock = Arc::new(FifoLock::new());
    let exits = Arc::new(Mutex::new(Vec::new()));

    let gate = lock.lock();
    let handles: Vec<_> = (0..TASKS)
        .map(|arrival_rank| {
            let thread_lock = Arc::clone(&lock);
            let exits = Arc::clone(&exits);
            let handle = thread::spawn(move || {
                let _guard = thread_lock.lock();
                exits.lock().unwrap().push(arrival_rank);
            });
            // Pin the arrival order: wait for this contender to be queued
            // before releasing the next one.
            while lock.waiters() <= arrival_rank {
                thread::sleep(Duration::from_millis(1));
            }
            handle
        })
        .collect();
    drop(gate);

    for handle in handles {
        handle.join().expect("contender panicked");
    }

    let exits = exits.lock().unwrap().clone();
    assert_eq!(exits, (0..TASKS).collect::<Vec<_>>());
    test_complete!("fifo_lock_exit_order_equals_arrival_order");
}

#[test]
fn pool_capacity_scenario() {
    init_test("pool_capacity_scenario");

    let pool: Arc<SimplePool<u32>> = Arc::new(Pool::new(3));

    let mut held: Vec<_> = (0..3_u32)
        .map(|i| {
            pool.acquire_unkeyed(move || Ok::<_, Infallible>(i))
                .expect("fill acquire")
        })
        .collect();
    assert_eq!(pool.in_use(), 3);

    // A fourth acquire on a fresh thread blocks until a permit frees up.
    let unblocked_at = Arc::new(Mutex::new(None::<Instant>));
    let fourth = {
        let pool = Arc::clone(&pool);
        let unblocked_at = Arc::clone(&unblocked_at);
        thread::spawn(move || {
            let obj = pool
                .acquire_unkeyed(|| Ok::<_, Infallible>(99))
                .expect("fourth acquire");
            *unblocked_at.lock().unwrap() = Some(Instant::now());
            drop(obj);
        })
    };

    thread::sleep(Duration::from_millis(40));
    assert!(
        unblocked_at.lock().unwrap().is_none(),
        "fourth acquire must block at capacity"
    );

    let released_at = Instant::now();
    drop(held.pop());
    fourth.join().expect("fourth acquirer panicked");
    let woke = unblocked_at.lock().unwrap().expect("fourth never acquired");
    assert!(woke >= released_at);

    // A force_new acquire leaves the freed cached objects in the pool.
    drop(held);
    let before = pool.in_pool();
    let fresh = pool
        .acquire_with((), || Ok::<_, Infallible>(100), true, |_| true)
        .expect("force_new acquire");
    assert_eq!(*fresh, 100);
    assert_eq!(pool.in_pool(), before, "cache must be untouched by force_new");
    test_complete!("pool_capacity_scenario");
}

#[test]
fn timeout_returns_value_before_deadline() {
    init_test("timeout_returns_value_before_deadline");
    let result = try_with_timeout(|_| 6 * 7, Duration::from_secs(2));
    assert_eq!(result, Ok(42));
    test_complete!("timeout_returns_value_before_deadline");
}

#[test]
fn timeout_fires_and_task_winds_down() {
    init_test("timeout_fires_and_task_winds_down");

    let still_running = Arc::new(AtomicUsize::new(1));
    let observer = Arc::clone(&still_running);

    let timeout = Duration::from_millis(40);
    let result: Result<(), _> = try_with_timeout(
        move |timed_out| {
            // Twice the timeout, but cooperative: poll the handle and bail.
            let deadline = Instant::now() + timeout * 2;
            while Instant::now() < deadline && !timed_out.timed_out() {
                thread::sleep(Duration::from_millis(2));
            }
            observer.store(0, Ordering::SeqCst);
        },
        timeout,
    );
    assert_eq!(result, Err(TimeoutError::Elapsed(timeout)));

    // After a grace period the abandoned task has exited on its own.
    let grace = Instant::now() + Duration::from_secs(5);
    while still_running.load(Ordering::SeqCst) == 1 && Instant::now() < grace {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(still_running.load(Ordering::SeqCst), 0, "task leaked past grace");
    test_complete!("timeout_fires_and_task_winds_down");
}
