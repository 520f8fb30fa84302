// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg(not(loom))]

mod common;

use common::{Flag, Latch, Permits, jitter, setup_tracing, wait_for};
use qsync::locks::CountDownLatch;
use qsync::Synchronizer;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
fn mutual_exclusion() {
    const THREADS: usize = 6;
    const ITERS: usize = 500;

    let _trace = setup_tracing();
    let sync = Synchronizer::new(Flag::<false>);
    let counter = AtomicUsize::new(0);
    let inside = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ITERS {
                    sync.acquire(1);
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    // a non-atomic increment, updates get lost without exclusion
                    let seen = counter.load(Ordering::Relaxed);
                    jitter();
                    counter.store(seen + 1, Ordering::Relaxed);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    sync.release(1);
                }
            });
        }
    });

    assert_eq!(counter.load(Ordering::Relaxed), THREADS * ITERS);
    assert_eq!(sync.state(), 0);
    assert_eq!(sync.queue_length(), 0);
}

#[test]
fn no_lost_wakeup() {
    const ROUNDS: usize = 50;

    let _trace = setup_tracing();
    for _ in 0..ROUNDS {
        let sync = Synchronizer::new(Flag::<false>);
        let cond = sync.new_condition();
        let (tx, rx) = mpsc::channel();

        thread::scope(|s| {
            s.spawn(|| {
                sync.acquire(1);
                cond.wait_uninterruptibly(&sync);
                sync.release(1);
                tx.send(()).unwrap();
            });

            wait_for(|| {
                sync.acquire(1);
                let waiting = cond.has_waiters(&sync);
                if waiting {
                    jitter();
                    cond.signal(&sync);
                }
                sync.release(1);
                waiting
            });

            rx.recv_timeout(Duration::from_secs(10))
                .expect("signalled waiter never woke up");
        });
    }
}

#[test]
fn cancellation_safety() {
    const TIMED: usize = 3;
    const INTERRUPTED: usize = 3;
    const PLAIN: usize = 3;

    let _trace = setup_tracing();
    let sync = Synchronizer::new(Flag::<false>);
    let acquired = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel();

    sync.acquire(1);
    thread::scope(|s| {
        for _ in 0..TIMED {
            s.spawn(|| {
                // a thread that only starts after the holder released may still get the lock
                if sync.try_acquire_for(1, Duration::from_millis(5)) == Ok(true) {
                    sync.release(1);
                }
            });
        }
        for _ in 0..INTERRUPTED {
            let tx = tx.clone();
            let sync = &sync;
            s.spawn(move || {
                tx.send(qsync::park::current()).unwrap();
                assert!(sync.acquire_interruptibly(1).is_err());
            });
        }
        for _ in 0..PLAIN {
            s.spawn(|| {
                sync.acquire(1);
                acquired.fetch_add(1, Ordering::SeqCst);
                jitter();
                sync.release(1);
            });
        }

        for handle in rx.iter().take(INTERRUPTED) {
            wait_for(|| sync.is_queued(handle.id()));
            jitter();
            handle.interrupt();
        }
        thread::sleep(Duration::from_millis(20));
        sync.release(1);
    });

    assert_eq!(acquired.load(Ordering::SeqCst), PLAIN);
    assert_eq!(sync.queue_length(), 0);
    assert!(!sync.has_queued_threads());

    // the queue is still usable afterwards
    assert!(sync.try_acquire(1));
    assert!(sync.release(1));
}

#[test]
fn shared_mode_bound() {
    const PERMITS: usize = 3;
    const THREADS: usize = 8;
    const ITERS: usize = 200;

    let _trace = setup_tracing();
    let sync = Synchronizer::with_state(Permits, i32::try_from(PERMITS).unwrap());
    let holders = AtomicUsize::new(0);
    let max_holders = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ITERS {
                    sync.acquire_shared(1);
                    let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    max_holders.fetch_max(now, Ordering::SeqCst);
                    assert!(now <= PERMITS);
                    jitter();
                    holders.fetch_sub(1, Ordering::SeqCst);
                    sync.release_shared(1);
                }
            });
        }
    });

    assert!(max_holders.load(Ordering::SeqCst) <= PERMITS);
    assert_eq!(sync.state(), i32::try_from(PERMITS).unwrap());
}

#[test]
fn fair_policy_ordering() {
    const THREADS: usize = 5;

    let _trace = setup_tracing();
    let sync = Synchronizer::new(Flag::<true>);
    let order = std::sync::Mutex::new(Vec::new());

    sync.acquire(1);
    thread::scope(|s| {
        for i in 0..THREADS {
            let sync = &sync;
            let order = &order;
            s.spawn(move || {
                sync.acquire(1);
                order.lock().unwrap().push(i);
                sync.release(1);
            });
            wait_for(|| sync.queue_length() == i + 1);
        }
        sync.release(1);
    });

    assert_eq!(*order.lock().unwrap(), (0..THREADS).collect::<Vec<_>>());
}

#[test]
fn scenario_exclusive_handoff() {
    let _trace = setup_tracing();
    let sync = Synchronizer::new(Flag::<false>);
    let owners = AtomicUsize::new(0);
    let b_done = AtomicBool::new(false);

    // A
    sync.acquire(1);
    owners.fetch_add(1, Ordering::SeqCst);

    thread::scope(|s| {
        let b = s.spawn(|| {
            sync.acquire(1);
            assert_eq!(owners.fetch_add(1, Ordering::SeqCst), 0);
            b_done.store(true, Ordering::SeqCst);
            owners.fetch_sub(1, Ordering::SeqCst);
            sync.release(1);
        });

        wait_for(|| sync.queue_length() == 1);
        assert!(!b_done.load(Ordering::SeqCst));

        owners.fetch_sub(1, Ordering::SeqCst);
        sync.release(1);
        b.join().unwrap();
    });

    assert!(b_done.load(Ordering::SeqCst));
    assert_eq!(sync.state(), 0);
}

#[test]
fn scenario_two_permits_three_threads() {
    let _trace = setup_tracing();
    let sync = Synchronizer::with_state(Permits, 2);
    let acquired = AtomicUsize::new(0);
    let hold = CountDownLatch::new(1);

    thread::scope(|s| {
        for _ in 0..3 {
            s.spawn(|| {
                sync.acquire_shared(1);
                acquired.fetch_add(1, Ordering::SeqCst);
                hold.wait_uninterruptibly();
                sync.release_shared(1);
            });
        }

        wait_for(|| acquired.load(Ordering::SeqCst) == 2 && sync.queue_length() == 1);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(acquired.load(Ordering::SeqCst), 2);

        sync.release_shared(1);
        wait_for(|| acquired.load(Ordering::SeqCst) == 3);
        hold.count_down();
    });

    assert_eq!(sync.state(), 3);
    assert!(!sync.has_queued_threads());
}

#[test]
fn scenario_latch_releases_all_at_zero() {
    const COUNT: i32 = 3;
    const WAITERS: usize = 4;

    let _trace = setup_tracing();
    let sync = Synchronizer::with_state(Latch, COUNT);
    let released = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..WAITERS {
            s.spawn(|| {
                sync.acquire_shared(1);
                released.fetch_add(1, Ordering::SeqCst);
            });
        }
        wait_for(|| sync.queue_length() == WAITERS);

        for _ in 1..COUNT {
            assert!(!sync.release_shared(1));
            assert_eq!(released.load(Ordering::SeqCst), 0);
            assert_eq!(sync.queue_length(), WAITERS);
        }

        // the final count down alone releases everyone
        assert!(sync.release_shared(1));
    });

    assert_eq!(released.load(Ordering::SeqCst), WAITERS);
    assert_eq!(sync.state(), 0);
}

#[test]
fn scenario_condition_await_signal() {
    let _trace = setup_tracing();
    let sync = Synchronizer::new(Flag::<false>);
    let cond = sync.new_condition();
    let signalled = AtomicBool::new(false);

    thread::scope(|s| {
        // X
        let x = s.spawn(|| {
            sync.acquire(1);
            cond.wait_uninterruptibly(&sync);
            assert!(signalled.load(Ordering::SeqCst));
            assert_eq!(sync.exclusive_owner(), Some(qsync::park::ThreadId::current()));
            sync.release(1);
        });

        // Y
        wait_for(|| {
            sync.acquire(1);
            let waiting = cond.has_waiters(&sync);
            if waiting {
                signalled.store(true, Ordering::SeqCst);
                cond.signal(&sync);
            }
            sync.release(1);
            waiting
        });

        x.join().unwrap();
    });

    assert!(!sync.has_queued_threads());
}
