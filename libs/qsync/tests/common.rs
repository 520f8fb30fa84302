// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![allow(unused, reason = "not used by all tests")]

use qsync::park::ThreadId;
use qsync::{Exclusive, Shared, Synchronizer};
use rand::Rng;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

/// An exclusive lock with state `0` (free) or `1` (held) that tracks its owner.
///
/// With `FAIR` set, acquires fail while an earlier thread is queued.
#[derive(Debug, Default)]
pub struct Flag<const FAIR: bool = false>;

impl<const FAIR: bool> Exclusive for Flag<FAIR> {
    fn try_acquire(&self, sync: &Synchronizer<Self>, _arg: i32) -> bool {
        if FAIR && sync.has_queued_predecessors() {
            return false;
        }
        if sync.compare_and_set_state(0, 1) {
            sync.set_exclusive_owner(Some(ThreadId::current()));
            true
        } else {
            false
        }
    }

    fn try_release(&self, sync: &Synchronizer<Self>, _arg: i32) -> bool {
        assert!(self.is_held_exclusively(sync));
        sync.set_exclusive_owner(None);
        sync.set_state(0);
        true
    }

    fn is_held_exclusively(&self, sync: &Synchronizer<Self>) -> bool {
        sync.state() == 1 && sync.exclusive_owner() == Some(ThreadId::current())
    }
}

/// A counting policy, the state is the number of available permits.
#[derive(Debug, Default)]
pub struct Permits;

impl Shared for Permits {
    fn try_acquire_shared(&self, sync: &Synchronizer<Self>, arg: i32) -> i32 {
        loop {
            let available = sync.state();
            let remaining = available - arg;
            if remaining < 0 || sync.compare_and_set_state(available, remaining) {
                return remaining;
            }
        }
    }

    fn try_release_shared(&self, sync: &Synchronizer<Self>, arg: i32) -> bool {
        loop {
            let current = sync.state();
            if sync.compare_and_set_state(current, current + arg) {
                return true;
            }
        }
    }
}

/// A latch: acquiring succeeds once the state counted down to zero.
#[derive(Debug, Default)]
pub struct Latch;

impl Shared for Latch {
    fn try_acquire_shared(&self, sync: &Synchronizer<Self>, _arg: i32) -> i32 {
        if sync.state() == 0 { 1 } else { -1 }
    }

    fn try_release_shared(&self, sync: &Synchronizer<Self>, _arg: i32) -> bool {
        loop {
            let count = sync.state();
            if count == 0 {
                return false;
            }
            if sync.compare_and_set_state(count, count - 1) {
                return count == 1;
            }
        }
    }
}

pub fn setup_tracing() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default()
}

/// Randomly yields or sleeps for a few microseconds, to shake up interleavings.
pub fn jitter() {
    let mut rng = rand::rng();
    match rng.random_range(0..4) {
        0 => thread::yield_now(),
        1 => thread::sleep(Duration::from_micros(rng.random_range(1..50))),
        _ => {}
    }
}

/// Spins until `cond` holds.
///
/// # Panics
///
/// Panics if `cond` doesn't hold within 10 seconds.
#[track_caller]
pub fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::yield_now();
    }
}
