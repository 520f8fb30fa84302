// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{Exclusive, Synchronizer};
use core::fmt;
use core::time::Duration;
use park::ThreadId;
use std::time::Instant;

/// A blocking mutual exclusion lock.
pub type Mutex<T> = lock_api::Mutex<RawMutex, T>;
/// A [`Mutex`] that hands the lock to waiting threads in FIFO order.
pub type FairMutex<T> = lock_api::Mutex<RawMutex<true>, T>;
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawMutex, T>;
pub type FairMutexGuard<'a, T> = lock_api::MutexGuard<'a, RawMutex<true>, T>;
pub type MappedMutexGuard<'a, T> = lock_api::MappedMutexGuard<'a, RawMutex, T>;

/// The raw lock behind [`Mutex`] and [`FairMutex`].
///
/// Threads that can't take the lock right away queue up and park. Unless `FAIR` is set,
/// a thread calling [`lock`](lock_api::RawMutex::lock) may take the lock before already queued
/// threads, which gives much better throughput under contention. Fair mutexes never let a
/// thread cut in line, except through `try_lock`.
///
/// Unlocking a mutex the calling thread doesn't hold panics, which is why guards are `!Send`.
pub struct RawMutex<const FAIR: bool = false> {
    sync: Synchronizer<MutexPolicy<FAIR>>,
}

/// State is `1` while locked, the owner is tracked for condition variables.
#[derive(Debug)]
pub(crate) struct MutexPolicy<const FAIR: bool>;

impl<const FAIR: bool> RawMutex<FAIR> {
    /// Returns a new, unlocked mutex.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sync: Synchronizer::new(MutexPolicy),
        }
    }

    /// Returns `true` if the calling thread holds the lock.
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.sync.policy().is_held_exclusively(&self.sync)
    }

    /// Returns `true` if any thread is waiting for the lock.
    pub fn has_queued_threads(&self) -> bool {
        self.sync.has_queued_threads()
    }

    /// Returns an estimate of the number of threads waiting for the lock.
    pub fn queue_length(&self) -> usize {
        self.sync.queue_length()
    }

    pub(crate) fn synchronizer(&self) -> &Synchronizer<MutexPolicy<FAIR>> {
        &self.sync
    }

    fn try_lock_barging(&self) -> bool {
        if self.sync.compare_and_set_state(0, 1) {
            self.sync.set_exclusive_owner(Some(ThreadId::current()));
            true
        } else {
            false
        }
    }
}

impl<const FAIR: bool> Default for RawMutex<FAIR> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const FAIR: bool> fmt::Debug for RawMutex<FAIR> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMutex")
            .field("locked", &(self.sync.state() != 0))
            .field("owner", &self.sync.exclusive_owner())
            .field("fair", &FAIR)
            .finish_non_exhaustive()
    }
}

// Safety: the synchronizer only grants the lock to a single thread at a time
unsafe impl<const FAIR: bool> lock_api::RawMutex for RawMutex<FAIR> {
    #[allow(
        clippy::declare_interior_mutable_const,
        reason = "lock_api requires an INIT constant"
    )]
    const INIT: Self = Self::new();

    // unlocking from another thread would fail the owner check
    type GuardMarker = lock_api::GuardNoSend;

    fn lock(&self) {
        if FAIR || !self.try_lock_barging() {
            self.sync.acquire(1);
        }
    }

    fn try_lock(&self) -> bool {
        self.try_lock_barging()
    }

    unsafe fn unlock(&self) {
        self.sync.release(1);
    }

    fn is_locked(&self) -> bool {
        self.sync.state() != 0
    }
}

// Safety: see the `RawMutex` impl
unsafe impl<const FAIR: bool> lock_api::RawMutexFair for RawMutex<FAIR> {
    unsafe fn unlock_fair(&self) {
        // release always wakes the longest waiting thread, fair mutexes never let anyone
        // overtake it
        self.sync.release(1);
    }
}

// Safety: see the `RawMutex` impl
unsafe impl<const FAIR: bool> lock_api::RawMutexTimed for RawMutex<FAIR> {
    type Duration = Duration;
    type Instant = Instant;

    fn try_lock_for(&self, timeout: Self::Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => lock_api::RawMutexTimed::try_lock_until(self, deadline),
            None => {
                lock_api::RawMutex::lock(self);
                true
            }
        }
    }

    fn try_lock_until(&self, deadline: Self::Instant) -> bool {
        if !FAIR && self.try_lock_barging() {
            return true;
        }
        self.sync.try_acquire_until_uninterruptibly(1, deadline)
    }
}

// === impl MutexPolicy ===

impl<const FAIR: bool> Exclusive for MutexPolicy<FAIR> {
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
        assert!(
            self.is_held_exclusively(sync),
            "mutex unlocked by a thread that doesn't hold it"
        );
        sync.set_exclusive_owner(None);
        sync.set_state(0);
        true
    }

    fn is_held_exclusively(&self, sync: &Synchronizer<Self>) -> bool {
        sync.state() != 0 && sync.exclusive_owner() == Some(ThreadId::current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lock_api::RawMutex as _;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn smoke() {
        let m = Mutex::new(());
        drop(m.lock());
        drop(m.lock());

        let m = FairMutex::new(());
        drop(m.lock());
        drop(m.lock());
    }

    #[test]
    fn try_lock() {
        let mutex = Mutex::new(42);

        // First lock succeeds
        let a = mutex.try_lock();
        assert_eq!(a.as_ref().map(|r| **r), Some(42));

        // Additional lock fails
        let b = mutex.try_lock();
        assert!(b.is_none());

        // After dropping lock, it succeeds again
        drop(a);
        let c = mutex.try_lock();
        assert_eq!(c.as_ref().map(|r| **r), Some(42));
    }

    #[test]
    fn lots_and_lots() {
        const ITERS: u32 = 1000;
        const CONCURRENCY: u32 = 4;

        let m = Arc::new(Mutex::new(0_u32));
        let threads: Vec<_> = (0..CONCURRENCY)
            .map(|_| {
                let m = m.clone();
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(*m.lock(), ITERS * CONCURRENCY);
    }

    #[test]
    fn try_lock_for_times_out() {
        let m = Arc::new(FairMutex::new(()));
        let guard = m.lock();

        let m2 = m.clone();
        let timed_out = thread::spawn(move || m2.try_lock_for(Duration::from_millis(10)).is_none())
            .join()
            .unwrap();
        assert!(timed_out);

        // Safety: only inspects the queue
        assert!(!unsafe { m.raw() }.has_queued_threads());
        drop(guard);
        assert!(m.try_lock_for(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn owner_is_tracked() {
        let raw = RawMutex::<false>::new();
        assert!(!raw.is_owned_by_current_thread());
        raw.lock();
        assert!(raw.is_locked());
        assert!(raw.is_owned_by_current_thread());

        thread::scope(|s| {
            s.spawn(|| assert!(!raw.is_owned_by_current_thread()));
        });

        // Safety: locked above
        unsafe { raw.unlock() };
        assert!(!raw.is_locked());
    }

    #[test]
    #[should_panic = "mutex unlocked by a thread that doesn't hold it"]
    fn unlock_without_holding_panics() {
        let raw = RawMutex::<false>::new();
        // Safety: not actually sound, the point is that it panics instead of corrupting state
        unsafe { raw.unlock() };
    }
}
