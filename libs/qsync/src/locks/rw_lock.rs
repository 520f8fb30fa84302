// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{Exclusive, Shared, Synchronizer};
use core::fmt;
use core::time::Duration;
use park::ThreadId;
use std::time::Instant;

/// A blocking readers-writer lock.
pub type RwLock<T> = lock_api::RwLock<RawRwLock, T>;
/// A [`RwLock`] that hands out the lock in FIFO order.
pub type FairRwLock<T> = lock_api::RwLock<RawRwLock<true>, T>;
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawRwLock, T>;
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawRwLock, T>;
pub type FairRwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawRwLock<true>, T>;
pub type FairRwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawRwLock<true>, T>;
pub type MappedRwLockReadGuard<'a, T> = lock_api::MappedRwLockReadGuard<'a, RawRwLock, T>;
pub type MappedRwLockWriteGuard<'a, T> = lock_api::MappedRwLockWriteGuard<'a, RawRwLock, T>;

const SHARED_SHIFT: u32 = 16;
const SHARED_UNIT: u32 = 1 << SHARED_SHIFT;
const MAX_COUNT: u32 = (1 << SHARED_SHIFT) - 1;
const EXCLUSIVE_MASK: u32 = (1 << SHARED_SHIFT) - 1;

/// The raw lock behind [`RwLock`] and [`FairRwLock`].
///
/// The state word holds the number of read holds in its upper and the write hold count in its
/// lower 16 bits. Each half saturates at 65535 holds, exceeding that panics.
///
/// A nonfair lock lets readers in as long as the longest waiting thread is not a writer, which
/// keeps writers from starving in practice. A fair lock grants the lock in arrival order, except
/// through the `try_lock` methods which always barge.
///
/// The write holder may take the read lock as well, which is how
/// [`downgrade`](lock_api::RawRwLockDowngrade::downgrade) is done. Read holds are not tracked
/// per thread: a thread that read-locks again while a writer is queued deadlocks. Taking the
/// read or write lock through `lock_api` while holding the write lock panics.
pub struct RawRwLock<const FAIR: bool = false> {
    sync: Synchronizer<RwLockPolicy<FAIR>>,
}

#[derive(Debug)]
struct RwLockPolicy<const FAIR: bool>;

fn shared_count(state: i32) -> u32 {
    state.cast_unsigned() >> SHARED_SHIFT
}

fn exclusive_count(state: i32) -> u32 {
    state.cast_unsigned() & EXCLUSIVE_MASK
}

impl<const FAIR: bool> RawRwLock<FAIR> {
    /// Returns a new, unlocked lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sync: Synchronizer::new(RwLockPolicy),
        }
    }

    /// Returns the number of read holds.
    pub fn read_lock_count(&self) -> u32 {
        shared_count(self.sync.state())
    }

    /// Returns `true` if some thread holds the write lock.
    pub fn is_write_locked(&self) -> bool {
        exclusive_count(self.sync.state()) != 0
    }

    /// Returns `true` if the calling thread holds the write lock.
    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.sync.policy().is_held_exclusively(&self.sync)
    }

    /// Returns the calling thread's write hold count, zero if it doesn't hold the write lock.
    pub fn write_hold_count(&self) -> u32 {
        if self.is_write_locked_by_current_thread() {
            exclusive_count(self.sync.state())
        } else {
            0
        }
    }

    /// Returns `true` if any thread is waiting for the read or write lock.
    pub fn has_queued_threads(&self) -> bool {
        self.sync.has_queued_threads()
    }

    /// Returns an estimate of the number of threads waiting for the read or write lock.
    pub fn queue_length(&self) -> usize {
        self.sync.queue_length()
    }

    /// Returns a snapshot of the threads waiting for the write lock.
    pub fn queued_writers(&self) -> Vec<ThreadId> {
        self.sync.exclusive_queued_threads()
    }

    /// Returns a snapshot of the threads waiting for the read lock.
    pub fn queued_readers(&self) -> Vec<ThreadId> {
        self.sync.shared_queued_threads()
    }

    #[track_caller]
    fn assert_not_write_locked_by_current_thread(&self) {
        assert!(
            !self.is_write_locked_by_current_thread(),
            "rwlock locked again by the thread holding its write lock"
        );
    }

    fn try_lock_shared_barging(&self) -> bool {
        loop {
            let c = self.sync.state();
            if exclusive_count(c) != 0 {
                return false;
            }
            let next = add_shared(c);
            if self.sync.compare_and_set_state(c, next) {
                return true;
            }
        }
    }

    fn try_lock_exclusive_barging(&self) -> bool {
        if self.sync.compare_and_set_state(0, 1) {
            self.sync.set_exclusive_owner(Some(ThreadId::current()));
            true
        } else {
            false
        }
    }
}

fn add_shared(state: i32) -> i32 {
    assert!(
        shared_count(state) < MAX_COUNT,
        "maximum lock count exceeded"
    );
    (state.cast_unsigned() + SHARED_UNIT).cast_signed()
}

impl<const FAIR: bool> Default for RawRwLock<FAIR> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const FAIR: bool> fmt::Debug for RawRwLock<FAIR> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.sync.state();
        f.debug_struct("RawRwLock")
            .field("readers", &shared_count(state))
            .field("writes", &exclusive_count(state))
            .field("owner", &self.sync.exclusive_owner())
            .field("fair", &FAIR)
            .finish_non_exhaustive()
    }
}

// Safety: the policy never grants the write lock while any read or write hold by another thread
// exists, and the lock_api entry points refuse to stack holds on the calling thread's write lock
unsafe impl<const FAIR: bool> lock_api::RawRwLock for RawRwLock<FAIR> {
    #[allow(
        clippy::declare_interior_mutable_const,
        reason = "lock_api requires an INIT constant"
    )]
    const INIT: Self = Self::new();

    // write unlocks check the owner
    type GuardMarker = lock_api::GuardNoSend;

    fn lock_shared(&self) {
        self.assert_not_write_locked_by_current_thread();
        self.sync.acquire_shared(1);
    }

    fn try_lock_shared(&self) -> bool {
        !self.is_write_locked_by_current_thread() && self.try_lock_shared_barging()
    }

    unsafe fn unlock_shared(&self) {
        self.sync.release_shared(1);
    }

    fn lock_exclusive(&self) {
        self.assert_not_write_locked_by_current_thread();
        self.sync.acquire(1);
    }

    fn try_lock_exclusive(&self) -> bool {
        self.try_lock_exclusive_barging()
    }

    unsafe fn unlock_exclusive(&self) {
        self.sync.release(1);
    }

    fn is_locked(&self) -> bool {
        self.sync.state() != 0
    }
}

// Safety: see the `RawRwLock` impl
unsafe impl<const FAIR: bool> lock_api::RawRwLockDowngrade for RawRwLock<FAIR> {
    unsafe fn downgrade(&self) {
        // the write holder never blocks on the read lock
        self.sync.acquire_shared(1);
        self.sync.release(1);
    }
}

// Safety: see the `RawRwLock` impl
unsafe impl<const FAIR: bool> lock_api::RawRwLockTimed for RawRwLock<FAIR> {
    type Duration = Duration;
    type Instant = Instant;

    fn try_lock_shared_for(&self, timeout: Self::Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => lock_api::RawRwLockTimed::try_lock_shared_until(self, deadline),
            None => {
                lock_api::RawRwLock::lock_shared(self);
                true
            }
        }
    }

    fn try_lock_shared_until(&self, deadline: Self::Instant) -> bool {
        self.assert_not_write_locked_by_current_thread();
        self.sync.try_acquire_shared_until_uninterruptibly(1, deadline)
    }

    fn try_lock_exclusive_for(&self, timeout: Self::Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => lock_api::RawRwLockTimed::try_lock_exclusive_until(self, deadline),
            None => {
                lock_api::RawRwLock::lock_exclusive(self);
                true
            }
        }
    }

    fn try_lock_exclusive_until(&self, deadline: Self::Instant) -> bool {
        self.assert_not_write_locked_by_current_thread();
        self.sync.try_acquire_until_uninterruptibly(1, deadline)
    }
}

// === impl RwLockPolicy ===

impl<const FAIR: bool> RwLockPolicy<FAIR> {
    fn reader_should_block(sync: &Synchronizer<Self>) -> bool {
        if FAIR {
            sync.has_queued_predecessors()
        } else {
            sync.apparently_first_queued_is_exclusive()
        }
    }

    fn writer_should_block(sync: &Synchronizer<Self>) -> bool {
        FAIR && sync.has_queued_predecessors()
    }
}

impl<const FAIR: bool> Exclusive for RwLockPolicy<FAIR> {
    fn try_acquire(&self, sync: &Synchronizer<Self>, acquires: i32) -> bool {
        let acquires = acquires.cast_unsigned();
        let c = sync.state();
        if c != 0 {
            // readers present, or another writer
            if exclusive_count(c) == 0 || sync.exclusive_owner() != Some(ThreadId::current()) {
                return false;
            }
            assert!(
                exclusive_count(c) + acquires <= MAX_COUNT,
                "maximum lock count exceeded"
            );
            sync.set_state((c.cast_unsigned() + acquires).cast_signed());
            return true;
        }

        if Self::writer_should_block(sync) || !sync.compare_and_set_state(0, acquires.cast_signed())
        {
            return false;
        }
        sync.set_exclusive_owner(Some(ThreadId::current()));
        true
    }

    fn try_release(&self, sync: &Synchronizer<Self>, releases: i32) -> bool {
        assert!(
            self.is_held_exclusively(sync),
            "rwlock write-unlocked by a thread that doesn't hold it"
        );
        let releases = releases.cast_unsigned();
        let c = sync.state();
        assert!(exclusive_count(c) >= releases, "write lock count underflow");

        let next = c.cast_unsigned() - releases;
        let free = exclusive_count(next.cast_signed()) == 0;
        if free {
            sync.set_exclusive_owner(None);
        }
        sync.set_state(next.cast_signed());
        free
    }

    fn is_held_exclusively(&self, sync: &Synchronizer<Self>) -> bool {
        exclusive_count(sync.state()) != 0 && sync.exclusive_owner() == Some(ThreadId::current())
    }
}

impl<const FAIR: bool> Shared for RwLockPolicy<FAIR> {
    fn try_acquire_shared(&self, sync: &Synchronizer<Self>, _arg: i32) -> i32 {
        loop {
            let c = sync.state();
            if exclusive_count(c) != 0 {
                // the write holder may always read, blocking here would deadlock it
                if sync.exclusive_owner() != Some(ThreadId::current()) {
                    return -1;
                }
            } else if Self::reader_should_block(sync) {
                return -1;
            }

            if sync.compare_and_set_state(c, add_shared(c)) {
                return 1;
            }
        }
    }

    fn try_release_shared(&self, sync: &Synchronizer<Self>, _arg: i32) -> bool {
        loop {
            let c = sync.state();
            assert!(
                shared_count(c) != 0,
                "rwlock read-unlocked without being read-locked"
            );
            let next = (c.cast_unsigned() - SHARED_UNIT).cast_signed();
            if sync.compare_and_set_state(c, next) {
                // only a fully released lock lets a writer in
                return next == 0;
            }
        }
    }
}
