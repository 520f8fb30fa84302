// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{Condition, Exclusive, Interrupted, Synchronizer};
use core::fmt;
use core::time::Duration;
use park::ThreadId;
use std::time::Instant;

/// A reentrant mutual exclusion lock with explicit `lock`/`unlock` calls and any number of
/// associated [`Condition`]s.
///
/// The lock is owned by the thread that last locked it and hasn't unlocked it yet. The owner
/// may lock it again, every `lock` must be matched by an `unlock`. A nonfair lock (the
/// default) lets arriving threads take a free lock before queued ones, a fair lock grants it
/// to the longest waiting thread. [`ReentrantLock::try_lock`] always barges, even on fair
/// locks.
///
/// Conditions are created with [`ReentrantLock::new_condition`] and waited on or signalled
/// through the lock while holding it.
pub struct ReentrantLock {
    sync: Synchronizer<ReentrantPolicy>,
}

/// State is the hold count of the owner.
#[derive(Debug)]
struct ReentrantPolicy {
    fair: bool,
}

impl ReentrantLock {
    crate::loom::loom_const_fn! {
        /// Returns a new, unlocked, nonfair lock.
        #[must_use]
        pub fn new() -> ReentrantLock {
            Self::with_fairness(false)
        }
    }

    crate::loom::loom_const_fn! {
        /// Returns a new, unlocked, fair lock.
        #[must_use]
        pub fn new_fair() -> ReentrantLock {
            Self::with_fairness(true)
        }
    }

    crate::loom::loom_const_fn! {
        /// Returns a new, unlocked lock with the given fairness.
        #[must_use]
        pub fn with_fairness(fair: bool) -> ReentrantLock {
            Self {
                sync: Synchronizer::new(ReentrantPolicy { fair }),
            }
        }
    }

    /// Locks, waiting as long as necessary. Returns immediately if the calling thread already
    /// holds the lock, incrementing the hold count.
    ///
    /// # Panics
    ///
    /// Panics if the hold count would exceed `i32::MAX`.
    pub fn lock(&self) {
        if !self.sync.policy().fair && self.sync.compare_and_set_state(0, 1) {
            self.sync.set_exclusive_owner(Some(ThreadId::current()));
            return;
        }
        self.sync.acquire(1);
    }

    /// Like [`ReentrantLock::lock`] but aborts when the calling thread is interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    ///
    /// # Panics
    ///
    /// Panics if the hold count would exceed `i32::MAX`.
    pub fn lock_interruptibly(&self) -> Result<(), Interrupted> {
        self.sync.acquire_interruptibly(1)
    }

    /// Locks only if the lock is free or already held by the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the hold count would exceed `i32::MAX`.
    pub fn try_lock(&self) -> bool {
        self.sync.policy().nonfair_try_acquire(&self.sync, 1)
    }

    /// Locks, giving up after `timeout`.
    ///
    /// Unlike [`ReentrantLock::try_lock`] this honors the fairness setting.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    ///
    /// # Panics
    ///
    /// Panics if the hold count would exceed `i32::MAX`.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool, Interrupted> {
        self.sync.try_acquire_for(1, timeout)
    }

    /// Locks, giving up once `deadline` has passed.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    ///
    /// # Panics
    ///
    /// Panics if the hold count would exceed `i32::MAX`.
    pub fn try_lock_until(&self, deadline: Instant) -> Result<bool, Interrupted> {
        self.sync.try_acquire_until(1, deadline)
    }

    /// Decrements the hold count, releasing the lock once it reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold the lock.
    pub fn unlock(&self) {
        self.sync.release(1);
    }

    /// Returns a new condition bound to this lock.
    pub fn new_condition(&self) -> Condition {
        self.sync.new_condition()
    }

    /// Releases the lock, however often it is held, and waits on `condition` until signalled
    /// or interrupted. The lock is held again, with the same hold count, when this returns.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold the lock, or if `condition` has waiters of
    /// another lock.
    #[track_caller]
    pub fn wait(&self, condition: &Condition) -> Result<(), Interrupted> {
        condition.wait(&self.sync)
    }

    /// Like [`ReentrantLock::wait`] but interrupts are only redelivered.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold the lock, or if `condition` has waiters of
    /// another lock.
    #[track_caller]
    pub fn wait_uninterruptibly(&self, condition: &Condition) {
        condition.wait_uninterruptibly(&self.sync);
    }

    /// Like [`ReentrantLock::wait`] but gives up after `timeout`, see
    /// [`Condition::wait_timeout`].
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold the lock, or if `condition` has waiters of
    /// another lock.
    #[track_caller]
    pub fn wait_timeout(
        &self,
        condition: &Condition,
        timeout: Duration,
    ) -> Result<Option<Duration>, Interrupted> {
        condition.wait_timeout(&self.sync, timeout)
    }

    /// Like [`ReentrantLock::wait`] but gives up once `deadline` has passed. Returns `false` if
    /// it did.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold the lock, or if `condition` has waiters of
    /// another lock.
    #[track_caller]
    pub fn wait_until(&self, condition: &Condition, deadline: Instant) -> Result<bool, Interrupted> {
        condition.wait_until(&self.sync, deadline)
    }

    /// Wakes the thread waiting longest on `condition`.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold the lock.
    #[track_caller]
    pub fn signal(&self, condition: &Condition) {
        condition.signal(&self.sync);
    }

    /// Wakes all threads waiting on `condition`.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold the lock.
    #[track_caller]
    pub fn signal_all(&self, condition: &Condition) {
        condition.signal_all(&self.sync);
    }

    /// Returns `true` if any thread waits on `condition`.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold the lock.
    #[track_caller]
    pub fn has_waiters(&self, condition: &Condition) -> bool {
        condition.has_waiters(&self.sync)
    }

    /// Returns an estimate of the number of threads waiting on `condition`.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold the lock.
    #[track_caller]
    pub fn wait_queue_length(&self, condition: &Condition) -> usize {
        condition.wait_queue_length(&self.sync)
    }

    /// Returns a snapshot of the threads waiting on `condition`.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold the lock.
    #[track_caller]
    pub fn waiting_threads(&self, condition: &Condition) -> Vec<ThreadId> {
        condition.waiting_threads(&self.sync)
    }

    /// Returns how often the calling thread holds the lock, zero if it doesn't.
    pub fn hold_count(&self) -> i32 {
        if self.is_held_by_current_thread() {
            self.sync.state()
        } else {
            0
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.sync.policy().is_held_exclusively(&self.sync)
    }

    /// Returns `true` if any thread holds the lock.
    pub fn is_locked(&self) -> bool {
        self.sync.state() != 0
    }

    pub fn is_fair(&self) -> bool {
        self.sync.policy().fair
    }

    /// Returns the thread holding the lock, if any.
    pub fn owner(&self) -> Option<ThreadId> {
        if self.sync.state() == 0 {
            None
        } else {
            self.sync.exclusive_owner()
        }
    }

    /// Returns `true` if any thread is waiting for the lock.
    pub fn has_queued_threads(&self) -> bool {
        self.sync.has_queued_threads()
    }

    /// Returns `true` if `thread` is waiting for the lock.
    pub fn has_queued_thread(&self, thread: ThreadId) -> bool {
        self.sync.is_queued(thread)
    }

    /// Returns an estimate of the number of threads waiting for the lock.
    pub fn queue_length(&self) -> usize {
        self.sync.queue_length()
    }

    /// Returns a snapshot of the threads waiting for the lock.
    pub fn queued_threads(&self) -> Vec<ThreadId> {
        self.sync.queued_threads()
    }
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReentrantLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantLock")
            .field("owner", &self.owner())
            .field("fair", &self.is_fair())
            .finish_non_exhaustive()
    }
}

// === impl ReentrantPolicy ===

impl ReentrantPolicy {
    fn nonfair_try_acquire(&self, sync: &Synchronizer<Self>, acquires: i32) -> bool {
        let current = ThreadId::current();
        let state = sync.state();
        if state == 0 {
            if sync.compare_and_set_state(0, acquires) {
                sync.set_exclusive_owner(Some(current));
                return true;
            }
        } else if sync.exclusive_owner() == Some(current) {
            Self::reenter(sync, state, acquires);
            return true;
        }
        false
    }

    fn reenter(sync: &Synchronizer<Self>, state: i32, acquires: i32) {
        let next = state
            .checked_add(acquires)
            .expect("maximum lock count exceeded");
        sync.set_state(next);
    }
}

impl Exclusive for ReentrantPolicy {
    fn try_acquire(&self, sync: &Synchronizer<Self>, acquires: i32) -> bool {
        if !self.fair {
            return self.nonfair_try_acquire(sync, acquires);
        }

        let current = ThreadId::current();
        let state = sync.state();
        if state == 0 {
            if !sync.has_queued_predecessors() && sync.compare_and_set_state(0, acquires) {
                sync.set_exclusive_owner(Some(current));
                return true;
            }
        } else if sync.exclusive_owner() == Some(current) {
            Self::reenter(sync, state, acquires);
            return true;
        }
        false
    }

    fn try_release(&self, sync: &Synchronizer<Self>, releases: i32) -> bool {
        assert!(
            self.is_held_exclusively(sync),
            "lock released by a thread that doesn't hold it"
        );

        let state = sync.state() - releases;
        let free = state == 0;
        if free {
            sync.set_exclusive_owner(None);
        }
        sync.set_state(state);
        free
    }

    fn is_held_exclusively(&self, sync: &Synchronizer<Self>) -> bool {
        sync.state() != 0 && sync.exclusive_owner() == Some(ThreadId::current())
    }
}
