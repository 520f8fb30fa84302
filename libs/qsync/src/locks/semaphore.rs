// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{Interrupted, Shared, Synchronizer};
use core::fmt;
use core::time::Duration;
use park::ThreadId;

/// A counting semaphore.
///
/// The semaphore holds a number of permits. Acquiring takes permits, blocking until enough are
/// available, releasing adds permits back. Permits are not owned by threads: any thread may
/// release, even one that never acquired. The count may be negative, in which case releases
/// must bring it back above zero before anyone can acquire again.
///
/// A nonfair semaphore lets arriving threads take available permits before queued ones, a fair
/// semaphore hands them out in FIFO order. The `try_acquire` methods without timeout always
/// barge.
pub struct Semaphore {
    sync: Synchronizer<SemaphorePolicy>,
}

/// State is the number of available permits.
#[derive(Debug)]
struct SemaphorePolicy {
    fair: bool,
}

impl Semaphore {
    crate::loom::loom_const_fn! {
        /// Returns a nonfair semaphore with `permits` available permits.
        #[must_use]
        pub fn new(permits: i32) -> Semaphore {
            Self::with_fairness(permits, false)
        }
    }

    crate::loom::loom_const_fn! {
        /// Returns a fair semaphore with `permits` available permits.
        #[must_use]
        pub fn new_fair(permits: i32) -> Semaphore {
            Self::with_fairness(permits, true)
        }
    }

    crate::loom::loom_const_fn! {
        /// Returns a semaphore with `permits` available permits and the given fairness.
        #[must_use]
        pub fn with_fairness(permits: i32, fair: bool) -> Semaphore {
            Self {
                sync: Synchronizer::with_state(SemaphorePolicy { fair }, permits),
            }
        }
    }

    /// Acquires a permit, waiting until one is available.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    pub fn acquire(&self) -> Result<(), Interrupted> {
        self.sync.acquire_shared_interruptibly(1)
    }

    /// Acquires a permit, waiting until one is available. Interrupts are only redelivered.
    pub fn acquire_uninterruptibly(&self) {
        self.sync.acquire_shared(1);
    }

    /// Acquires a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        nonfair_try_acquire_shared(&self.sync, 1) >= 0
    }

    /// Acquires a permit, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    pub fn try_acquire_for(&self, timeout: Duration) -> Result<bool, Interrupted> {
        self.sync.try_acquire_shared_for(1, timeout)
    }

    /// Acquires `permits` permits at once.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    ///
    /// # Panics
    ///
    /// Panics if `permits` is negative.
    pub fn acquire_many(&self, permits: i32) -> Result<(), Interrupted> {
        assert!(permits >= 0, "negative permit count");
        self.sync.acquire_shared_interruptibly(permits)
    }

    /// Acquires `permits` permits at once. Interrupts are only redelivered.
    ///
    /// # Panics
    ///
    /// Panics if `permits` is negative.
    pub fn acquire_many_uninterruptibly(&self, permits: i32) {
        assert!(permits >= 0, "negative permit count");
        self.sync.acquire_shared(permits);
    }

    /// Acquires `permits` permits if they are available right now.
    ///
    /// # Panics
    ///
    /// Panics if `permits` is negative.
    pub fn try_acquire_many(&self, permits: i32) -> bool {
        assert!(permits >= 0, "negative permit count");
        nonfair_try_acquire_shared(&self.sync, permits) >= 0
    }

    /// Acquires `permits` permits, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    ///
    /// # Panics
    ///
    /// Panics if `permits` is negative.
    pub fn try_acquire_many_for(
        &self,
        permits: i32,
        timeout: Duration,
    ) -> Result<bool, Interrupted> {
        assert!(permits >= 0, "negative permit count");
        self.sync.try_acquire_shared_for(permits, timeout)
    }

    /// Returns a permit.
    ///
    /// # Panics
    ///
    /// Panics if the permit count would exceed `i32::MAX`.
    pub fn release(&self) {
        self.sync.release_shared(1);
    }

    /// Returns `permits` permits.
    ///
    /// # Panics
    ///
    /// Panics if `permits` is negative or the permit count would exceed `i32::MAX`.
    pub fn release_many(&self, permits: i32) {
        assert!(permits >= 0, "negative permit count");
        self.sync.release_shared(permits);
    }

    /// Returns the number of permits currently available.
    pub fn available_permits(&self) -> i32 {
        self.sync.state()
    }

    /// Takes all available permits, returning how many there were.
    ///
    /// A negative permit count is reset to zero.
    pub fn drain_permits(&self) -> i32 {
        loop {
            let current = self.sync.state();
            if current == 0 || self.sync.compare_and_set_state(current, 0) {
                return current;
            }
        }
    }

    /// Shrinks the number of available permits by `reduction` without waiting.
    ///
    /// # Panics
    ///
    /// Panics if `reduction` is negative or the permit count would fall below `i32::MIN`.
    pub fn reduce_permits(&self, reduction: i32) {
        assert!(reduction >= 0, "negative permit reduction");
        loop {
            let current = self.sync.state();
            let next = current
                .checked_sub(reduction)
                .expect("permit count underflow");
            if self.sync.compare_and_set_state(current, next) {
                return;
            }
        }
    }

    pub fn is_fair(&self) -> bool {
        self.sync.policy().fair
    }

    /// Returns `true` if any thread is waiting to acquire.
    pub fn has_queued_threads(&self) -> bool {
        self.sync.has_queued_threads()
    }

    /// Returns an estimate of the number of threads waiting to acquire.
    pub fn queue_length(&self) -> usize {
        self.sync.queue_length()
    }

    /// Returns a snapshot of the threads waiting to acquire.
    pub fn queued_threads(&self) -> Vec<ThreadId> {
        self.sync.queued_threads()
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("permits", &self.available_permits())
            .field("fair", &self.is_fair())
            .finish_non_exhaustive()
    }
}

fn nonfair_try_acquire_shared(sync: &Synchronizer<SemaphorePolicy>, acquires: i32) -> i32 {
    loop {
        let available = sync.state();
        let remaining = available.saturating_sub(acquires);
        if remaining < 0 || sync.compare_and_set_state(available, remaining) {
            return remaining;
        }
    }
}

// === impl SemaphorePolicy ===

impl Shared for SemaphorePolicy {
    fn try_acquire_shared(&self, sync: &Synchronizer<Self>, acquires: i32) -> i32 {
        if self.fair && sync.has_queued_predecessors() {
            return -1;
        }
        nonfair_try_acquire_shared(sync, acquires)
    }

    fn try_release_shared(&self, sync: &Synchronizer<Self>, releases: i32) -> bool {
        loop {
            let current = sync.state();
            let next = current
                .checked_add(releases)
                .expect("maximum permit count exceeded");
            if sync.compare_and_set_state(current, next) {
                return true;
            }
        }
    }
}
