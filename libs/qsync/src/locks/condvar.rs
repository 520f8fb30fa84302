// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::mutex::{MutexPolicy, RawMutex};
use crate::{Condition, Interrupted, Synchronizer};
use core::fmt;
use core::time::Duration;
use lock_api::MutexGuard;
use std::time::Instant;

/// A condition variable for [`Mutex`](super::Mutex) and [`FairMutex`](super::FairMutex).
///
/// Unlike `std`'s condition variable, notifying requires the mutex guard: the wait list is
/// protected by the mutex itself. Waits may return spuriously, so always wait in a loop that
/// re-checks the awaited condition (or use [`Condvar::wait_while`]).
///
/// A `Condvar` must always be used with the same mutex while threads are waiting on it.
pub struct Condvar {
    condition: Condition,
}

/// Whether a timed wait on a [`Condvar`] returned because the timeout elapsed.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct WaitTimeoutResult(bool);

impl WaitTimeoutResult {
    /// Returns `true` if the wait is known to have timed out.
    #[must_use]
    pub fn timed_out(self) -> bool {
        self.0
    }
}

impl Condvar {
    /// Returns a condition variable without waiters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            condition: Condition::new(),
        }
    }

    /// Atomically unlocks the guard's mutex and blocks until notified, then relocks the mutex.
    ///
    /// Interrupts don't end the wait. An interrupt received while waiting is redelivered before
    /// returning.
    pub fn wait<T: ?Sized, const FAIR: bool>(&self, guard: &mut MutexGuard<'_, RawMutex<FAIR>, T>) {
        self.condition.wait_uninterruptibly(synchronizer(guard));
    }

    /// Like [`Condvar::wait`] but aborts when the calling thread is interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting. The
    /// mutex is locked again in either case.
    pub fn wait_interruptibly<T: ?Sized, const FAIR: bool>(
        &self,
        guard: &mut MutexGuard<'_, RawMutex<FAIR>, T>,
    ) -> Result<(), Interrupted> {
        self.condition.wait(synchronizer(guard))
    }

    /// Blocks until `condition` returns `false`, re-checking it after every wakeup.
    pub fn wait_while<T: ?Sized, const FAIR: bool>(
        &self,
        guard: &mut MutexGuard<'_, RawMutex<FAIR>, T>,
        mut condition: impl FnMut(&mut T) -> bool,
    ) {
        while condition(&mut **guard) {
            self.wait(guard);
        }
    }

    /// Like [`Condvar::wait`] but gives up after `timeout`.
    pub fn wait_for<T: ?Sized, const FAIR: bool>(
        &self,
        guard: &mut MutexGuard<'_, RawMutex<FAIR>, T>,
        timeout: Duration,
    ) -> WaitTimeoutResult {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(guard, deadline),
            None => {
                self.wait(guard);
                WaitTimeoutResult(false)
            }
        }
    }

    /// Like [`Condvar::wait`] but gives up once `deadline` has passed.
    pub fn wait_until<T: ?Sized, const FAIR: bool>(
        &self,
        guard: &mut MutexGuard<'_, RawMutex<FAIR>, T>,
        deadline: Instant,
    ) -> WaitTimeoutResult {
        let signalled = self
            .condition
            .wait_until_uninterruptibly(synchronizer(guard), deadline);
        WaitTimeoutResult(!signalled)
    }

    /// Like [`Condvar::wait_for`] but aborts when the calling thread is interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    pub fn wait_for_interruptibly<T: ?Sized, const FAIR: bool>(
        &self,
        guard: &mut MutexGuard<'_, RawMutex<FAIR>, T>,
        timeout: Duration,
    ) -> Result<WaitTimeoutResult, Interrupted> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until_interruptibly(guard, deadline),
            None => self
                .wait_interruptibly(guard)
                .map(|()| WaitTimeoutResult(false)),
        }
    }

    /// Like [`Condvar::wait_until`] but aborts when the calling thread is interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    pub fn wait_until_interruptibly<T: ?Sized, const FAIR: bool>(
        &self,
        guard: &mut MutexGuard<'_, RawMutex<FAIR>, T>,
        deadline: Instant,
    ) -> Result<WaitTimeoutResult, Interrupted> {
        let signalled = self.condition.wait_until(synchronizer(guard), deadline)?;
        Ok(WaitTimeoutResult(!signalled))
    }

    /// Wakes the longest waiting thread, if any.
    ///
    /// The woken thread reacquires the mutex once the caller unlocks it.
    pub fn notify_one<T: ?Sized, const FAIR: bool>(&self, guard: &MutexGuard<'_, RawMutex<FAIR>, T>) {
        self.condition.signal(synchronizer(guard));
    }

    /// Wakes all waiting threads.
    pub fn notify_all<T: ?Sized, const FAIR: bool>(&self, guard: &MutexGuard<'_, RawMutex<FAIR>, T>) {
        self.condition.signal_all(synchronizer(guard));
    }

    /// Returns `true` if any thread is waiting on this condition variable.
    pub fn has_waiters<T: ?Sized, const FAIR: bool>(
        &self,
        guard: &MutexGuard<'_, RawMutex<FAIR>, T>,
    ) -> bool {
        self.condition.has_waiters(synchronizer(guard))
    }
}

fn synchronizer<'a, T: ?Sized, const FAIR: bool>(
    guard: &MutexGuard<'a, RawMutex<FAIR>, T>,
) -> &'a Synchronizer<MutexPolicy<FAIR>> {
    let mutex = MutexGuard::mutex(guard);
    // Safety: the raw mutex is only used to release and reacquire the lock the guard holds, the
    // lock is held again by the time control returns to the guard's owner
    unsafe { mutex.raw() }.synchronizer()
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::Mutex;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn notify_one() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));

        let pair2 = pair.clone();
        let waiter = thread::spawn(move || {
            let (lock, cvar) = &*pair2;
            let mut started = lock.lock();
            cvar.wait_while(&mut started, |started| !*started);
        });

        let (lock, cvar) = &*pair;
        let mut started = lock.lock();
        *started = true;
        cvar.notify_one(&started);
        drop(started);

        waiter.join().unwrap();
    }

    #[test]
    fn notify_all_wakes_every_waiter() {
        const THREADS: usize = 4;

        let shared = Arc::new((Mutex::new((0_usize, false)), Condvar::new()));
        let threads: Vec<_> = (0..THREADS)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    let (lock, cvar) = &*shared;
                    let mut state = lock.lock();
                    state.0 += 1;
                    while !state.1 {
                        cvar.wait(&mut state);
                    }
                })
            })
            .collect();

        let (lock, cvar) = &*shared;
        loop {
            let mut state = lock.lock();
            if state.0 == THREADS {
                state.1 = true;
                cvar.notify_all(&state);
                break;
            }
            drop(state);
            thread::yield_now();
        }

        for thread in threads {
            thread.join().unwrap();
        }
        assert!(!cvar.has_waiters(&lock.lock()));
    }

    #[test]
    fn wait_for_times_out() {
        let m = Mutex::new(());
        let c = Condvar::new();
        let mut g = m.lock();
        let res = c.wait_for(&mut g, Duration::from_millis(1));
        assert!(res.timed_out());
        // still locked by us
        assert!(m.try_lock().is_none());
    }

    #[test]
    fn interrupt_ends_interruptible_wait() {
        let m = Mutex::new(());
        let c = Condvar::new();
        let mut g = m.lock();

        park::current().interrupt();
        assert_eq!(c.wait_interruptibly(&mut g), Err(Interrupted(())));
        assert_eq!(
            c.wait_for_interruptibly(&mut g, Duration::from_millis(1)),
            Ok(WaitTimeoutResult(true))
        );
    }
}
