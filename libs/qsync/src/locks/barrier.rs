// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{Condvar, Mutex, MutexGuard};
use crate::BarrierError;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// A reusable rendezvous point for a fixed number of threads.
///
/// Each thread calling [`wait`](CyclicBarrier::wait) blocks until `parties` threads have
/// arrived, then all of them continue and the barrier resets for the next round. An optional
/// action runs once per round, on the last thread to arrive, before anyone is released.
///
/// If any party is interrupted, times out, or the action panics, the barrier breaks: every
/// thread waiting in that round returns [`BarrierError::Broken`], and so do later waits until
/// [`reset`](CyclicBarrier::reset) is called.
pub struct CyclicBarrier {
    lock: Mutex<BarrierState>,
    trip: Condvar,
    parties: usize,
    action: Option<Box<dyn Fn() + Send + Sync>>,
}

struct BarrierState {
    /// Parties still missing in the current round.
    count: usize,
    generation: Arc<Generation>,
}

/// One round of the barrier. Only read and written with the lock held.
#[derive(Default)]
struct Generation {
    broken: AtomicBool,
}

/// Returned by [`CyclicBarrier`] waits that completed a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierWaitResult {
    index: usize,
}

impl BarrierWaitResult {
    /// Returns the arrival index of the thread: `parties - 1` for the first to arrive, `0` for
    /// the last.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns `true` for exactly one thread per round, the one that arrived last and ran the
    /// barrier action.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.index == 0
    }
}

impl CyclicBarrier {
    /// Returns a barrier that trips once `parties` threads are waiting.
    ///
    /// # Panics
    ///
    /// Panics if `parties` is zero.
    #[must_use]
    pub fn new(parties: usize) -> Self {
        Self::new_inner(parties, None)
    }

    /// Returns a barrier that trips once `parties` threads are waiting and runs `action` on the
    /// last thread to arrive, before the others are released.
    ///
    /// # Panics
    ///
    /// Panics if `parties` is zero.
    #[must_use]
    pub fn with_action(parties: usize, action: impl Fn() + Send + Sync + 'static) -> Self {
        Self::new_inner(parties, Some(Box::new(action)))
    }

    fn new_inner(parties: usize, action: Option<Box<dyn Fn() + Send + Sync>>) -> Self {
        assert!(parties > 0, "barrier needs at least one party");
        Self {
            lock: Mutex::new(BarrierState {
                count: parties,
                generation: Arc::default(),
            }),
            trip: Condvar::new(),
            parties,
            action,
        }
    }

    /// Waits until all parties have called `wait` on this barrier.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Broken`] if the barrier is or becomes broken while waiting.
    /// - [`BarrierError::Interrupted`] if the calling thread was interrupted, which breaks the
    ///   barrier for everyone else.
    ///
    /// # Panics
    ///
    /// Resumes the panic if this thread ran the barrier action and it panicked. The barrier is
    /// broken in that case.
    pub fn wait(&self) -> Result<BarrierWaitResult, BarrierError> {
        self.dowait(None)
    }

    /// Like [`CyclicBarrier::wait`] but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Same as [`CyclicBarrier::wait`], plus [`BarrierError::TimedOut`] if `timeout` elapsed
    /// first. Timing out breaks the barrier for everyone else.
    ///
    /// # Panics
    ///
    /// Resumes the panic if this thread ran the barrier action and it panicked.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<BarrierWaitResult, BarrierError> {
        self.dowait(Instant::now().checked_add(timeout))
    }

    /// Returns the number of threads needed to trip the barrier.
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Returns `true` if the current round was broken.
    pub fn is_broken(&self) -> bool {
        self.lock.lock().generation.broken.load(Ordering::Relaxed)
    }

    /// Breaks the current round, then starts a fresh one.
    ///
    /// Threads waiting in the current round return [`BarrierError::Broken`].
    pub fn reset(&self) {
        let mut state = self.lock.lock();
        self.break_barrier(&mut state);
        self.next_generation(&mut state);
    }

    /// Returns the number of threads currently waiting at the barrier.
    pub fn number_waiting(&self) -> usize {
        self.parties - self.lock.lock().count
    }

    fn dowait(&self, deadline: Option<Instant>) -> Result<BarrierWaitResult, BarrierError> {
        let mut state = self.lock.lock();
        let generation = state.generation.clone();

        if generation.broken.load(Ordering::Relaxed) {
            return Err(BarrierError::Broken);
        }

        if park::interrupted() {
            self.break_barrier(&mut state);
            return Err(BarrierError::Interrupted);
        }

        state.count -= 1;
        let index = state.count;
        if index == 0 {
            if let Some(action) = &self.action
                && let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| action()))
            {
                self.break_barrier(&mut state);
                drop(state);
                panic::resume_unwind(payload);
            }
            self.next_generation(&mut state);
            return Ok(BarrierWaitResult { index: 0 });
        }

        loop {
            let res = match deadline {
                None => self.trip.wait_interruptibly(&mut state),
                Some(deadline) if Instant::now() < deadline => self
                    .trip
                    .wait_until_interruptibly(&mut state, deadline)
                    .map(drop),
                Some(_) => Ok(()),
            };

            if res.is_err() {
                if Arc::ptr_eq(&generation, &state.generation)
                    && !generation.broken.load(Ordering::Relaxed)
                {
                    self.break_barrier(&mut state);
                    return Err(BarrierError::Interrupted);
                }
                // the round completed or broke anyway, keep the interrupt for later
                park::current().interrupt();
            }

            if generation.broken.load(Ordering::Relaxed) {
                return Err(BarrierError::Broken);
            }

            if !Arc::ptr_eq(&generation, &state.generation) {
                return Ok(BarrierWaitResult { index });
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                self.break_barrier(&mut state);
                return Err(BarrierError::TimedOut);
            }
        }
    }

    fn break_barrier(&self, state: &mut MutexGuard<'_, BarrierState>) {
        tracing::debug!(
            parties = self.parties,
            waiting = self.parties - state.count,
            "barrier broken"
        );
        state.generation.broken.store(true, Ordering::Relaxed);
        state.count = self.parties;
        self.trip.notify_all(state);
    }

    fn next_generation(&self, state: &mut MutexGuard<'_, BarrierState>) {
        self.trip.notify_all(state);
        state.count = self.parties;
        state.generation = Arc::default();
    }
}

impl fmt::Debug for CyclicBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CyclicBarrier")
            .field("parties", &self.parties)
            .field("has_action", &self.action.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_barrier() {
        const N: usize = 10;

        let barrier = Arc::new(CyclicBarrier::new(N));
        let (tx, rx) = mpsc::channel();

        for _ in 0..N - 1 {
            let c = barrier.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                tx.send(c.wait().unwrap().is_leader()).unwrap();
            });
        }

        // At this point, all spawned threads should be blocked,
        // so we shouldn't get anything from the port
        assert!(rx.try_recv().is_err());

        let mut leader_found = barrier.wait().unwrap().is_leader();

        // Now, the barrier is cleared and we should get data.
        for _ in 0..N - 1 {
            if rx.recv().unwrap() {
                assert!(!leader_found);
                leader_found = true;
            }
        }
        assert!(leader_found);
    }

    #[test]
    fn action_runs_once_per_round() {
        const PARTIES: usize = 3;
        const ROUNDS: usize = 5;

        let trips = Arc::new(AtomicUsize::new(0));
        let barrier = {
            let trips = trips.clone();
            Arc::new(CyclicBarrier::with_action(PARTIES, move || {
                trips.fetch_add(1, Ordering::SeqCst);
            }))
        };

        let threads: Vec<_> = (0..PARTIES)
            .map(|_| {
                let barrier = barrier.clone();
                let trips = trips.clone();
                thread::spawn(move || {
                    let mut indices = Vec::new();
                    for round in 0..ROUNDS {
                        indices.push(barrier.wait().unwrap().index());
                        // the action ran before anyone was released
                        assert!(trips.load(Ordering::SeqCst) > round);
                    }
                    indices
                })
            })
            .collect();

        for thread in threads {
            let indices = thread.join().unwrap();
            assert!(indices.iter().all(|&i| i < PARTIES));
        }
        assert_eq!(trips.load(Ordering::SeqCst), ROUNDS);
        assert_eq!(barrier.number_waiting(), 0);
        assert!(!barrier.is_broken());
    }

    #[test]
    fn timeout_breaks_barrier() {
        let barrier = CyclicBarrier::new(2);
        assert_eq!(
            barrier.wait_timeout(Duration::from_millis(5)),
            Err(BarrierError::TimedOut)
        );
        assert!(barrier.is_broken());
        assert_eq!(barrier.wait(), Err(BarrierError::Broken));

        barrier.reset();
        assert!(!barrier.is_broken());
        assert_eq!(barrier.number_waiting(), 0);
    }

    #[test]
    fn reset_releases_waiters_as_broken() {
        let barrier = Arc::new(CyclicBarrier::new(2));
        let waiter = {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.wait())
        };

        while barrier.number_waiting() == 0 {
            thread::yield_now();
        }
        barrier.reset();

        assert_eq!(waiter.join().unwrap(), Err(BarrierError::Broken));
        assert!(!barrier.is_broken());
    }

    #[test]
    fn pending_interrupt_breaks_barrier() {
        let barrier = CyclicBarrier::new(2);
        park::current().interrupt();
        assert_eq!(barrier.wait(), Err(BarrierError::Interrupted));
        assert!(!park::interrupted());
        assert!(barrier.is_broken());
    }

    #[test]
    fn panicking_action_breaks_barrier() {
        let barrier = Arc::new(CyclicBarrier::with_action(1, || panic!("action failed")));

        let b = barrier.clone();
        let res = thread::spawn(move || b.wait()).join();
        assert!(res.is_err());
        assert!(barrier.is_broken());
        assert_eq!(barrier.wait(), Err(BarrierError::Broken));
    }

    #[test]
    #[should_panic = "barrier needs at least one party"]
    fn zero_parties_panics() {
        let _ = CyclicBarrier::new(0);
    }
}
