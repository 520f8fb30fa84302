// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Interrupted;
use crate::loom::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use crate::node::{Mode, OwnedNode, Status};
use crate::policy::{Exclusive, Shared};
use crate::queue::Queue;
use crate::reclaim;
use crate::Condition;
use core::fmt;
use core::time::Duration;
use park::ThreadId;
use std::time::Instant;

/// Timed waits closer than this to their deadline spin instead of parking, parking is less
/// precise than that anyway.
pub(crate) const SPIN_FOR_TIMEOUT_THRESHOLD: Duration = Duration::from_micros(1);

/// The shared core of a blocking synchronizer.
///
/// A synchronizer combines a 32-bit state word, an optional exclusive owner and a FIFO queue of
/// blocked threads. What the state *means* is decided by the policy `P`: it implements
/// [`Exclusive`], [`Shared`] or both, and only the operations of the implemented modes are
/// available. The synchronizer takes care of queueing, parking, waking, timeouts, interrupts
/// and cancellation.
///
/// Acquiring is not strictly FIFO: a thread trying to acquire first calls the policy once
/// without looking at the queue, and so may overtake queued threads. Policies that want strict
/// fairness call [`Synchronizer::has_queued_predecessors`] and fail if it returns `true`.
pub struct Synchronizer<P> {
    queue: Queue,
    state: AtomicI32,
    /// The [`ThreadId`] of the exclusive owner, or zero.
    owner: AtomicUsize,
    policy: P,
}

/// How a queued acquire waits.
#[derive(Clone, Copy)]
pub(crate) struct Wait {
    pub(crate) interruptible: bool,
    pub(crate) deadline: Option<Instant>,
}

/// How a queued acquire finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Acquired. `interrupted` tells whether an interrupt was swallowed meanwhile.
    Acquired { interrupted: bool },
    TimedOut { interrupted: bool },
    Interrupted,
}

/// Cancels a queued node unless disarmed, so waits that end by timing out, by interrupt or by
/// unwinding out of a policy hook all leave the queue consistent.
struct CancelOnDrop<'a> {
    queue: &'a Queue,
    node: &'a OwnedNode,
    armed: bool,
}

// === impl Synchronizer ===

impl<P> Synchronizer<P> {
    crate::loom::loom_const_fn! {
        /// Returns a new synchronizer with a state of zero and no owner.
        #[must_use]
        pub fn new(policy: P) -> Synchronizer<P> {
            Self::with_state(policy, 0)
        }
    }

    crate::loom::loom_const_fn! {
        /// Returns a new synchronizer with the given initial state and no owner.
        #[must_use]
        pub fn with_state(policy: P, state: i32) -> Synchronizer<P> {
            Self {
                queue: Queue::new(),
                state: AtomicI32::new(state),
                owner: AtomicUsize::new(0),
                policy,
            }
        }
    }

    /// Returns the policy this synchronizer was created with.
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Returns the current state.
    pub fn state(&self) -> i32 {
        self.state.load(Ordering::SeqCst)
    }

    /// Sets the state.
    pub fn set_state(&self, state: i32) {
        self.state.store(state, Ordering::SeqCst);
    }

    /// Atomically sets the state to `new` if it currently equals `expected`.
    pub fn compare_and_set_state(&self, expected: i32, new: i32) -> bool {
        self.state
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Returns the thread last recorded as exclusive owner.
    ///
    /// The synchronizer never sets the owner itself, policies record it on acquire and clear it
    /// on release.
    pub fn exclusive_owner(&self) -> Option<ThreadId> {
        // only ever compared against the calling thread, which sees its own writes
        ThreadId::from_usize(self.owner.load(Ordering::Relaxed))
    }

    /// Records `owner` as the exclusive owner, `None` clears it.
    pub fn set_exclusive_owner(&self, owner: Option<ThreadId>) {
        self.owner
            .store(owner.map_or(0, ThreadId::into_usize), Ordering::Relaxed);
    }

    /// Returns `true` if any thread is waiting to acquire.
    ///
    /// Cancellations may happen at any time, so a `true` result does not guarantee that any
    /// thread will ever acquire.
    pub fn has_queued_threads(&self) -> bool {
        self.queue.has_queued_threads()
    }

    /// Returns `true` if any thread ever had to wait for this synchronizer.
    pub fn has_contended(&self) -> bool {
        self.queue.has_contended()
    }

    /// Returns the longest waiting thread, or `None` if no thread is queued.
    pub fn first_queued_thread(&self) -> Option<ThreadId> {
        self.queue.first_queued_thread()
    }

    /// Returns `true` if `thread` is currently queued.
    pub fn is_queued(&self, thread: ThreadId) -> bool {
        self.queue.is_queued(thread)
    }

    /// Returns `true` if some other thread has been waiting to acquire longer than the calling
    /// thread. Fair policies fail their acquires when this returns `true`.
    pub fn has_queued_predecessors(&self) -> bool {
        self.queue.has_queued_predecessors()
    }

    /// Returns `true` if the first queued thread, if one exists, waits in exclusive mode.
    ///
    /// Readers-writer policies use this to keep new readers from starving a queued writer.
    pub fn apparently_first_queued_is_exclusive(&self) -> bool {
        self.queue.apparently_first_queued_is_exclusive()
    }

    /// Returns an estimate of the number of queued threads.
    pub fn queue_length(&self) -> usize {
        self.queue.queue_length()
    }

    /// Returns a snapshot of the queued threads, most recently queued first.
    pub fn queued_threads(&self) -> Vec<ThreadId> {
        self.queue.queued_threads(None)
    }

    /// Returns a snapshot of the threads queued in exclusive mode.
    pub fn exclusive_queued_threads(&self) -> Vec<ThreadId> {
        self.queue.queued_threads(Some(Mode::Exclusive))
    }

    /// Returns a snapshot of the threads queued in shared mode.
    pub fn shared_queued_threads(&self) -> Vec<ThreadId> {
        self.queue.queued_threads(Some(Mode::Shared))
    }

    pub(crate) fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Waits in the queue until `try_acquire` succeeds while `node` is first in line.
    ///
    /// `try_acquire` follows the shared-mode convention: negative on failure, otherwise the
    /// number of further shared acquires that may succeed.
    pub(crate) fn acquire_queued(
        &self,
        node: &OwnedNode,
        wait: Wait,
        mut try_acquire: impl FnMut() -> i32,
    ) -> Outcome {
        let mut cancel = CancelOnDrop {
            queue: &self.queue,
            node,
            armed: true,
        };
        let mut interrupted = false;

        loop {
            let guard = reclaim::pin();
            let this = node.get(&guard);
            let pred = this.prev.load(&guard).expect("queued node has no predecessor");

            if self.queue.is_head(pred, &guard) {
                let acquired = try_acquire();
                if acquired >= 0 {
                    match this.mode() {
                        Mode::Exclusive => self.queue.set_head(this, &guard),
                        Mode::Shared => self.queue.set_head_and_propagate(this, acquired, &guard),
                    }
                    pred.next.store(None, &guard);
                    cancel.armed = false;
                    return Outcome::Acquired { interrupted };
                }
            }

            let should_park = Queue::should_park_after_failed_acquire(pred, this, &guard);
            // never stay pinned while parked
            drop(guard);

            let timeout = match wait.deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Outcome::TimedOut { interrupted };
                    }
                    Some(deadline - now)
                }
            };

            if !should_park {
                continue;
            }

            match timeout {
                None => park::park(),
                Some(timeout) if timeout > SPIN_FOR_TIMEOUT_THRESHOLD => park::park_timeout(timeout),
                Some(_) => continue,
            }

            if park::interrupted() {
                if wait.interruptible {
                    return Outcome::Interrupted;
                }
                interrupted = true;
            }
        }
    }
}

impl<P: Exclusive> Synchronizer<P> {
    /// Attempts to acquire in exclusive mode without waiting.
    ///
    /// This consults the policy directly and so may succeed even if other threads are queued.
    pub fn try_acquire(&self, arg: i32) -> bool {
        self.policy.try_acquire(self, arg)
    }

    /// Acquires in exclusive mode, waiting as long as necessary.
    ///
    /// Interrupts do not abort the wait. An interrupt received while waiting is redelivered to
    /// the calling thread before returning.
    pub fn acquire(&self, arg: i32) {
        if self.policy.try_acquire(self, arg) {
            return;
        }

        let node = self.queue.add_waiter(Mode::Exclusive);
        let outcome = self.acquire_queued(&node, Wait::UNINTERRUPTIBLE, || {
            self.try_acquire_queued(arg)
        });
        if let Outcome::Acquired { interrupted: true } = outcome {
            self_interrupt();
        }
    }

    /// Acquires in exclusive mode, aborting if the calling thread is interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    pub fn acquire_interruptibly(&self, arg: i32) -> Result<(), Interrupted> {
        if park::interrupted() {
            return Err(Interrupted(()));
        }
        if self.policy.try_acquire(self, arg) {
            return Ok(());
        }

        let node = self.queue.add_waiter(Mode::Exclusive);
        match self.acquire_queued(&node, Wait::INTERRUPTIBLE, || self.try_acquire_queued(arg)) {
            Outcome::Interrupted => Err(Interrupted(())),
            Outcome::Acquired { .. } | Outcome::TimedOut { .. } => Ok(()),
        }
    }

    /// Acquires in exclusive mode, giving up once `deadline` has passed.
    ///
    /// Returns `Ok(false)` if the deadline passed before the synchronizer could be acquired.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    pub fn try_acquire_until(&self, arg: i32, deadline: Instant) -> Result<bool, Interrupted> {
        if park::interrupted() {
            return Err(Interrupted(()));
        }
        if self.policy.try_acquire(self, arg) {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }

        let node = self.queue.add_waiter(Mode::Exclusive);
        match self.acquire_queued(&node, Wait::until(deadline, true), || {
            self.try_acquire_queued(arg)
        }) {
            Outcome::Acquired { .. } => Ok(true),
            Outcome::TimedOut { .. } => Ok(false),
            Outcome::Interrupted => Err(Interrupted(())),
        }
    }

    /// Acquires in exclusive mode, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    pub fn try_acquire_for(&self, arg: i32, timeout: Duration) -> Result<bool, Interrupted> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_acquire_until(arg, deadline),
            // too far in the future to represent, as good as forever
            None => self.acquire_interruptibly(arg).map(|()| true),
        }
    }

    /// Like [`Synchronizer::try_acquire_until`], but interrupts only get redelivered.
    pub(crate) fn try_acquire_until_uninterruptibly(&self, arg: i32, deadline: Instant) -> bool {
        if self.policy.try_acquire(self, arg) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }

        let node = self.queue.add_waiter(Mode::Exclusive);
        match self.acquire_queued(&node, Wait::until(deadline, false), || {
            self.try_acquire_queued(arg)
        }) {
            Outcome::Acquired { interrupted } => {
                if interrupted {
                    self_interrupt();
                }
                true
            }
            Outcome::TimedOut { interrupted } => {
                if interrupted {
                    self_interrupt();
                }
                false
            }
            Outcome::Interrupted => false,
        }
    }

    /// Releases in exclusive mode, waking the next queued thread if the policy reports the
    /// synchronizer as fully released.
    ///
    /// Returns the policy's verdict.
    pub fn release(&self, arg: i32) -> bool {
        if self.policy.try_release(self, arg) {
            let guard = reclaim::pin();
            self.queue.signal_head(&guard);
            true
        } else {
            false
        }
    }

    /// Returns a new condition to be used together with this synchronizer.
    pub fn new_condition(&self) -> Condition {
        Condition::new()
    }

    /// Releases the whole state on behalf of a condition wait, returning what was released.
    ///
    /// # Panics
    ///
    /// Panics if the policy refuses to release. `node` is marked cancelled first so the
    /// condition skips it from then on.
    pub(crate) fn fully_release(&self, node: &OwnedNode) -> i32 {
        let mut cancel = MarkCancelledOnDrop { node, armed: true };
        let saved = self.state();
        if self.release(saved) {
            cancel.armed = false;
            saved
        } else {
            panic!("condition wait could not release its synchronizer");
        }
    }

    fn try_acquire_queued(&self, arg: i32) -> i32 {
        if self.policy.try_acquire(self, arg) {
            0
        } else {
            -1
        }
    }
}

impl<P: Shared> Synchronizer<P> {
    /// Attempts to acquire in shared mode without waiting.
    ///
    /// This consults the policy directly and so may succeed even if other threads are queued.
    pub fn try_acquire_shared(&self, arg: i32) -> bool {
        self.policy.try_acquire_shared(self, arg) >= 0
    }

    /// Acquires in shared mode, waiting as long as necessary.
    ///
    /// Interrupts do not abort the wait. An interrupt received while waiting is redelivered to
    /// the calling thread before returning.
    pub fn acquire_shared(&self, arg: i32) {
        if self.policy.try_acquire_shared(self, arg) >= 0 {
            return;
        }

        let node = self.queue.add_waiter(Mode::Shared);
        let outcome = self.acquire_queued(&node, Wait::UNINTERRUPTIBLE, || {
            self.policy.try_acquire_shared(self, arg)
        });
        if let Outcome::Acquired { interrupted: true } = outcome {
            self_interrupt();
        }
    }

    /// Acquires in shared mode, aborting if the calling thread is interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    pub fn acquire_shared_interruptibly(&self, arg: i32) -> Result<(), Interrupted> {
        if park::interrupted() {
            return Err(Interrupted(()));
        }
        if self.policy.try_acquire_shared(self, arg) >= 0 {
            return Ok(());
        }

        let node = self.queue.add_waiter(Mode::Shared);
        match self.acquire_queued(&node, Wait::INTERRUPTIBLE, || {
            self.policy.try_acquire_shared(self, arg)
        }) {
            Outcome::Interrupted => Err(Interrupted(())),
            Outcome::Acquired { .. } | Outcome::TimedOut { .. } => Ok(()),
        }
    }

    /// Acquires in shared mode, giving up once `deadline` has passed.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    pub fn try_acquire_shared_until(
        &self,
        arg: i32,
        deadline: Instant,
    ) -> Result<bool, Interrupted> {
        if park::interrupted() {
            return Err(Interrupted(()));
        }
        if self.policy.try_acquire_shared(self, arg) >= 0 {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }

        let node = self.queue.add_waiter(Mode::Shared);
        match self.acquire_queued(&node, Wait::until(deadline, true), || {
            self.policy.try_acquire_shared(self, arg)
        }) {
            Outcome::Acquired { .. } => Ok(true),
            Outcome::TimedOut { .. } => Ok(false),
            Outcome::Interrupted => Err(Interrupted(())),
        }
    }

    /// Acquires in shared mode, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    pub fn try_acquire_shared_for(&self, arg: i32, timeout: Duration) -> Result<bool, Interrupted> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_acquire_shared_until(arg, deadline),
            None => self.acquire_shared_interruptibly(arg).map(|()| true),
        }
    }

    /// Like [`Synchronizer::try_acquire_shared_until`], but interrupts only get redelivered.
    pub(crate) fn try_acquire_shared_until_uninterruptibly(
        &self,
        arg: i32,
        deadline: Instant,
    ) -> bool {
        if self.policy.try_acquire_shared(self, arg) >= 0 {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }

        let node = self.queue.add_waiter(Mode::Shared);
        let outcome = self.acquire_queued(&node, Wait::until(deadline, false), || {
            self.policy.try_acquire_shared(self, arg)
        });
        match outcome {
            Outcome::Acquired { interrupted } | Outcome::TimedOut { interrupted } => {
                if interrupted {
                    self_interrupt();
                }
                matches!(outcome, Outcome::Acquired { .. })
            }
            Outcome::Interrupted => false,
        }
    }

    /// Releases in shared mode, waking queued threads if the policy says an acquire may now
    /// succeed.
    ///
    /// Returns the policy's verdict.
    pub fn release_shared(&self, arg: i32) -> bool {
        if self.policy.try_release_shared(self, arg) {
            let guard = reclaim::pin();
            self.queue.release_shared(&guard);
            true
        } else {
            false
        }
    }
}

impl<P: fmt::Debug> fmt::Debug for Synchronizer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("state", &self.state())
            .field("owner", &self.exclusive_owner())
            .field("queued", &self.has_queued_threads())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Redelivers an interrupt that was swallowed by an uninterruptible wait.
fn self_interrupt() {
    park::current().interrupt();
}

// === impl Wait ===

impl Wait {
    pub(crate) const UNINTERRUPTIBLE: Self = Self {
        interruptible: false,
        deadline: None,
    };

    pub(crate) const INTERRUPTIBLE: Self = Self {
        interruptible: true,
        deadline: None,
    };

    pub(crate) fn until(deadline: Instant, interruptible: bool) -> Self {
        Self {
            interruptible,
            deadline: Some(deadline),
        }
    }
}

// === impl CancelOnDrop ===

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            let guard = reclaim::pin();
            self.queue.cancel_acquire(self.node.get(&guard), &guard);
        }
    }
}

struct MarkCancelledOnDrop<'a> {
    node: &'a OwnedNode,
    armed: bool,
}

impl Drop for MarkCancelledOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            let guard = reclaim::pin();
            self.node.get(&guard).set_status(Status::Cancelled);
        }
    }
}
