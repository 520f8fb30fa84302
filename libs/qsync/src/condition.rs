// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Interrupted;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::node::{Link, NodeRef, OwnedNode, Status};
use crate::policy::Exclusive;
use crate::reclaim::{self, Guard};
use crate::synchronizer::{Outcome, SPIN_FOR_TIMEOUT_THRESHOLD, Synchronizer, Wait};
use core::fmt;
use core::ptr;
use core::time::Duration;
use park::ThreadId;
use std::time::Instant;

/// A condition queue attached to an exclusively held [`Synchronizer`].
///
/// Threads holding the synchronizer wait on the condition, which atomically releases the
/// synchronizer and blocks until another holder signals the condition. A signalled thread
/// reacquires the synchronizer, restoring the full state it released, before its wait returns.
///
/// Every method takes the synchronizer as an argument and requires the calling thread to hold
/// it exclusively. A condition must always be used with the same synchronizer.
///
/// Waits may return spuriously, callers should wait in a loop that re-checks their predicate.
pub struct Condition {
    first: Link,
    last: Link,
    /// Address of the synchronizer the current waiters belong to.
    bound: AtomicUsize,
}

/// How a condition wait reports an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptMode {
    None,
    /// Interrupted before being signalled, return an error.
    Throw,
    /// Interrupted after being signalled, or in an uninterruptible wait. Redeliver the
    /// interrupt and return normally.
    Reinterrupt,
}

impl Condition {
    crate::loom::loom_const_fn! {
        /// Returns a condition without waiters.
        #[must_use]
        pub fn new() -> Condition {
            Self {
                first: Link::empty(),
                last: Link::empty(),
                bound: AtomicUsize::new(0),
            }
        }
    }

    /// Releases `sync` and waits until signalled or interrupted, then reacquires `sync`.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting. The
    /// synchronizer is held again in either case.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold `sync` exclusively.
    #[track_caller]
    pub fn wait<P: Exclusive>(&self, sync: &Synchronizer<P>) -> Result<(), Interrupted> {
        self.wait_inner(sync, Wait::INTERRUPTIBLE).map(|_| ())
    }

    /// Releases `sync` and waits until signalled, then reacquires `sync`.
    ///
    /// An interrupt received while waiting is redelivered before returning.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold `sync` exclusively.
    #[track_caller]
    pub fn wait_uninterruptibly<P: Exclusive>(&self, sync: &Synchronizer<P>) {
        let _ = self.wait_inner(sync, Wait::UNINTERRUPTIBLE);
    }

    /// Releases `sync` and waits until signalled, interrupted or `timeout` elapsed, then
    /// reacquires `sync`.
    ///
    /// Returns `None` if the wait timed out, otherwise an estimate of the time left until the
    /// timeout, which callers may use to resume waiting after a spurious wakeup.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold `sync` exclusively.
    #[track_caller]
    pub fn wait_timeout<P: Exclusive>(
        &self,
        sync: &Synchronizer<P>,
        timeout: Duration,
    ) -> Result<Option<Duration>, Interrupted> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait(sync)?;
            return Ok(Some(timeout));
        };

        if self.wait_until(sync, deadline)? {
            Ok(Some(deadline.saturating_duration_since(Instant::now())))
        } else {
            Ok(None)
        }
    }

    /// Releases `sync` and waits until signalled, interrupted or `deadline` passed, then
    /// reacquires `sync`.
    ///
    /// Returns `false` if the deadline passed before the thread was signalled.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold `sync` exclusively.
    #[track_caller]
    pub fn wait_until<P: Exclusive>(
        &self,
        sync: &Synchronizer<P>,
        deadline: Instant,
    ) -> Result<bool, Interrupted> {
        self.wait_inner(sync, Wait::until(deadline, true))
    }

    /// Like [`Condition::wait_until`] but interrupts are only redelivered.
    #[track_caller]
    pub(crate) fn wait_until_uninterruptibly<P: Exclusive>(
        &self,
        sync: &Synchronizer<P>,
        deadline: Instant,
    ) -> bool {
        self.wait_inner(sync, Wait::until(deadline, false))
            .unwrap_or(true)
    }

    /// Moves the longest waiting thread, if any, to the synchronizer's queue so it reacquires
    /// once the caller releases.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold `sync` exclusively.
    #[track_caller]
    pub fn signal<P: Exclusive>(&self, sync: &Synchronizer<P>) {
        self.assert_held(sync);

        let guard = reclaim::pin();
        while let Some(first) = self.pop_first(sync, &guard) {
            if sync.queue().transfer_for_signal(first, &guard) {
                return;
            }
        }
    }

    /// Moves all waiting threads to the synchronizer's queue.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold `sync` exclusively.
    #[track_caller]
    pub fn signal_all<P: Exclusive>(&self, sync: &Synchronizer<P>) {
        self.assert_held(sync);

        let guard = reclaim::pin();
        while let Some(first) = self.pop_first(sync, &guard) {
            sync.queue().transfer_for_signal(first, &guard);
        }
    }

    /// Returns `true` if any thread is waiting on this condition.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold `sync` exclusively.
    #[track_caller]
    pub fn has_waiters<P: Exclusive>(&self, sync: &Synchronizer<P>) -> bool {
        self.wait_queue_length(sync) > 0
    }

    /// Returns an estimate of the number of threads waiting on this condition.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold `sync` exclusively.
    #[track_caller]
    pub fn wait_queue_length<P: Exclusive>(&self, sync: &Synchronizer<P>) -> usize {
        let mut len = 0;
        self.for_each_waiter(sync, |_| len += 1);
        len
    }

    /// Returns a snapshot of the threads waiting on this condition, longest waiting first.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't hold `sync` exclusively.
    #[track_caller]
    pub fn waiting_threads<P: Exclusive>(&self, sync: &Synchronizer<P>) -> Vec<ThreadId> {
        let mut threads = Vec::new();
        self.for_each_waiter(sync, |thread| threads.push(thread));
        threads
    }

    #[track_caller]
    fn for_each_waiter<P: Exclusive>(&self, sync: &Synchronizer<P>, mut f: impl FnMut(ThreadId)) {
        self.assert_held(sync);

        let guard = reclaim::pin();
        let mut cursor = self.first.load(&guard);
        while let Some(node) = cursor {
            if node.status() == Status::Condition {
                if let Some(thread) = node.thread() {
                    f(thread.id());
                }
            }
            cursor = node.next_waiter.load(&guard);
        }
    }

    #[track_caller]
    fn wait_inner<P: Exclusive>(
        &self,
        sync: &Synchronizer<P>,
        wait: Wait,
    ) -> Result<bool, Interrupted> {
        if wait.interruptible && park::interrupted() {
            return Err(Interrupted(()));
        }
        self.assert_held(sync);

        let node = self.add_waiter(sync);
        let saved = sync.fully_release(&node);
        tracing::trace!(saved, "waiting on condition");

        let mut interrupt_mode = InterruptMode::None;
        let mut timed_out = false;
        loop {
            {
                let guard = reclaim::pin();
                if sync.queue().is_on_sync_queue(node.get(&guard), &guard) {
                    break;
                }
            }

            match wait.deadline {
                None => park::park(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        timed_out = sync.queue().transfer_after_cancelled_wait(&node);
                        break;
                    }
                    let timeout = deadline - now;
                    if timeout > SPIN_FOR_TIMEOUT_THRESHOLD {
                        park::park_timeout(timeout);
                    }
                }
            }

            if park::interrupted() {
                if wait.interruptible {
                    // an interrupt that beat the signal is reported, a later one redelivered
                    interrupt_mode = if sync.queue().transfer_after_cancelled_wait(&node) {
                        InterruptMode::Throw
                    } else {
                        InterruptMode::Reinterrupt
                    };
                    break;
                }
                interrupt_mode = InterruptMode::Reinterrupt;
            }
        }

        let outcome = sync.acquire_queued(&node, Wait::UNINTERRUPTIBLE, || {
            if sync.policy().try_acquire(sync, saved) {
                0
            } else {
                -1
            }
        });
        if outcome == (Outcome::Acquired { interrupted: true })
            && interrupt_mode != InterruptMode::Throw
        {
            interrupt_mode = InterruptMode::Reinterrupt;
        }

        {
            let guard = reclaim::pin();
            // we left the list on our own, tidy up now that we hold the synchronizer again
            if node.get(&guard).next_waiter.is_linked() {
                self.unlink_cancelled_waiters(&guard);
            }
        }

        match interrupt_mode {
            InterruptMode::Throw => Err(Interrupted(())),
            InterruptMode::Reinterrupt => {
                park::current().interrupt();
                Ok(!timed_out)
            }
            InterruptMode::None => Ok(!timed_out),
        }
    }

    /// Appends a node for the calling thread to the wait list.
    #[track_caller]
    fn add_waiter<P>(&self, sync: &Synchronizer<P>) -> OwnedNode {
        let guard = reclaim::pin();

        if let Some(last) = self.last.load(&guard) {
            if last.status() != Status::Condition {
                self.unlink_cancelled_waiters(&guard);
            }
        }

        let owned = OwnedNode::condition_waiter();
        let node = owned.get(&guard);
        match self.last.load(&guard) {
            None => {
                // every remaining waiter holds a borrow of the synchronizer, so with none left
                // the condition may follow the synchronizer to a new address
                self.bound.store(addr_of(sync), Ordering::Relaxed);
                self.first.store(Some(node), &guard);
            }
            Some(last) => {
                self.assert_bound(sync);
                last.next_waiter.store(Some(node), &guard);
            }
        }
        self.last.store(Some(node), &guard);

        owned
    }

    /// Takes the first node off the wait list.
    #[track_caller]
    fn pop_first<'g, P>(&self, sync: &Synchronizer<P>, guard: &'g Guard) -> Option<NodeRef<'g>> {
        let first = self.first.load(guard)?;
        if first.status() == Status::Condition {
            self.assert_bound(sync);
        }
        let next = first.next_waiter.load(guard);
        self.first.store(next, guard);
        if next.is_none() {
            self.last.store(None, guard);
        }
        first.next_waiter.store(None, guard);
        Some(first)
    }

    /// Unlinks all nodes that are no longer waiting on the condition.
    fn unlink_cancelled_waiters(&self, guard: &Guard) {
        let mut trail = None;
        let mut cursor = self.first.load(guard);
        while let Some(node) = cursor {
            let next = node.next_waiter.load(guard);
            if node.status() == Status::Condition {
                trail = Some(node);
            } else {
                match trail {
                    None => self.first.store(next, guard),
                    Some(trail) => trail.next_waiter.store(next, guard),
                };
                if next.is_none() {
                    self.last.store(trail, guard);
                }
                node.next_waiter.store(None, guard);
            }
            cursor = next;
        }
    }

    #[track_caller]
    fn assert_held<P: Exclusive>(&self, sync: &Synchronizer<P>) {
        assert!(
            sync.policy().is_held_exclusively(sync),
            "condition used without holding its synchronizer exclusively"
        );
    }

    /// Checks that `sync` is the synchronizer the live waiters released.
    #[track_caller]
    fn assert_bound<P>(&self, sync: &Synchronizer<P>) {
        assert_eq!(
            self.bound.load(Ordering::Relaxed),
            addr_of(sync),
            "condition used with more than one synchronizer"
        );
    }
}

fn addr_of<P>(sync: &Synchronizer<P>) -> usize {
    ptr::from_ref(sync).addr()
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("has_waiters", &self.first.is_linked())
            .finish_non_exhaustive()
    }
}

impl Drop for Condition {
    fn drop(&mut self) {
        let guard = reclaim::pin();
        self.first.store(None, &guard);
        self.last.store(None, &guard);
    }
}
