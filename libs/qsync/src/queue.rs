// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The lock-free CLH-style wait queue.
//!
//! The queue is a doubly linked list of [`Node`]s whose head is a threadless sentinel standing
//! for the current owner. Threads append themselves at the tail with a CAS and only park once
//! their predecessor carries [`Status::Signal`], promising to unpark them.
//!
//! `prev` links are authoritative: a node's `prev` is only ever changed by the node's own
//! thread, and is final once the node is cancelled. `next` links are hints that may lag behind
//! or be cleared by cancellation, so whenever a `next` link looks unusable we scan backwards
//! from the tail instead.

use crate::loom::thread;
use crate::node::{Link, Mode, Node, NodeRef, OwnedNode, Status};
use crate::reclaim::{self, Guard};
use park::ThreadId;

pub(crate) struct Queue {
    head: Link,
    tail: Link,
}

impl Queue {
    crate::loom::loom_const_fn! {
        pub(crate) fn new() -> Queue {
            Self {
                head: Link::empty(),
                tail: Link::empty(),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn head<'g>(&self, guard: &'g Guard) -> Option<NodeRef<'g>> {
        self.head.load(guard)
    }

    pub(crate) fn is_head(&self, node: NodeRef<'_>, guard: &Guard) -> bool {
        self.head.load(guard) == Some(node)
    }

    /// Inserts `node` at the tail, installing the sentinel head first if the queue was never
    /// used. Returns the node's predecessor.
    pub(crate) fn enq<'g>(&self, node: NodeRef<'g>, guard: &'g Guard) -> NodeRef<'g> {
        loop {
            let Some(tail) = self.tail.load(guard) else {
                let sentinel = OwnedNode::sentinel();
                let sentinel = sentinel.get(guard);
                if self.head.compare_and_set(None, Some(sentinel), guard) {
                    self.tail.store(Some(sentinel), guard);
                }
                continue;
            };

            // the tail may have been cancelled and dropped out of the queue since we loaded it
            if !node.prev.store(Some(tail), guard) {
                continue;
            }
            if self.tail.compare_and_set(Some(tail), Some(node), guard) {
                tail.next.store(Some(node), guard);
                return tail;
            }
        }
    }

    /// Creates a node for the calling thread and appends it to the queue.
    pub(crate) fn add_waiter(&self, mode: Mode) -> OwnedNode {
        let owned = OwnedNode::waiter(mode);
        let guard = reclaim::pin();
        let node = owned.get(&guard);

        // fast path, fall back to the full retry loop on contention
        if let Some(pred) = self.tail.load(&guard) {
            if node.prev.store(Some(pred), &guard)
                && self.tail.compare_and_set(Some(pred), Some(node), &guard)
            {
                pred.next.store(Some(node), &guard);
                return owned;
            }
        }

        self.enq(node, &guard);
        owned
    }

    /// Makes `node` the new sentinel. Only called by the thread that just acquired.
    pub(crate) fn set_head(&self, node: NodeRef<'_>, guard: &Guard) {
        self.head.store(Some(node), guard);
        node.clear_thread();
        node.prev.store(None, guard);
    }

    /// Wakes the first live successor of `node`, if any.
    pub(crate) fn unpark_successor<'g>(&self, node: NodeRef<'g>, guard: &'g Guard) {
        // clear the signal obligation, it is being fulfilled right now. Failing is fine, the
        // successor re-checks before parking.
        let status = node.status();
        if status.raw() < 0 {
            node.compare_and_set_status(status, Status::Initial);
        }

        let mut successor = node
            .next
            .load(guard)
            .filter(|next| !next.status().is_cancelled());

        if successor.is_none() {
            let mut cursor = self.tail.load(guard);
            while let Some(candidate) = cursor {
                if candidate == node {
                    break;
                }
                if !candidate.status().is_cancelled() {
                    successor = Some(candidate);
                }
                cursor = candidate.prev.load(guard);
            }
        }

        if let Some(thread) = successor.as_ref().and_then(|successor| successor.thread()) {
            thread.unpark();
        }
    }

    /// Wakes the head's successor after an exclusive release, if the head owes it a signal.
    pub(crate) fn signal_head(&self, guard: &Guard) {
        if let Some(head) = self.head.load(guard) {
            if head.status() != Status::Initial {
                self.unpark_successor(head, guard);
            }
        }
    }

    /// Signals the successor after a shared release and makes sure the release propagates.
    ///
    /// Unlike exclusive release this also acts when the head owes no signal: the head is then
    /// marked [`Status::Propagate`] so a concurrently succeeding shared acquirer keeps waking
    /// its own successors.
    pub(crate) fn release_shared(&self, guard: &Guard) {
        loop {
            let head = self.head.load(guard);
            if let Some(head) = head {
                if Some(head) != self.tail.load(guard) {
                    match head.status() {
                        Status::Signal => {
                            if !head.compare_and_set_status(Status::Signal, Status::Initial) {
                                continue;
                            }
                            self.unpark_successor(head, guard);
                        }
                        Status::Initial => {
                            if !head.compare_and_set_status(Status::Initial, Status::Propagate) {
                                continue;
                            }
                        }
                        _ => {}
                    }
                }
            }

            // a new head means somebody acquired meanwhile, keep propagating on their behalf
            if head == self.head.load(guard) {
                return;
            }
        }
    }

    /// Makes `node` the new head after a shared acquire and propagates the wakeup if more
    /// resources may be available.
    pub(crate) fn set_head_and_propagate<'g>(
        &self,
        node: NodeRef<'g>,
        propagate: i32,
        guard: &'g Guard,
    ) {
        let old_head = self.head.load(guard);
        self.set_head(node, guard);

        // Both the old and the new head are checked since a release may have marked either.
        // This may cause unnecessary wakeups, but only when there is contention anyway.
        let may_propagate = propagate > 0
            || old_head.is_none_or(|head| head.status().raw() < 0)
            || self
                .head
                .load(guard)
                .is_none_or(|head| head.status().raw() < 0);

        if may_propagate && node.next.load(guard).is_none_or(|next| next.is_shared()) {
            self.release_shared(guard);
        }
    }

    /// Returns `true` if a thread that failed to acquire may park.
    ///
    /// That is only the case once the predecessor promised to signal us. Otherwise this skips
    /// cancelled predecessors or sets up the promise, and the caller must retry acquiring once
    /// more before parking.
    pub(crate) fn should_park_after_failed_acquire<'g>(
        pred: NodeRef<'g>,
        node: NodeRef<'g>,
        guard: &'g Guard,
    ) -> bool {
        match pred.status() {
            Status::Signal => true,
            Status::Cancelled => {
                let mut pred = pred;
                loop {
                    pred = pred
                        .prev
                        .load(guard)
                        .expect("cancelled node has no predecessor");
                    node.prev.store(Some(pred), guard);
                    if !pred.status().is_cancelled() {
                        break;
                    }
                }
                pred.next.store(Some(node), guard);
                false
            }
            status => {
                pred.compare_and_set_status(status, Status::Signal);
                false
            }
        }
    }

    /// Abandons a queued node after a timeout, an interrupt or a panic.
    pub(crate) fn cancel_acquire<'g>(&self, node: NodeRef<'g>, guard: &'g Guard) {
        node.clear_thread();

        let mut pred = node.prev.load(guard).expect("queued node has no predecessor");
        while pred.status().is_cancelled() {
            pred = pred
                .prev
                .load(guard)
                .expect("cancelled node has no predecessor");
            node.prev.store(Some(pred), guard);
        }

        // the CASes below fail if pred.next changed, in which case some other cancellation or
        // signal already took care of it
        let pred_next = pred.next.load(guard);

        // from here on other nodes can skip past us
        node.set_status(Status::Cancelled);
        tracing::trace!(?node, "cancelled queued node");

        if self.tail.compare_and_set(Some(node), Some(pred), guard) {
            pred.next.compare_and_set(pred_next, None, guard);
            return;
        }

        // If the predecessor will signal, splice ourselves out so it signals our successor.
        // Otherwise wake the successor so it can fix up its own links.
        let status = pred.status();
        let pred_signals = !self.is_head(pred, guard)
            && (status == Status::Signal
                || (status.raw() <= 0 && pred.compare_and_set_status(status, Status::Signal)))
            && pred.thread().is_some();

        if pred_signals {
            if let Some(next) = node.next.load(guard) {
                if !next.status().is_cancelled() {
                    pred.next.compare_and_set(pred_next, Some(next), guard);
                }
            }
        } else {
            self.unpark_successor(node, guard);
        }

        // break the prev/next pair so the node can be reclaimed
        node.next.store(None, guard);
    }

    /// Returns `true` if a node that started out in a condition list made it into this queue.
    pub(crate) fn is_on_sync_queue(&self, node: NodeRef<'_>, guard: &Guard) -> bool {
        if node.status() == Status::Condition || !node.prev.is_linked() {
            return false;
        }
        // a successor is only ever linked after a node is in the queue
        if node.next.is_linked() {
            return true;
        }
        // prev is set before the tail CAS, which may still fail, so look for the node
        self.find_from_tail(node, guard)
    }

    fn find_from_tail(&self, node: NodeRef<'_>, guard: &Guard) -> bool {
        let mut cursor = self.tail.load(guard);
        while let Some(candidate) = cursor {
            if candidate == node {
                return true;
            }
            cursor = candidate.prev.load(guard);
        }
        false
    }

    /// Moves a condition node into this queue. Returns `false` if the node was cancelled.
    pub(crate) fn transfer_for_signal<'g>(&self, node: NodeRef<'g>, guard: &'g Guard) -> bool {
        if !node.compare_and_set_status(Status::Condition, Status::Initial) {
            return false;
        }

        // Splice onto the queue and ask the predecessor to signal us. If that is impossible,
        // wake the thread so it resynchronizes by itself.
        let pred = self.enq(node, guard);
        let status = pred.status();
        if status.is_cancelled() || !pred.compare_and_set_status(status, Status::Signal) {
            if let Some(thread) = node.thread() {
                thread.unpark();
            }
        }

        tracing::trace!(?node, "transferred condition node");
        true
    }

    /// Moves a condition node into this queue after its wait timed out or was interrupted.
    ///
    /// Returns `true` if the node got there before a signal did.
    pub(crate) fn transfer_after_cancelled_wait(&self, node: &OwnedNode) -> bool {
        {
            let guard = reclaim::pin();
            let node = node.get(&guard);
            if node.compare_and_set_status(Status::Condition, Status::Initial) {
                self.enq(node, &guard);
                return true;
            }
        }

        // A signal won the race. We can't proceed until it finished the transfer, which is
        // short and rare, so just spin.
        loop {
            {
                let guard = reclaim::pin();
                if self.is_on_sync_queue(node.get(&guard), &guard) {
                    return false;
                }
            }
            thread::yield_now();
        }
    }

    pub(crate) fn has_queued_threads(&self) -> bool {
        let guard = reclaim::pin();
        self.head.load(&guard) != self.tail.load(&guard)
    }

    pub(crate) fn has_contended(&self) -> bool {
        self.head.is_linked()
    }

    /// Returns `true` if some other thread has been waiting longer than the calling thread.
    ///
    /// The tail must be read before the head: that way a head read after the tail can only be
    /// newer, never initialized later than the tail we saw.
    pub(crate) fn has_queued_predecessors(&self) -> bool {
        let guard = reclaim::pin();
        let tail = self.tail.load(&guard);
        let Some(head) = self.head.load(&guard) else {
            return false;
        };
        if Some(head) == tail {
            return false;
        }

        match head.next.load(&guard) {
            // someone is halfway through enqueueing
            None => true,
            Some(first) => first
                .thread()
                .is_none_or(|thread| thread.id() != ThreadId::current()),
        }
    }

    /// Returns `true` if the first queued thread, if one exists, is waiting in exclusive mode.
    pub(crate) fn apparently_first_queued_is_exclusive(&self) -> bool {
        let guard = reclaim::pin();
        self.head
            .load(&guard)
            .and_then(|head| head.next.load(&guard))
            .is_some_and(|first| !first.is_shared() && first.thread().is_some())
    }

    /// Returns the longest-waiting thread.
    pub(crate) fn first_queued_thread(&self) -> Option<ThreadId> {
        let guard = reclaim::pin();
        let head = self.head.load(&guard)?;

        // usually the head's successor, unless it is mid-update
        if let Some(first) = head.next.load(&guard) {
            if first.prev.load(&guard) == Some(head) {
                if let Some(thread) = first.thread() {
                    return Some(thread.id());
                }
            }
        }

        let mut first = None;
        let mut cursor = self.tail.load(&guard);
        while let Some(node) = cursor {
            if node == head {
                break;
            }
            if let Some(thread) = node.thread() {
                first = Some(thread.id());
            }
            cursor = node.prev.load(&guard);
        }
        first
    }

    /// Visits every queued thread from the most recently queued to the longest waiting.
    pub(crate) fn for_each_queued(&self, mut f: impl FnMut(&Node, ThreadId)) {
        let guard = reclaim::pin();
        let mut cursor = self.tail.load(&guard);
        while let Some(node) = cursor {
            if let Some(thread) = node.thread() {
                f(node.get(), thread.id());
            }
            cursor = node.prev.load(&guard);
        }
    }

    pub(crate) fn queue_length(&self) -> usize {
        let mut len = 0;
        self.for_each_queued(|_, _| len += 1);
        len
    }

    pub(crate) fn is_queued(&self, thread: ThreadId) -> bool {
        let mut found = false;
        self.for_each_queued(|_, id| found |= id == thread);
        found
    }

    pub(crate) fn queued_threads(&self, mode: Option<Mode>) -> Vec<ThreadId> {
        let mut threads = Vec::new();
        self.for_each_queued(|node, id| {
            if mode.is_none_or(|mode| node.mode() == mode) {
                threads.push(id);
            }
        });
        threads
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        // Adjacent nodes hold counts on each other through prev and next. With no thread left
        // inside the synchronizer, walk the chain and break every pair so all nodes are freed.
        let guard = reclaim::pin();
        let mut cursor = self.tail.load(&guard);
        while let Some(node) = cursor {
            cursor = node.prev.load(&guard);
            node.prev.store(None, &guard);
            node.next.store(None, &guard);
        }
        self.head.store(None, &guard);
        self.tail.store(None, &guard);
    }
}
