// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Wait queue nodes and the counted links between them.

use crate::loom::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicUsize, Ordering};
use crate::reclaim::{self, Guard};
use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use park::Thread;

/// A record for one thread that is blocked (or about to block) in a synchronizer.
///
/// A node lives in the main wait queue (linked through `prev` and `next`), in a condition's
/// wait list (linked through `next_waiter`), or in neither. Its `status` tells which, together
/// with the signalling obligations of the thread behind it.
pub(crate) struct Node {
    status: AtomicI32,
    pub(crate) prev: Link,
    pub(crate) next: Link,
    pub(crate) next_waiter: Link,
    mode: Mode,
    thread: Option<Thread>,
    /// Cleared once the node no longer represents a blocked thread.
    waiting: AtomicBool,
    /// Number of links pointing at this node, plus one while its owner holds an [`OwnedNode`].
    refs: AtomicUsize,
    /// Intrusive link for the collector's retired list, not counted.
    pub(crate) retired_next: AtomicPtr<Node>,
}

/// Whether a queued thread wants exclusive or shared ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Exclusive,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub(crate) enum Status {
    /// Freshly queued, no obligations.
    Initial = 0,
    /// The thread gave up waiting (timeout or interrupt). Terminal.
    Cancelled = 1,
    /// The successor is (or will soon be) parked and must be unparked when this node releases
    /// or cancels.
    Signal = -1,
    /// The node sits in a condition's wait list.
    Condition = -2,
    /// A shared release happened while this node was head and must propagate further.
    Propagate = -3,
}

/// An atomic, reference counted pointer to a [`Node`].
///
/// Storing a node into a link increments its count, overwriting or clearing the link
/// decrements the count of the previous target.
pub(crate) struct Link(AtomicPtr<Node>);

/// A node loaded through a [`Link`] while the current thread is pinned.
#[derive(Clone, Copy)]
pub(crate) struct NodeRef<'g> {
    ptr: NonNull<Node>,
    _guard: PhantomData<&'g Node>,
}

/// The blocked thread's own reference to its node.
///
/// Keeps the node alive for as long as the thread is inside an acquire or condition wait, no
/// matter how often it is linked and unlinked meanwhile.
pub(crate) struct OwnedNode {
    ptr: NonNull<Node>,
}

// === impl Node ===

impl Node {
    pub(crate) fn status(&self) -> Status {
        Status::from_raw(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.status.store(status.raw(), Ordering::SeqCst);
    }

    pub(crate) fn compare_and_set_status(&self, expected: Status, new: Status) -> bool {
        self.status
            .compare_exchange(
                expected.raw(),
                new.raw(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn is_shared(&self) -> bool {
        self.mode == Mode::Shared
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    /// Returns the thread blocked on this node, or `None` once the node has been handled.
    pub(crate) fn thread(&self) -> Option<&Thread> {
        if self.waiting.load(Ordering::SeqCst) {
            self.thread.as_ref()
        } else {
            None
        }
    }

    pub(crate) fn clear_thread(&self) {
        self.waiting.store(false, Ordering::SeqCst);
    }

    /// Increments the reference count unless it already dropped to zero.
    fn try_retain(&self) -> bool {
        let mut refs = self.refs.load(Ordering::Relaxed);
        loop {
            if refs == 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                refs,
                refs + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => refs = actual,
            }
        }
    }

    /// Drops all outgoing links. Called by the collector right before the node is freed.
    pub(crate) fn release_links(&self) {
        // Safety: each link owns the count it releases
        unsafe {
            self.prev.release_target();
            self.next.release_target();
            self.next_waiter.release_target();
        }
    }
}

/// Decrements the node's reference count, retiring it once the count reaches zero.
///
/// # Safety
///
/// The caller must own one count on `node`.
unsafe fn release(node: NonNull<Node>) {
    // Safety: the caller's count keeps the node alive
    let refs = unsafe { node.as_ref() }.refs.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(refs > 0, "node reference count underflow");
    if refs == 1 {
        // Safety: no link points at the node any more and this was the last count
        unsafe { reclaim::retire(node) };
    }
}

// === impl Status ===

impl Status {
    fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Initial,
            1 => Self::Cancelled,
            -1 => Self::Signal,
            -2 => Self::Condition,
            -3 => Self::Propagate,
            _ => unreachable!("invalid node status {raw}"),
        }
    }

    pub(crate) const fn raw(self) -> i32 {
        self as i32
    }

    pub(crate) const fn is_cancelled(self) -> bool {
        self.raw() > 0
    }
}

// === impl Link ===

impl Link {
    crate::loom::loom_const_fn! {
        pub(crate) fn empty() -> Link {
            Self(AtomicPtr::new(ptr::null_mut()))
        }
    }

    pub(crate) fn load<'g>(&self, _guard: &'g Guard) -> Option<NodeRef<'g>> {
        NonNull::new(self.0.load(Ordering::SeqCst)).map(|ptr| NodeRef {
            ptr,
            _guard: PhantomData,
        })
    }

    /// Returns `true` if the link points at a node. Does not dereference it.
    pub(crate) fn is_linked(&self) -> bool {
        !self.0.load(Ordering::SeqCst).is_null()
    }

    /// Points the link at `new`.
    ///
    /// Returns `false` without touching the link if `new` was already retired. That only
    /// happens for nodes read from a link that other threads overwrite concurrently.
    pub(crate) fn store(&self, new: Option<NodeRef<'_>>, _guard: &Guard) -> bool {
        if new.is_some_and(|node| !node.try_retain()) {
            return false;
        }

        let old = self.0.swap(NodeRef::into_raw(new), Ordering::SeqCst);
        if let Some(old) = NonNull::new(old) {
            // Safety: the link owned a count on its old target
            unsafe { release(old) };
        }
        true
    }

    /// Points the link at `new` if it currently points at `current`.
    ///
    /// Fails if the link changed or if `new` was already retired.
    pub(crate) fn compare_and_set(
        &self,
        current: Option<NodeRef<'_>>,
        new: Option<NodeRef<'_>>,
        _guard: &Guard,
    ) -> bool {
        if new.is_some_and(|node| !node.try_retain()) {
            return false;
        }

        match self.0.compare_exchange(
            NodeRef::into_raw(current),
            NodeRef::into_raw(new),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(old) => {
                if let Some(old) = NonNull::new(old) {
                    // Safety: the link owned a count on its old target
                    unsafe { release(old) };
                }
                true
            }
            Err(_) => {
                if let Some(new) = new {
                    // Safety: undo the retain above
                    unsafe { release(new.ptr) };
                }
                false
            }
        }
    }

    /// Clears the link without a guard.
    ///
    /// # Safety
    ///
    /// Only valid while nobody else can access the link, i.e. while freeing its node.
    unsafe fn release_target(&self) {
        let old = self.0.swap(ptr::null_mut(), Ordering::Relaxed);
        if let Some(old) = NonNull::new(old) {
            // Safety: the link owned a count on its old target
            unsafe { release(old) };
        }
    }
}

// === impl NodeRef ===

impl<'g> NodeRef<'g> {
    fn into_raw(node: Option<Self>) -> *mut Node {
        node.map_or(ptr::null_mut(), |node| node.ptr.as_ptr())
    }

    /// Returns the node with the full guard lifetime.
    pub(crate) fn get(self) -> &'g Node {
        // Safety: the guard keeps the node allocated for 'g
        unsafe { self.ptr.as_ref() }
    }
}

impl Deref for NodeRef<'_> {
    type Target = Node;

    fn deref(&self) -> &Node {
        self.get()
    }
}

impl PartialEq for NodeRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl Eq for NodeRef<'_> {}

impl fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("addr", &self.ptr)
            .field("status", &self.status())
            .field("mode", &self.mode)
            .field("thread", &self.thread().map(Thread::id))
            .finish_non_exhaustive()
    }
}

// === impl OwnedNode ===

impl OwnedNode {
    fn new(mode: Mode, status: Status, thread: Option<Thread>) -> Self {
        let waiting = thread.is_some();
        let node = Box::new(Node {
            status: AtomicI32::new(status.raw()),
            prev: Link::empty(),
            next: Link::empty(),
            next_waiter: Link::empty(),
            mode,
            thread,
            waiting: AtomicBool::new(waiting),
            refs: AtomicUsize::new(1),
            retired_next: AtomicPtr::new(ptr::null_mut()),
        });

        Self {
            ptr: NonNull::from(Box::leak(node)),
        }
    }

    /// A node for the calling thread, about to join the main queue.
    pub(crate) fn waiter(mode: Mode) -> Self {
        Self::new(mode, Status::Initial, Some(park::current()))
    }

    /// A node for the calling thread, about to join a condition's wait list.
    pub(crate) fn condition_waiter() -> Self {
        Self::new(Mode::Exclusive, Status::Condition, Some(park::current()))
    }

    /// The threadless node installed as the initial head.
    pub(crate) fn sentinel() -> Self {
        Self::new(Mode::Exclusive, Status::Initial, None)
    }

    pub(crate) fn get<'a>(&'a self, _guard: &'a Guard) -> NodeRef<'a> {
        NodeRef {
            ptr: self.ptr,
            _guard: PhantomData,
        }
    }
}

impl Drop for OwnedNode {
    fn drop(&mut self) {
        let _guard = reclaim::pin();
        // Safety: we own one count
        unsafe { release(self.ptr) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn links_count_their_targets() {
        let a = OwnedNode::waiter(Mode::Exclusive);
        let b = OwnedNode::sentinel();
        let guard = reclaim::pin();
        let (a_ref, b_ref) = (a.get(&guard), b.get(&guard));

        assert!(a_ref.next.store(Some(b_ref), &guard));
        assert!(b_ref.prev.store(Some(a_ref), &guard));
        assert_eq!(b_ref.refs.load(Ordering::Relaxed), 2);

        assert!(!a_ref.next.compare_and_set(None, Some(a_ref), &guard));
        assert_eq!(a_ref.refs.load(Ordering::Relaxed), 2);

        assert!(a_ref.next.compare_and_set(Some(b_ref), None, &guard));
        assert_eq!(b_ref.refs.load(Ordering::Relaxed), 1);
        assert!(b_ref.prev.store(None, &guard));
        assert_eq!(a_ref.refs.load(Ordering::Relaxed), 1);
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn retired_nodes_cannot_be_relinked() {
        let guard = reclaim::pin();
        let holder = OwnedNode::sentinel();
        let holder = holder.get(&guard);

        let doomed = OwnedNode::waiter(Mode::Shared);
        let doomed_ref = NodeRef {
            ptr: doomed.ptr,
            _guard: PhantomData,
        };
        drop(doomed);

        // the pin keeps the memory valid, but the count is gone for good
        assert!(!holder.next.store(Some(doomed_ref), &guard));
        assert!(!holder.next.is_linked());
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn clearing_the_thread_marks_the_node_handled() {
        let node = OwnedNode::waiter(Mode::Exclusive);
        let guard = reclaim::pin();
        let node = node.get(&guard);

        assert_eq!(node.thread().map(Thread::id), Some(park::current().id()));
        node.clear_thread();
        assert!(node.thread().is_none());

        assert!(node.compare_and_set_status(Status::Initial, Status::Signal));
        assert!(!node.compare_and_set_status(Status::Initial, Status::Cancelled));
        assert_eq!(node.status(), Status::Signal);
        assert!(!node.status().is_cancelled());
    }
}
