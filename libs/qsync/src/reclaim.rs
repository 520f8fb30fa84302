// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deferred reclamation of queue nodes.
//!
//! Nodes are reference counted by the [`Link`](crate::node::Link)s pointing at them. When the
//! count drops to zero the node is *retired*, not freed: another thread may still be reading it
//! through a pointer it loaded before the node was unlinked. Threads announce such reads by
//! [pinning](pin). A retired node is only freed by a collector that, after taking it off the
//! retired list, observes that no thread is pinned. Any thread that could still reach the node
//! must have been pinned since before it was unlinked, so it would have been observed.
//!
//! Pinned sections never block, so the pin count drops to zero frequently even under heavy
//! contention. Threads are never pinned while parked.

use crate::loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use crate::node::Node;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

/// Proof that the current thread is pinned.
///
/// Every node loaded while a guard is alive stays allocated until the guard is dropped.
#[must_use]
pub(crate) struct Guard {
    _not_send: PhantomData<*mut ()>,
}

struct Collector {
    pins: AtomicUsize,
    retired: AtomicPtr<Node>,
}

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        crate::loom::lazy_static! {
            static ref COLLECTOR: Collector = Collector::new();
        }
    } else {
        static COLLECTOR: Collector = Collector::new();
    }
}

/// Pins the current thread until the returned guard is dropped.
pub(crate) fn pin() -> Guard {
    COLLECTOR.pins.fetch_add(1, Ordering::SeqCst);
    Guard {
        _not_send: PhantomData,
    }
}

/// Hands a node whose reference count dropped to zero over to the collector.
///
/// # Safety
///
/// The node must be unreachable through any link and must not be retired twice.
pub(crate) unsafe fn retire(node: NonNull<Node>) {
    // Safety: ensured by caller
    unsafe { COLLECTOR.push(node, node) }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if COLLECTOR.pins.fetch_sub(1, Ordering::SeqCst) == 1 {
            COLLECTOR.collect();
        }
    }
}

// === impl Collector ===

impl Collector {
    crate::loom::loom_const_fn! {
        fn new() -> Self {
            Self {
                pins: AtomicUsize::new(0),
                retired: AtomicPtr::new(ptr::null_mut()),
            }
        }
    }

    /// Pushes the chain `first..=last` (linked through `retired_next`) onto the retired list.
    ///
    /// # Safety
    ///
    /// Every node in the chain must be retired and owned by the caller.
    unsafe fn push(&self, first: NonNull<Node>, last: NonNull<Node>) {
        let mut head = self.retired.load(Ordering::Relaxed);
        loop {
            // Safety: retired nodes are owned by whoever holds them off the list
            unsafe { last.as_ref() }
                .retired_next
                .store(head, Ordering::Relaxed);

            match self.retired.compare_exchange_weak(
                head,
                first.as_ptr(),
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    fn collect(&self) {
        loop {
            let Some(batch) = NonNull::new(self.retired.swap(ptr::null_mut(), Ordering::SeqCst))
            else {
                return;
            };

            if self.pins.load(Ordering::SeqCst) != 0 {
                // somebody may still be looking at this batch, leave it to them
                let mut last = batch;
                // Safety: we took the batch off the list, so we own it
                while let Some(next) =
                    NonNull::new(unsafe { last.as_ref() }.retired_next.load(Ordering::Relaxed))
                {
                    last = next;
                }
                // Safety: we own the whole chain
                unsafe { self.push(batch, last) };
                return;
            }

            let mut cursor = Some(batch);
            while let Some(node) = cursor {
                // Safety: the node was retired before the swap above and no thread was pinned
                // after it, so nobody can still hold a pointer to it.
                let node = unsafe { Box::from_raw(node.as_ptr()) };
                cursor = NonNull::new(node.retired_next.load(Ordering::Relaxed));
                // releasing the outgoing links may retire further nodes, the next loop
                // iteration picks them up
                node.release_links();
            }
        }
    }
}
