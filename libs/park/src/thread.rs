// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::loom::thread;
use core::fmt;
use core::num::NonZeroUsize;
use core::sync::atomic::AtomicUsize;
use core::time::Duration;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::time::Instant;

/// A handle to a thread that can be parked, unparked and interrupted.
///
/// Handles are cheap to clone and do not keep the thread alive. Unparking or interrupting a
/// thread that has already exited is a no-op.
#[derive(Clone)]
pub struct Thread {
    inner: Arc<Inner>,
}
assert_impl_all!(Thread: Send, Sync);

struct Inner {
    id: ThreadId,
    native: thread::Thread,
    interrupted: AtomicBool,
}

/// A process-unique identifier for a thread.
///
/// Ids are never reused and never zero, which lets callers store an `Option<ThreadId>` in a
/// single atomic word (see [`ThreadId::into_usize`] and [`ThreadId::from_usize`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroUsize);

crate::loom::thread_local! {
    static CURRENT: Thread = Thread::new_current();
}

/// Returns a handle to the calling thread.
pub fn current() -> Thread {
    CURRENT.with(Thread::clone)
}

/// Blocks the calling thread until it is unparked or interrupted.
///
/// Like [`std::thread::park`] this may return spuriously, callers must re-check their wakeup
/// condition in a loop. Returns immediately if the calling thread's interrupt flag is set.
pub fn park() {
    CURRENT.with(|current| {
        if current.is_interrupted() {
            return;
        }

        tracing::trace!(thread = ?current.id(), "parking");
        thread::park();
        tracing::trace!(thread = ?current.id(), "woke up");
    });
}

/// Blocks the calling thread for at most `timeout`.
///
/// See [`park`] for the wakeup rules.
pub fn park_timeout(timeout: Duration) {
    CURRENT.with(|current| {
        if current.is_interrupted() {
            return;
        }

        tracing::trace!(thread = ?current.id(), ?timeout, "parking with timeout");
        park_timeout_native(timeout);
    });
}

/// Blocks the calling thread until `deadline` has passed.
///
/// See [`park`] for the wakeup rules.
pub fn park_until(deadline: Instant) {
    let now = Instant::now();
    if let Some(timeout) = deadline.checked_duration_since(now) {
        park_timeout(timeout);
    }
}

/// Tests whether the calling thread has been interrupted, clearing the interrupt flag.
///
/// This is the only way an interrupt is consumed. A blocking operation that observes an
/// interrupt through this function and does not report it must redeliver it with
/// [`Thread::interrupt`] before returning.
pub fn interrupted() -> bool {
    CURRENT.with(|current| current.inner.interrupted.swap(false, Ordering::SeqCst))
}

#[cfg(not(loom))]
fn park_timeout_native(timeout: Duration) {
    thread::park_timeout(timeout);
}

#[cfg(loom)]
fn park_timeout_native(_timeout: Duration) {
    // loom has no notion of time, a spurious return is always a valid outcome.
    thread::yield_now();
}

// === impl Thread ===

impl Thread {
    fn new_current() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: ThreadId::next(),
                native: thread::current(),
                interrupted: AtomicBool::new(false),
            }),
        }
    }

    /// Returns this thread's unique id.
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.inner.id
    }

    /// Wakes the thread if it is parked, or makes its next park return immediately.
    pub fn unpark(&self) {
        tracing::trace!(thread = ?self.inner.id, "unparking");
        self.inner.native.unpark();
    }

    /// Sets the thread's interrupt flag and unparks it.
    ///
    /// Interrupts are cooperative: they abort interruptible waits and cause every [`park`]
    /// variant to return immediately until the flag is cleared through [`interrupted`].
    pub fn interrupt(&self) {
        tracing::trace!(thread = ?self.inner.id, "interrupting");
        self.inner.interrupted.store(true, Ordering::SeqCst);
        self.inner.native.unpark();
    }

    /// Returns `true` if the thread's interrupt flag is set. Does not clear the flag.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Returns `true` if both handles refer to the same thread.
    #[must_use]
    pub fn ptr_eq(&self, other: &Thread) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.inner.id)
            .field("native", &self.inner.native)
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

// === impl ThreadId ===

impl ThreadId {
    fn next() -> Self {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

        let id = NEXT_ID.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        Self(NonZeroUsize::new(id).expect("thread id counter overflowed"))
    }

    /// Returns the id of the calling thread.
    #[must_use]
    pub fn current() -> Self {
        CURRENT.with(Thread::id)
    }

    /// Returns the raw, non-zero value of this id.
    #[must_use]
    pub const fn into_usize(self) -> usize {
        self.0.get()
    }

    /// Reconstructs an id from [`ThreadId::into_usize`], mapping zero to `None`.
    #[must_use]
    pub const fn from_usize(raw: usize) -> Option<Self> {
        match NonZeroUsize::new(raw) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    /// Returns this id as a [`NonZeroUsize`].
    #[must_use]
    pub const fn as_non_zero(self) -> NonZeroUsize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::mpsc;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn parking_basically_works() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        crate::loom::model(|| {
            crate::loom::lazy_static! {
                static ref A_UNPARKED: AtomicBool = AtomicBool::new(false);
            }
            let (tx, rx) = mpsc::channel();

            // Thread A will suspend itself
            let a = thread::spawn(move || {
                tx.send(current()).unwrap();

                while !A_UNPARKED.load(Ordering::Acquire) {
                    park();
                }
            });

            // Thread B will just wake up thread A
            let b = thread::spawn(move || {
                let a = rx.recv().unwrap();
                A_UNPARKED.store(true, Ordering::Release);
                a.unpark();
            });

            a.join().unwrap();
            b.join().unwrap();
        });
    }

    #[test]
    fn interrupt_wakes_parked_thread() {
        crate::loom::model(|| {
            let (tx, rx) = mpsc::channel();

            let a = thread::spawn(move || {
                tx.send(current()).unwrap();

                // an interrupt makes every park return immediately, so this terminates
                // even if the interrupt lands before we start parking
                while !current().is_interrupted() {
                    park();
                }
                interrupted()
            });

            let handle = rx.recv().unwrap();
            handle.interrupt();

            assert!(a.join().unwrap());
        });
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn interrupted_clears_flag() {
        current().interrupt();
        assert!(current().is_interrupted());
        assert!(interrupted());
        assert!(!interrupted());
        assert!(!current().is_interrupted());
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn ids_are_unique_and_stable() {
        let here = ThreadId::current();
        assert_eq!(here, current().id());
        assert_eq!(ThreadId::from_usize(here.into_usize()), Some(here));
        assert_eq!(ThreadId::from_usize(0), None);

        let there = std::thread::spawn(ThreadId::current).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    #[cfg(not(loom))]
    fn park_timeout_elapses() {
        let start = Instant::now();
        park_timeout(Duration::from_millis(20));
        // spurious wakeups are allowed, so only check we did not hang
        assert!(start.elapsed() < Duration::from_secs(5));

        let past = Instant::now().checked_sub(Duration::from_millis(1)).unwrap();
        park_until(past);
    }

    #[test]
    #[cfg(not(loom))]
    fn park_returns_when_interrupted() {
        current().interrupt();
        // would block forever if the pending interrupt was ignored
        park();
        park_timeout(Duration::from_secs(60));
        assert!(interrupted());
    }
}
