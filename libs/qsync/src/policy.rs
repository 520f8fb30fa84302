// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::Synchronizer;

/// The exclusive-mode acquire and release rules of a synchronizer.
///
/// The hooks are called with the owning [`Synchronizer`] so they can inspect and update its
/// state word and exclusive owner. They must never block, and they are free to panic on misuse
/// such as releasing a lock the calling thread doesn't hold.
///
/// A synchronizer only offers exclusive operations when its policy implements this trait.
///
/// # Example
///
/// A non-reentrant mutex keeping `1` in the state word while locked:
///
/// ```
/// use qsync::park::ThreadId;
/// use qsync::{Exclusive, Synchronizer};
///
/// struct Mutex;
///
/// impl Exclusive for Mutex {
///     fn try_acquire(&self, sync: &Synchronizer<Self>, _arg: i32) -> bool {
///         if sync.compare_and_set_state(0, 1) {
///             sync.set_exclusive_owner(Some(ThreadId::current()));
///             true
///         } else {
///             false
///         }
///     }
///
///     fn try_release(&self, sync: &Synchronizer<Self>, _arg: i32) -> bool {
///         assert!(self.is_held_exclusively(sync), "unlocked by a thread that doesn't own it");
///         sync.set_exclusive_owner(None);
///         sync.set_state(0);
///         true
///     }
///
///     fn is_held_exclusively(&self, sync: &Synchronizer<Self>) -> bool {
///         sync.exclusive_owner() == Some(ThreadId::current())
///     }
/// }
///
/// let mutex = Synchronizer::new(Mutex);
/// mutex.acquire(1);
/// assert!(!mutex.try_acquire(1));
/// assert!(mutex.release(1));
/// ```
pub trait Exclusive: Sized {
    /// Attempts to acquire in exclusive mode. Returns `true` on success.
    fn try_acquire(&self, sync: &Synchronizer<Self>, arg: i32) -> bool;

    /// Attempts to release in exclusive mode. Returns `true` if the synchronizer is now fully
    /// released and a waiting thread may be able to acquire.
    fn try_release(&self, sync: &Synchronizer<Self>, arg: i32) -> bool;

    /// Returns `true` if the calling thread holds the synchronizer exclusively.
    ///
    /// Only called by [`Condition`](crate::Condition) methods.
    fn is_held_exclusively(&self, sync: &Synchronizer<Self>) -> bool;
}

/// The shared-mode acquire and release rules of a synchronizer.
///
/// See [`Exclusive`] for the general contract.
pub trait Shared: Sized {
    /// Attempts to acquire in shared mode.
    ///
    /// A negative result means failure. Zero means success, but no other shared acquire can
    /// succeed after this one. A positive value means success, and later shared acquires might
    /// succeed too, so the wakeup must propagate to the next waiter.
    fn try_acquire_shared(&self, sync: &Synchronizer<Self>, arg: i32) -> i32;

    /// Attempts to release in shared mode. Returns `true` if a waiting acquire, shared or
    /// exclusive, may now succeed.
    fn try_release_shared(&self, sync: &Synchronizer<Self>, arg: i32) -> bool;
}
