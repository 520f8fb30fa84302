// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Blocking synchronization primitives built on [`Synchronizer`](crate::Synchronizer).
//!
//! The data-carrying locks are [`lock_api`] types over raw locks defined here.

mod latch;
mod reentrant_lock;
mod semaphore;

pub use latch::CountDownLatch;
pub use reentrant_lock::ReentrantLock;
pub use semaphore::Semaphore;

static_assertions::assert_impl_all!(CountDownLatch: Send, Sync);
static_assertions::assert_impl_all!(ReentrantLock: Send, Sync);
static_assertions::assert_impl_all!(Semaphore: Send, Sync);

// lock_api needs const constructors, which loom's atomics don't have
cfg_if::cfg_if! {
    if #[cfg(not(loom))] {
        mod barrier;
        mod condvar;
        mod mutex;
        mod reentrant_mutex;
        mod rw_lock;

        pub use barrier::{BarrierWaitResult, CyclicBarrier};
        pub use condvar::{Condvar, WaitTimeoutResult};
        pub use mutex::{
            FairMutex, FairMutexGuard, MappedMutexGuard, Mutex, MutexGuard, RawMutex,
        };
        pub use reentrant_mutex::{CurrentThreadId, ReentrantMutex, ReentrantMutexGuard};
        pub use rw_lock::{
            FairRwLock, FairRwLockReadGuard, FairRwLockWriteGuard, MappedRwLockReadGuard,
            MappedRwLockWriteGuard, RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard,
        };

        static_assertions::assert_impl_all!(CyclicBarrier: Send, Sync);
        static_assertions::assert_impl_all!(Condvar: Send, Sync);
        static_assertions::assert_impl_all!(Mutex<()>: Send, Sync);
        static_assertions::assert_impl_all!(RwLock<()>: Send, Sync);
        static_assertions::assert_impl_all!(ReentrantMutex<()>: Send, Sync);
        static_assertions::assert_not_impl_any!(MutexGuard<'static, ()>: Send);
        static_assertions::assert_not_impl_any!(RwLockWriteGuard<'static, ()>: Send);
    }
}
