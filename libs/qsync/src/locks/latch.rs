// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{Interrupted, Shared, Synchronizer};
use core::fmt;
use core::time::Duration;

/// A one-shot gate that opens once [`count_down`](CountDownLatch::count_down) has been called
/// a given number of times.
///
/// Waiting threads block until the count reaches zero, then all of them are released at once.
/// Once open the latch stays open, later waits return immediately and further count downs have
/// no effect. Use a [`CyclicBarrier`](super::CyclicBarrier) if the count needs to reset.
pub struct CountDownLatch {
    sync: Synchronizer<LatchPolicy>,
}

/// State is the remaining count.
#[derive(Debug)]
struct LatchPolicy;

impl CountDownLatch {
    /// Returns a latch that opens after `count` count downs.
    ///
    /// # Panics
    ///
    /// Panics if `count` is negative.
    #[must_use]
    pub fn new(count: i32) -> Self {
        assert!(count >= 0, "negative latch count");
        Self {
            sync: Synchronizer::with_state(LatchPolicy, count),
        }
    }

    /// Blocks until the count reaches zero.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    pub fn wait(&self) -> Result<(), Interrupted> {
        self.sync.acquire_shared_interruptibly(1)
    }

    /// Blocks until the count reaches zero. Interrupts are only redelivered.
    pub fn wait_uninterruptibly(&self) {
        self.sync.acquire_shared(1);
    }

    /// Blocks until the count reaches zero or `timeout` elapsed. Returns `false` in the latter
    /// case.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was interrupted before or while waiting.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, Interrupted> {
        self.sync.try_acquire_shared_for(1, timeout)
    }

    /// Decrements the count, releasing all waiting threads when it reaches zero.
    pub fn count_down(&self) {
        self.sync.release_shared(1);
    }

    /// Returns the current count.
    pub fn count(&self) -> i32 {
        self.sync.state()
    }
}

impl fmt::Debug for CountDownLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountDownLatch")
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

impl Shared for LatchPolicy {
    fn try_acquire_shared(&self, sync: &Synchronizer<Self>, _arg: i32) -> i32 {
        if sync.state() == 0 { 1 } else { -1 }
    }

    fn try_release_shared(&self, sync: &Synchronizer<Self>, _arg: i32) -> bool {
        loop {
            let count = sync.state();
            if count == 0 {
                return false;
            }
            let next = count - 1;
            if sync.compare_and_set_state(count, next) {
                return next == 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::sync::atomic::{AtomicBool, Ordering};
    use crate::loom::thread;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn opens_after_all_count_downs() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        crate::loom::model(|| {
            let latch = Arc::new(CountDownLatch::new(2));
            let done = Arc::new(AtomicBool::new(false));

            let worker = {
                let latch = latch.clone();
                thread::spawn(move || latch.count_down())
            };

            let waiter = {
                let latch = latch.clone();
                let done = done.clone();
                thread::spawn(move || {
                    latch.wait_uninterruptibly();
                    done.store(true, Ordering::SeqCst);
                })
            };

            latch.count_down();
            worker.join().unwrap();
            waiter.join().unwrap();
            assert!(done.load(Ordering::SeqCst));
            assert_eq!(latch.count(), 0);
        });
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn stays_open() {
        let latch = CountDownLatch::new(1);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.count(), 0);
        assert_eq!(latch.wait(), Ok(()));

        let zero = CountDownLatch::new(0);
        zero.wait_uninterruptibly();
    }

    #[test]
    #[cfg(not(loom))]
    fn wait_timeout_expires() {
        let latch = CountDownLatch::new(1);
        assert_eq!(latch.wait_timeout(Duration::from_millis(5)), Ok(false));
        latch.count_down();
        assert_eq!(latch.wait_timeout(Duration::from_millis(5)), Ok(true));
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    #[should_panic = "negative latch count"]
    fn negative_count_panics() {
        let _ = CountDownLatch::new(-1);
    }
}
