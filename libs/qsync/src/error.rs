// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// An interruptible wait was aborted because the waiting thread was interrupted.
///
/// The thread's interrupt flag is cleared when this is returned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Interrupted(pub(crate) ());

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("interrupted")
    }
}

impl core::error::Error for Interrupted {}

/// Errors returned by [`CyclicBarrier`](crate::locks::CyclicBarrier) waits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BarrierError {
    /// The barrier was broken by another party, or was already broken when waiting.
    Broken,
    /// The calling thread was interrupted while waiting. The barrier is now broken.
    Interrupted,
    /// The wait timed out. The barrier is now broken.
    TimedOut,
}

impl From<Interrupted> for BarrierError {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}

impl fmt::Display for BarrierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BarrierError::Broken => f.write_str("barrier is broken"),
            BarrierError::Interrupted => f.write_str("interrupted while waiting at barrier"),
            BarrierError::TimedOut => f.write_str("timed out while waiting at barrier"),
        }
    }
}

impl core::error::Error for BarrierError {}
