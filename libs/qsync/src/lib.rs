// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A framework for blocking synchronizers built around a single atomic state word and a FIFO
//! queue of parked threads.
//!
//! [`Synchronizer`] does the hard part: queueing threads that fail to acquire, parking them,
//! waking them up in order, and backing out cleanly on timeouts, interrupts and panics. What it
//! means to acquire is up to a small policy type implementing [`Exclusive`] and/or [`Shared`].
//! [`Condition`]s add wait/signal queues on top of exclusively held synchronizers.
//!
//! The [`locks`] module builds the usual primitives on top of it: mutexes, reentrant locks,
//! readers-writer locks, semaphores, latches, barriers and condition variables.
//!
//! Threads are parked and interrupted through the [`park`] crate, which is re-exported.

mod condition;
mod error;
pub mod locks;
mod loom;
mod node;
mod policy;
mod queue;
mod reclaim;
mod synchronizer;

pub use condition::Condition;
pub use error::{BarrierError, Interrupted};
pub use park;
pub use policy::{Exclusive, Shared};
pub use synchronizer::Synchronizer;

static_assertions::assert_impl_all!(Condition: Send, Sync);
static_assertions::assert_impl_all!(Interrupted: Send, Sync, core::error::Error);
