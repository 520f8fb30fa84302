// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread handles, parking and cooperative interrupts.
//!
//! This is the thread abstraction the blocking synchronizers in `qsync` are written against.
//! It wraps the platform's `park`/`unpark` primitive and adds a per-thread interrupt flag that
//! blocking operations check at their suspension points.

mod loom;
mod thread;

pub use thread::{Thread, ThreadId, current, interrupted, park, park_timeout, park_until};
