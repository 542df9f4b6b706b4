// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Blocking synchronization primitives built on the [`queued_sync`] kernel.
//!
//! Each type here is a thin policy over the kernel's state word plus a data
//! or threading facade:
//!
//! - [`RwLock`] — a reader–writer lock packing reader and writer-recursion
//!   counts into the two halves of the state word, in barging and fair
//!   flavors.
//! - [`ReentrantMutex`] + [`Condvar`] — a recursively lockable mutex
//!   (state = hold count) with condition-variable waiting.
//! - [`Latch`] — a one-shot countdown gate in shared mode; the final count
//!   releases every waiter in one wave.
//! - [`WorkerPool`] — a bounded job queue drained by a fixed set of worker
//!   threads, put together from the mutex, two conditions, and a latch.

mod latch;
pub(crate) mod loom;
mod mutex;
mod pool;
mod rwlock;

pub use latch::Latch;
pub use mutex::{Condvar, ReentrantMutex, ReentrantMutexGuard};
pub use pool::{PoolClosed, WorkerPool};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
