// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::time::Duration;
use queued_sync::{Interrupted, QueuedSync, SharedProtocol, SyncAccess};

/// Shared-mode policy: the state word is the remaining count; waiting
/// succeeds once it reaches zero.
struct CountProtocol;

impl SharedProtocol for CountProtocol {
    fn try_acquire_shared(&self, sync: &SyncAccess<'_>, _arg: u32) -> i32 {
        // Positive on success so the open gate propagates through every
        // queued waiter.
        if sync.state().get() == 0 { 1 } else { -1 }
    }

    fn try_release_shared(&self, sync: &SyncAccess<'_>, _arg: u32) -> bool {
        loop {
            let count = sync.state().get();
            if count == 0 {
                // Already open; counting down further is a no-op.
                return false;
            }
            if sync.state().compare_exchange(count, count - 1).is_ok() {
                return count == 1;
            }
        }
    }
}

/// A one-shot countdown latch.
///
/// Threads calling [`wait`](Latch::wait) block until the count reaches
/// zero; once open, the latch stays open and every current and future
/// waiter passes. A single final [`count_down`](Latch::count_down) releases
/// all queued waiters in one wave.
pub struct Latch {
    sync: QueuedSync<CountProtocol>,
}

// === impl Latch ===

impl Latch {
    /// Creates a latch that opens after `count` calls to
    /// [`count_down`](Latch::count_down).
    #[must_use]
    pub fn new(count: u32) -> Self {
        Self {
            sync: QueuedSync::with_state(CountProtocol, count),
        }
    }

    /// The remaining count.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.sync.state().get()
    }

    /// Decrements the count, opening the latch (and waking every waiter)
    /// when it reaches zero. Has no effect once open.
    pub fn count_down(&self) {
        self.sync.release_shared(1);
    }

    /// Blocks until the latch opens. Interrupts are swallowed and
    /// re-asserted.
    pub fn wait(&self) {
        self.sync.acquire_shared(1);
    }

    /// Blocks until the latch opens or the thread is interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`], consuming the flag.
    pub fn wait_interruptibly(&self) -> Result<(), Interrupted> {
        self.sync.acquire_shared_interruptibly(1)
    }

    /// Blocks until the latch opens or `timeout` elapses. Returns whether
    /// the latch is open.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread is interrupted while waiting.
    pub fn wait_for(&self, timeout: Duration) -> Result<bool, Interrupted> {
        self.sync.try_acquire_shared_nanos(1, timeout)
    }
}

impl fmt::Debug for Latch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Latch").field("count", &self.count()).finish()
    }
}
