// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Minimal protocols used by the kernel's own tests: a reentrant
//! owner-tracking mutex (optionally fair) and a counting semaphore.

use crate::{ExclusiveProtocol, SharedProtocol, SyncAccess};

/// Reentrant mutex policy: state is the hold count, the kernel's owner
/// token the holder.
pub(crate) struct TestMutex {
    fair: bool,
}

impl TestMutex {
    pub(crate) fn new() -> Self {
        Self { fair: false }
    }

    pub(crate) fn new_fair() -> Self {
        Self { fair: true }
    }
}

impl ExclusiveProtocol for TestMutex {
    fn try_acquire(&self, sync: &SyncAccess<'_>, arg: u32) -> bool {
        let me = parking::current().id();
        let holds = sync.state().get();
        if holds == 0 {
            if self.fair && sync.has_queued_predecessors() {
                return false;
            }
            if sync.state().compare_exchange(0, arg).is_ok() {
                sync.set_owner(Some(me));
                return true;
            }
            false
        } else if sync.owner() == Some(me) {
            // Reentrant bump; only the owner writes while held.
            sync.state().set(holds + arg);
            true
        } else {
            false
        }
    }

    fn try_release(&self, sync: &SyncAccess<'_>, arg: u32) -> bool {
        if sync.owner() != Some(parking::current().id()) {
            return false;
        }
        let Some(remaining) = sync.state().get().checked_sub(arg) else {
            return false;
        };
        if remaining == 0 {
            sync.set_owner(None);
        }
        sync.state().set(remaining);
        remaining == 0
    }

    fn is_held_exclusively(&self, sync: &SyncAccess<'_>) -> bool {
        sync.owner() == Some(parking::current().id())
    }
}

/// Counting-semaphore policy: state is the number of available permits.
pub(crate) struct TestSemaphore;

impl SharedProtocol for TestSemaphore {
    fn try_acquire_shared(&self, sync: &SyncAccess<'_>, arg: u32) -> i32 {
        loop {
            let available = sync.state().get();
            let Some(remaining) = available.checked_sub(arg) else {
                return -1;
            };
            if sync.state().compare_exchange(available, remaining).is_ok() {
                return i32::try_from(remaining).unwrap_or(i32::MAX);
            }
        }
    }

    fn try_release_shared(&self, sync: &SyncAccess<'_>, arg: u32) -> bool {
        loop {
            let available = sync.state().get();
            let next = available
                .checked_add(arg)
                .expect("semaphore permit count overflow");
            if sync.state().compare_exchange(available, next).is_ok() {
                return true;
            }
        }
    }
}
