// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::{AtomicI32, AtomicUsize, Ordering};
use core::fmt;
use core::num::NonZeroU64;
use std::sync::{Mutex, PoisonError};

/// Sentinel slab key meaning "no node".
pub(crate) const NIL: usize = usize::MAX;

/// Wait-status values, stored in [`Node::status`].
///
/// Negative values mean "there is (or may be) work to do on release";
/// positive means the node gave up. Status is set on a *predecessor* by its
/// successor, with the exception of [`CANCELLED`], which a waiter writes to
/// its own node.
pub(crate) mod wait_status {
    /// The successor is (or will soon be) parked and must be unparked when
    /// this node releases or cancels.
    pub(crate) const SIGNAL: i32 = -1;
    /// The waiter timed out or was interrupted; cancelled nodes are never
    /// parked on and are spliced out of the queue by later traversals.
    pub(crate) const CANCELLED: i32 = 1;
    /// The node is waiting on a condition queue, not the sync queue.
    pub(crate) const CONDITION: i32 = -2;
    /// A shared-mode release must propagate to further shared waiters even
    /// though no successor currently requires a signal.
    pub(crate) const PROPAGATE: i32 = -3;
}

/// Which flavor of acquisition a waiter is blocked on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Mode {
    Exclusive,
    Shared,
}

/// One entry in the wait queue: a blocked thread plus the links that thread
/// the node into the sync queue (`prev`/`next`) or a condition queue
/// (`cond_next`).
///
/// Links are slab keys rather than pointers. Keys carry a generation, so a
/// link to a node that has since been reclaimed simply stops resolving; every
/// traversal treats an unresolvable key the same way it treats a stale
/// `next` link and falls back to re-scanning from the tail.
pub(crate) struct Node {
    /// The blocked thread, for unparking. Cleared once the node becomes the
    /// queue head (the head is a sentinel and owns no thread).
    thread: Mutex<Option<parking::Thread>>,
    mode: Mode,
    pub(crate) status: AtomicI32,
    /// Predecessor in the sync queue. Load-bearing: the acquire protocol and
    /// all fallback scans walk `prev`.
    pub(crate) prev: AtomicUsize,
    /// Successor in the sync queue. An optimization only; written after the
    /// tail CAS, so it may lag behind and readers must tolerate that. A
    /// cancelled node links `next` to itself.
    pub(crate) next: AtomicUsize,
    /// Next waiter on a condition queue. Only meaningful while
    /// `status == CONDITION` (or just after a transfer).
    pub(crate) cond_next: AtomicUsize,
}

// === impl Node ===

impl Node {
    pub(crate) fn new(mode: Mode, thread: Option<parking::Thread>, status: i32) -> Self {
        Self {
            thread: Mutex::new(thread),
            mode,
            status: AtomicI32::new(status),
            prev: AtomicUsize::new(NIL),
            next: AtomicUsize::new(NIL),
            cond_next: AtomicUsize::new(NIL),
        }
    }

    #[inline]
    pub(crate) fn is_shared(&self) -> bool {
        self.mode == Mode::Shared
    }

    pub(crate) fn thread(&self) -> Option<parking::Thread> {
        self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn thread_id(&self) -> Option<NonZeroU64> {
        self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(parking::Thread::id)
    }

    pub(crate) fn has_thread(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub(crate) fn clear_thread(&self) {
        *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Unparks the owning thread, if the node still has one.
    pub(crate) fn unpark(&self) {
        if let Some(thread) = self.thread() {
            thread.unpark();
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("mode", &self.mode)
            .field("status", &self.status.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
