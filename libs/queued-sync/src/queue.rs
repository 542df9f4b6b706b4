// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The sync queue: a lock-free FIFO of waiters contending for the state
//! word.
//!
//! The queue is a blocking adaptation of a CLH spin queue: each waiter
//! watches its predecessor's status instead of spinning on a shared flag,
//! and parks once it has asked the predecessor (by CASing its status to
//! `SIGNAL`) to wake it on release.
//!
//! Nodes live in a [`Slab`] and link to each other through generation-tagged
//! keys. The generation tag does the job a tracing collector does in managed
//! runtimes: a traversal that reaches a reclaimed node observes a dead key
//! (`get` returns `None`) rather than recycled memory, and recovers by
//! re-scanning from `tail` — the same fallback the protocol already needs
//! for lagging `next` links.
//!
//! Reclamation rules, chosen so that every *persistent* reference to a node
//! is gone before the node is removed from the slab:
//!
//! - the old head is removed by `set_head`; the only persistent link to it
//!   was the new head's `prev`, which `set_head` clears,
//! - a cancelled node is removed by the unique successor that rewrites its
//!   own `prev` past it (or by `cancel_acquire` itself when the node was the
//!   tail and the tail was successfully retreated),
//! - everything else (stale `next` links, in-flight scans) only ever holds a
//!   node *transiently* and already tolerates dead keys.

use crate::loom::{AtomicUsize, Ordering};
use crate::node::{Mode, NIL, Node, wait_status};
use core::num::NonZeroU64;
use sharded_slab::{Entry, Slab};

pub(crate) struct SyncQueue {
    slab: Slab<Node>,
    /// Head of the queue: a sentinel whose thread slot is empty. `NIL` until
    /// the first contended acquire.
    head: AtomicUsize,
    /// Tail of the queue. `NIL` iff `head` is `NIL` (modulo the one-store
    /// window during lazy initialization, which enqueuers simply retry
    /// through).
    tail: AtomicUsize,
}

// === impl SyncQueue ===

impl SyncQueue {
    pub(crate) fn new() -> Self {
        Self {
            slab: Slab::new(),
            head: AtomicUsize::new(NIL),
            tail: AtomicUsize::new(NIL),
        }
    }

    #[inline]
    pub(crate) fn node(&self, key: usize) -> Option<Entry<'_, Node>> {
        if key == NIL { None } else { self.slab.get(key) }
    }

    #[inline]
    pub(crate) fn head_key(&self) -> usize {
        self.head.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn tail_key(&self) -> usize {
        self.tail.load(Ordering::SeqCst)
    }

    /// Whether the queue has ever been initialized, i.e. whether any acquire
    /// has ever contended.
    #[inline]
    pub(crate) fn has_contended(&self) -> bool {
        self.head_key() != NIL
    }

    /// Allocates a node for the current thread and appends it to the queue.
    pub(crate) fn add_waiter(&self, mode: Mode) -> usize {
        let node = Node::new(mode, Some(parking::current()), 0);
        let key = self
            .slab
            .insert(node)
            .expect("wait queue node storage exhausted");
        self.enq(key);
        key
    }

    /// Appends an existing node (a fresh waiter or a node transferred off a
    /// condition queue) to the tail. Returns the predecessor's key.
    ///
    /// The node's `prev` is written *before* the tail CAS so that
    /// cancellation walks can always traverse past a half-linked loser; the
    /// predecessor's `next` is written after winning, which is why `next`
    /// readers must tolerate a transient gap.
    pub(crate) fn enq(&self, key: usize) -> usize {
        loop {
            let tail = self.tail.load(Ordering::SeqCst);
            if tail == NIL {
                self.try_init();
                continue;
            }

            {
                let node = self
                    .slab
                    .get(key)
                    .expect("enqueueing a node that is not in the slab");
                node.prev.store(tail, Ordering::SeqCst);
            }
            if self
                .tail
                .compare_exchange(tail, key, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                if let Some(pred) = self.node(tail) {
                    pred.next.store(key, Ordering::SeqCst);
                }
                return tail;
            }
        }
    }

    /// Lazily installs the head sentinel. Losers of the head CAS discard
    /// their speculative sentinel and retry; `tail` briefly lags `head`,
    /// which enqueuers tolerate by looping.
    fn try_init(&self) {
        let sentinel = self
            .slab
            .insert(Node::new(Mode::Exclusive, None, 0))
            .expect("wait queue node storage exhausted");
        if self
            .head
            .compare_exchange(NIL, sentinel, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.tail.store(sentinel, Ordering::SeqCst);
        } else {
            self.slab.remove(sentinel);
        }
    }

    /// Installs `key` as the new head sentinel. Called only by the thread
    /// whose node just acquired, so the head store itself is uncontended.
    ///
    /// The displaced sentinel is reclaimed here: the new head's `prev` was
    /// the last persistent link to it.
    pub(crate) fn set_head(&self, key: usize) {
        let old = self.head.load(Ordering::SeqCst);
        self.head.store(key, Ordering::SeqCst);
        if let Some(node) = self.node(key) {
            node.clear_thread();
            node.prev.store(NIL, Ordering::SeqCst);
        }
        if old != NIL {
            self.slab.remove(old);
        }
    }

    #[inline]
    pub(crate) fn predecessor(&self, key: usize) -> usize {
        self.node(key)
            .map_or(NIL, |node| node.prev.load(Ordering::SeqCst))
    }

    /// Decides whether a waiter that just failed its acquire attempt should
    /// park.
    ///
    /// Returns `true` only once the predecessor's status is `SIGNAL`, i.e.
    /// the predecessor is committed to unparking us on release. Otherwise
    /// repairs the local neighborhood (skips cancelled predecessors,
    /// installs `SIGNAL`) and returns `false` so the caller re-runs its
    /// acquire check before actually parking.
    pub(crate) fn should_park_after_failed_acquire(&self, pred: usize, key: usize) -> bool {
        let status = match self.node(pred) {
            Some(node) => node.status.load(Ordering::SeqCst),
            // The predecessor key no longer resolves; let the caller re-read
            // its links and retry.
            None => return false,
        };

        if status == wait_status::SIGNAL {
            return true;
        }

        if status > 0 {
            // Predecessor cancelled: retarget our `prev` past the cancelled
            // run. Each node we skip had exactly one persistent reference
            // (our `prev`), so it can be reclaimed as we go.
            let Some(node) = self.node(key) else {
                return false;
            };
            let mut pred = pred;
            loop {
                let skip = match self.node(pred) {
                    Some(p) if p.status.load(Ordering::SeqCst) > 0 => {
                        Some(p.prev.load(Ordering::SeqCst))
                    }
                    _ => None,
                };
                match skip {
                    Some(before) if before != NIL => {
                        node.prev.store(before, Ordering::SeqCst);
                        self.slab.remove(pred);
                        pred = before;
                    }
                    _ => break,
                }
            }
            if let Some(p) = self.node(pred) {
                p.next.store(key, Ordering::SeqCst);
            }
        } else {
            // 0 or PROPAGATE: ask the predecessor to signal us. The caller
            // retries its acquire once more before parking, closing the
            // window in which the predecessor released before seeing SIGNAL.
            if let Some(p) = self.node(pred) {
                let _ = p
                    .status
                    .compare_exchange(status, wait_status::SIGNAL, Ordering::SeqCst, Ordering::SeqCst);
            }
        }
        false
    }

    /// Wakes the successor of `key` (typically the head), if any.
    pub(crate) fn unpark_successor(&self, key: usize) {
        let Some(node) = self.node(key) else { return };

        // Clearing a negative status is a courtesy to the successor; it is
        // fine for this CAS to fail or for the status to change again.
        let status = node.status.load(Ordering::SeqCst);
        if status < 0 {
            let _ = node
                .status
                .compare_exchange(status, 0, Ordering::SeqCst, Ordering::SeqCst);
        }

        // The successor is usually `next`, but `next` can lag an enqueue or
        // point at a cancelled node (or at the node itself, the cancelled
        // self-link); in those cases scan backwards from tail for the
        // closest live successor.
        let mut successor = node.next.load(Ordering::SeqCst);
        let direct_ok = successor != NIL
            && successor != key
            && self
                .node(successor)
                .is_some_and(|s| s.status.load(Ordering::SeqCst) <= 0);
        if !direct_ok {
            successor = self.scan_successor_from_tail(key);
        }

        if successor != NIL {
            if let Some(s) = self.node(successor) {
                s.unpark();
            }
        }
    }

    /// Finds the non-cancelled node closest to (but not equal to) `key` by
    /// walking `prev` links from the tail. Restarts if the walk crosses a
    /// reclaimed node.
    fn scan_successor_from_tail(&self, key: usize) -> usize {
        'restart: loop {
            let mut candidate = NIL;
            let mut cursor = self.tail.load(Ordering::SeqCst);
            while cursor != NIL && cursor != key {
                let Some(node) = self.node(cursor) else {
                    continue 'restart;
                };
                if node.status.load(Ordering::SeqCst) <= 0 {
                    candidate = cursor;
                }
                cursor = node.prev.load(Ordering::SeqCst);
            }
            return candidate;
        }
    }

    /// Returns whether `key` is reachable from the tail via `prev` links.
    pub(crate) fn find_node_from_tail(&self, key: usize) -> bool {
        'restart: loop {
            let mut cursor = self.tail.load(Ordering::SeqCst);
            loop {
                if cursor == key {
                    return true;
                }
                if cursor == NIL {
                    return false;
                }
                let Some(node) = self.node(cursor) else {
                    continue 'restart;
                };
                cursor = node.prev.load(Ordering::SeqCst);
            }
        }
    }

    /// Release action for shared mode: signal the head's successor and make
    /// sure the release keeps propagating.
    ///
    /// The `PROPAGATE` transition on a status-0 head closes a race with an
    /// acquirer that has just become head but whose successor has not yet
    /// installed `SIGNAL`: without it, this releaser would see status 0,
    /// conclude nobody needs waking, and the wakeup would be lost. Do not
    /// "simplify" it away.
    pub(crate) fn do_release_shared(&self) {
        loop {
            let head = self.head.load(Ordering::SeqCst);
            if head != NIL && head != self.tail.load(Ordering::SeqCst) {
                if let Some(node) = self.node(head) {
                    let status = node.status.load(Ordering::SeqCst);
                    if status == wait_status::SIGNAL {
                        if node
                            .status
                            .compare_exchange(
                                wait_status::SIGNAL,
                                0,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            )
                            .is_err()
                        {
                            continue;
                        }
                        self.unpark_successor(head);
                    } else if status == 0
                        && node
                            .status
                            .compare_exchange(
                                0,
                                wait_status::PROPAGATE,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            )
                            .is_err()
                    {
                        continue;
                    }
                }
            }
            // Only quit once the head is stable across a full iteration.
            if head == self.head.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    /// Abandons a pending acquire after a timeout, interrupt, or a panic in
    /// the user protocol.
    pub(crate) fn cancel_acquire(&self, key: usize) {
        let Some(node) = self.node(key) else { return };

        node.clear_thread();

        // Skip over any already-cancelled predecessors (reclaiming them; our
        // `prev` was their last persistent reference).
        let mut pred = node.prev.load(Ordering::SeqCst);
        loop {
            let skip = match self.node(pred) {
                Some(p) if p.status.load(Ordering::SeqCst) > 0 => {
                    Some(p.prev.load(Ordering::SeqCst))
                }
                _ => None,
            };
            match skip {
                Some(before) if before != NIL => {
                    node.prev.store(before, Ordering::SeqCst);
                    self.slab.remove(pred);
                    pred = before;
                }
                _ => break,
            }
        }

        let pred_next = self
            .node(pred)
            .map_or(NIL, |p| p.next.load(Ordering::SeqCst));

        // A plain store suffices: after this, other threads skip the node
        // entirely, and the fields read above are ours alone.
        node.status.store(wait_status::CANCELLED, Ordering::SeqCst);

        if key == self.tail.load(Ordering::SeqCst)
            && self
                .tail
                .compare_exchange(key, pred, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            // We were the tail: retreat it and detach the predecessor's
            // `next`. Nothing links to us persistently any more.
            if let Some(p) = self.node(pred) {
                let _ = p
                    .next
                    .compare_exchange(pred_next, NIL, Ordering::SeqCst, Ordering::SeqCst);
            }
            self.slab.remove(key);
            return;
        }

        // If the predecessor is a live, signalling waiter, bridge its `next`
        // over us so a release skips straight to our successor. Otherwise
        // our successor may be about to park forever on a dead predecessor:
        // wake it so it can re-stabilize.
        let pred_usable = pred != self.head.load(Ordering::SeqCst)
            && self.node(pred).is_some_and(|p| {
                let status = p.status.load(Ordering::SeqCst);
                let signalling = status == wait_status::SIGNAL
                    || (status <= 0
                        && p.status
                            .compare_exchange(
                                status,
                                wait_status::SIGNAL,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            )
                            .is_ok());
                signalling && p.has_thread()
            });

        if pred_usable {
            let next = node.next.load(Ordering::SeqCst);
            if next != NIL
                && next != key
                && self
                    .node(next)
                    .is_some_and(|n| n.status.load(Ordering::SeqCst) <= 0)
            {
                if let Some(p) = self.node(pred) {
                    let _ = p
                        .next
                        .compare_exchange(pred_next, next, Ordering::SeqCst, Ordering::SeqCst);
                }
            }
        } else {
            self.unpark_successor(key);
        }

        // Cancelled nodes link `next` to themselves so traversals can tell
        // "cancelled, rescan" from "enqueue in progress".
        node.next.store(key, Ordering::SeqCst);
    }

    // === introspection ===

    /// Whether any thread is waiting to acquire. May transiently report
    /// `true` for a queue holding only cancelled nodes.
    pub(crate) fn has_queued_threads(&self) -> bool {
        self.head_key() != self.tail_key()
    }

    /// Whether some other thread is queued ahead of the caller. This is the
    /// query fair protocols consult before barging.
    pub(crate) fn has_queued_predecessors(&self) -> bool {
        let tail = self.tail_key();
        let head = self.head_key();
        if head == tail {
            return false;
        }
        let Some(h) = self.node(head) else {
            // Head moved under us; someone is certainly queued.
            return true;
        };
        let successor = h.next.load(Ordering::SeqCst);
        let Some(s) = self.node(successor) else {
            return true;
        };
        s.thread_id() != Some(parking::current().id())
    }

    /// Whether the first real waiter (if any) is waiting in exclusive mode.
    /// Shared protocols use this as an anti-starvation heuristic: a reader
    /// declines to barge past a queued writer.
    pub(crate) fn first_queued_is_exclusive(&self) -> bool {
        let head = self.head_key();
        if head == NIL {
            return false;
        }
        let Some(h) = self.node(head) else {
            return false;
        };
        let successor = h.next.load(Ordering::SeqCst);
        self.node(successor)
            .is_some_and(|s| !s.is_shared() && s.has_thread())
    }

    /// The number of threads currently waiting, counted by a tail-to-head
    /// traversal. An estimate: the queue can change while it is walked.
    pub(crate) fn len(&self) -> usize {
        'restart: loop {
            let mut count = 0;
            let mut cursor = self.tail.load(Ordering::SeqCst);
            while cursor != NIL {
                let Some(node) = self.node(cursor) else {
                    continue 'restart;
                };
                if node.has_thread() {
                    count += 1;
                }
                cursor = node.prev.load(Ordering::SeqCst);
            }
            return count;
        }
    }

    /// The thread that has been waiting longest, if any.
    pub(crate) fn first_queued_thread(&self) -> Option<parking::Thread> {
        'restart: loop {
            let mut first = None;
            let mut cursor = self.tail.load(Ordering::SeqCst);
            while cursor != NIL {
                let Some(node) = self.node(cursor) else {
                    continue 'restart;
                };
                if let Some(thread) = node.thread() {
                    // Keep overwriting: the last thread seen walking
                    // tail-to-head is the one closest to the head.
                    first = Some(thread);
                }
                cursor = node.prev.load(Ordering::SeqCst);
            }
            return first;
        }
    }

    /// Whether the given thread is currently on the queue.
    pub(crate) fn is_queued(&self, id: NonZeroU64) -> bool {
        'restart: loop {
            let mut cursor = self.tail.load(Ordering::SeqCst);
            while cursor != NIL {
                let Some(node) = self.node(cursor) else {
                    continue 'restart;
                };
                if node.thread_id() == Some(id) {
                    return true;
                }
                cursor = node.prev.load(Ordering::SeqCst);
            }
            return false;
        }
    }

    /// Removes a node that never made it onto the sync queue (a condition
    /// waiter cancelled before transfer).
    pub(crate) fn discard(&self, key: usize) {
        self.slab.remove(key);
    }

    /// Inserts a node without linking it into the sync queue (condition
    /// waiters start on a condition list instead).
    pub(crate) fn insert_unlinked(&self, node: Node) -> usize {
        self.slab
            .insert(node)
            .expect("wait queue node storage exhausted")
    }
}

impl core::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("head", &self.head_key())
            .field("tail", &self.tail_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::model;

    #[test]
    fn starts_untouched() {
        model(|| {
            let queue = SyncQueue::new();
            assert!(!queue.has_contended());
            assert!(!queue.has_queued_threads());
            assert_eq!(queue.len(), 0);
            assert!(queue.first_queued_thread().is_none());
        });
    }

    #[test]
    fn enqueue_installs_sentinel_and_links() {
        model(|| {
            let queue = SyncQueue::new();
            let a = queue.add_waiter(Mode::Exclusive);
            let b = queue.add_waiter(Mode::Shared);

            let head = queue.head_key();
            assert_ne!(head, NIL);
            assert!(queue.node(head).is_some_and(|h| !h.has_thread()));

            // a's predecessor is the sentinel, b's is a; next links mirror
            // them.
            assert_eq!(queue.predecessor(a), head);
            assert_eq!(queue.predecessor(b), a);
            assert_eq!(queue.node(head).unwrap().next.load(Ordering::SeqCst), a);
            assert_eq!(queue.node(a).unwrap().next.load(Ordering::SeqCst), b);
            assert_eq!(queue.tail_key(), b);
            assert_eq!(queue.len(), 2);
            assert!(queue.has_queued_threads());
            assert!(queue.is_queued(parking::current().id()));
        });
    }

    #[test]
    fn first_queued_thread_is_oldest() {
        model(|| {
            let queue = SyncQueue::new();
            let _a = queue.add_waiter(Mode::Exclusive);
            let _b = queue.add_waiter(Mode::Exclusive);
            let first = queue.first_queued_thread().unwrap();
            assert_eq!(first, parking::current());
        });
    }

    #[test]
    fn cancel_of_tail_retreats_and_prunes() {
        model(|| {
            let queue = SyncQueue::new();
            let a = queue.add_waiter(Mode::Exclusive);
            queue.cancel_acquire(a);

            assert_eq!(queue.len(), 0);
            assert_eq!(queue.head_key(), queue.tail_key());
            assert!(queue.node(a).is_none());
        });
    }

    #[test]
    fn cancelled_middle_node_is_reclaimed_by_successor_walk() {
        model(|| {
            let queue = SyncQueue::new();
            let a = queue.add_waiter(Mode::Exclusive);
            let b = queue.add_waiter(Mode::Exclusive);

            // b is the tail, so cancelling a takes the middle-node path.
            queue.cancel_acquire(a);
            assert_eq!(
                queue.node(a).unwrap().status.load(Ordering::SeqCst),
                wait_status::CANCELLED
            );

            // b's park decision walks past the cancelled node and reclaims
            // it.
            let pred = queue.predecessor(b);
            assert_eq!(pred, a);
            assert!(!queue.should_park_after_failed_acquire(pred, b));
            assert_eq!(queue.predecessor(b), queue.head_key());
            assert!(queue.node(a).is_none());
            assert_eq!(queue.len(), 1);
        });
    }

    #[test]
    fn should_park_only_after_signal_is_installed() {
        model(|| {
            let queue = SyncQueue::new();
            let a = queue.add_waiter(Mode::Exclusive);
            let pred = queue.predecessor(a);

            // First call installs SIGNAL on the sentinel, second call parks.
            assert!(!queue.should_park_after_failed_acquire(pred, a));
            assert_eq!(
                queue.node(pred).unwrap().status.load(Ordering::SeqCst),
                wait_status::SIGNAL
            );
            assert!(queue.should_park_after_failed_acquire(pred, a));
        });
    }

    #[test]
    fn set_head_reclaims_old_sentinel() {
        model(|| {
            let queue = SyncQueue::new();
            let a = queue.add_waiter(Mode::Exclusive);
            let old_head = queue.head_key();

            queue.set_head(a);
            assert_eq!(queue.head_key(), a);
            assert!(queue.node(old_head).is_none());
            assert!(queue.node(a).is_some_and(|n| !n.has_thread()));
            assert_eq!(queue.predecessor(a), NIL);
            assert_eq!(queue.len(), 0);
        });
    }
}
