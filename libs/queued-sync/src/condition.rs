// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Condition queues: wait/signal on top of an exclusively-held synchronizer.
//!
//! Each [`Condition`] keeps its own singly-linked list of waiters, threaded
//! through the nodes' `cond_next` links. A node lives on at most one of
//! {condition list, sync queue}; `status == CONDITION` marks condition
//! residence, and clearing it (by CAS) is the atomic hand-over point between
//! a signaller and a concurrently-interrupted waiter: whichever side wins
//! the CAS moves the node to the sync queue, the loser follows along.
//!
//! Because every operation here requires the synchronizer to be held in
//! exclusive mode, the list fields themselves are uncontended; they are
//! atomics only so that the kernel has no unsynchronized shared memory at
//! all.

use crate::error::{Interrupted, MonitorStateError, WaitError};
use crate::loom::{AtomicUsize, Ordering};
use crate::node::{Mode, NIL, Node, wait_status};
use crate::sync::{ExclusiveProtocol, QueuedSync, SPIN_FOR_TIMEOUT_THRESHOLD};
use core::fmt;
use core::time::Duration;
use std::sync::{Arc, Weak};
use std::time::Instant;

/// A wait/signal queue bound to one [`QueuedSync`].
///
/// Created by [`QueuedSync::new_condition`]. The back-reference to the
/// synchronizer is non-owning; all operations fail with
/// [`MonitorStateError`] if the synchronizer has been dropped or is not held
/// exclusively by the calling thread.
pub struct Condition<P: ExclusiveProtocol> {
    sync: Weak<QueuedSync<P>>,
    first_waiter: AtomicUsize,
    last_waiter: AtomicUsize,
}

/// How an interrupt observed during a wait is to be reported: not at all,
/// by re-asserting the flag (the signal won the race), or by returning
/// [`Interrupted`] (the interrupt won).
#[derive(Copy, Clone, Eq, PartialEq)]
enum InterruptMode {
    None,
    Reinterrupt,
    Throw,
}

impl<P: ExclusiveProtocol> QueuedSync<P> {
    /// Creates a new condition queue bound to this synchronizer.
    #[must_use]
    pub fn new_condition(self: &Arc<Self>) -> Condition<P> {
        Condition {
            sync: Arc::downgrade(self),
            first_waiter: AtomicUsize::new(NIL),
            last_waiter: AtomicUsize::new(NIL),
        }
    }
}

// === impl Condition ===

impl<P: ExclusiveProtocol> Condition<P> {
    fn sync(&self) -> Result<Arc<QueuedSync<P>>, MonitorStateError> {
        self.sync.upgrade().ok_or(MonitorStateError(()))
    }

    /// Whether this condition was created by the given synchronizer. Lock
    /// facades use this to reject a guard from an unrelated lock before
    /// releasing anything.
    #[must_use]
    pub fn is_bound_to(&self, sync: &Arc<QueuedSync<P>>) -> bool {
        core::ptr::eq(self.sync.as_ptr(), Arc::as_ptr(sync))
    }

    fn check_owner(&self, sync: &QueuedSync<P>) -> Result<(), MonitorStateError> {
        if sync.protocol.is_held_exclusively(&sync.access()) {
            Ok(())
        } else {
            Err(MonitorStateError(()))
        }
    }

    /// Releases the synchronizer completely and waits to be signalled.
    ///
    /// The full held state (including reentrant holds) is saved, released,
    /// and re-acquired before this returns — by any path, including the
    /// error one.
    ///
    /// # Errors
    ///
    /// - [`WaitError::MonitorState`] if the synchronizer is not held by the
    ///   calling thread (or no longer exists).
    /// - [`WaitError::Interrupted`] if the thread was interrupted before
    ///   being signalled. If an interrupt and a signal race, exactly one
    ///   outcome is reported: either this error (interrupt won), or normal
    ///   return with the interrupt flag re-asserted (signal won).
    pub fn wait(&self) -> Result<(), WaitError> {
        let sync = self.sync()?;
        self.check_owner(&sync)?;
        if parking::interrupted() {
            return Err(Interrupted(()).into());
        }

        let key = self.add_waiter(&sync);
        let saved = self.fully_release(&sync, key)?;

        let mut mode = InterruptMode::None;
        while !Self::is_on_sync_queue(&sync, key) {
            parking::park();
            match self.check_interrupt_while_waiting(&sync, key) {
                InterruptMode::None => {}
                observed => {
                    mode = observed;
                    break;
                }
            }
        }

        if sync.acquire_queued(key, saved) && mode != InterruptMode::Throw {
            mode = InterruptMode::Reinterrupt;
        }
        if self.still_linked(&sync, key) {
            self.unlink_cancelled_waiters(&sync);
        }
        self.report(mode)
    }

    /// Like [`wait`](Self::wait), but interrupts are swallowed for the
    /// duration of the wait and re-asserted before returning.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorStateError`] if the synchronizer is not held by the
    /// calling thread.
    pub fn wait_uninterruptibly(&self) -> Result<(), MonitorStateError> {
        let sync = self.sync()?;
        self.check_owner(&sync)?;

        let key = self.add_waiter(&sync);
        let saved = self.fully_release(&sync, key)?;

        let mut interrupted = false;
        while !Self::is_on_sync_queue(&sync, key) {
            parking::park();
            if parking::interrupted() {
                interrupted = true;
            }
        }
        if sync.acquire_queued(key, saved) || interrupted {
            parking::self_interrupt();
        }
        Ok(())
    }

    /// Waits with a timeout, returning the time left until the deadline in
    /// nanoseconds. A non-positive return means the wait timed out.
    ///
    /// # Errors
    ///
    /// As [`wait`](Self::wait).
    pub fn wait_nanos(&self, timeout: Duration) -> Result<i64, WaitError> {
        let sync = self.sync()?;
        self.check_owner(&sync)?;
        if parking::interrupted() {
            return Err(Interrupted(()).into());
        }

        let deadline = Instant::now() + timeout;
        let key = self.add_waiter(&sync);
        let saved = self.fully_release(&sync, key)?;

        let mut mode = InterruptMode::None;
        while !Self::is_on_sync_queue(&sync, key) {
            let now = Instant::now();
            if now >= deadline {
                Self::transfer_after_cancelled_wait(&sync, key);
                break;
            }
            let remaining = deadline - now;
            // Near the deadline, spin rather than paying for a park that
            // would expire immediately.
            if remaining > SPIN_FOR_TIMEOUT_THRESHOLD {
                parking::park_timeout(remaining);
            }
            match self.check_interrupt_while_waiting(&sync, key) {
                InterruptMode::None => {}
                observed => {
                    mode = observed;
                    break;
                }
            }
        }

        if sync.acquire_queued(key, saved) && mode != InterruptMode::Throw {
            mode = InterruptMode::Reinterrupt;
        }
        if self.still_linked(&sync, key) {
            self.unlink_cancelled_waiters(&sync);
        }
        self.report(mode)?;
        Ok(remaining_nanos(deadline))
    }

    /// Waits until the given deadline. Returns `Ok(false)` if the deadline
    /// passed before a signal arrived.
    ///
    /// # Errors
    ///
    /// As [`wait`](Self::wait).
    pub fn wait_until(&self, deadline: Instant) -> Result<bool, WaitError> {
        let sync = self.sync()?;
        self.check_owner(&sync)?;
        if parking::interrupted() {
            return Err(Interrupted(()).into());
        }

        let key = self.add_waiter(&sync);
        let saved = self.fully_release(&sync, key)?;

        let mut timed_out = false;
        let mut mode = InterruptMode::None;
        while !Self::is_on_sync_queue(&sync, key) {
            if Instant::now() >= deadline {
                timed_out = Self::transfer_after_cancelled_wait(&sync, key);
                break;
            }
            parking::park_until(deadline);
            match self.check_interrupt_while_waiting(&sync, key) {
                InterruptMode::None => {}
                observed => {
                    mode = observed;
                    break;
                }
            }
        }

        if sync.acquire_queued(key, saved) && mode != InterruptMode::Throw {
            mode = InterruptMode::Reinterrupt;
        }
        if self.still_linked(&sync, key) {
            self.unlink_cancelled_waiters(&sync);
        }
        self.report(mode)?;
        Ok(!timed_out)
    }

    /// Moves the longest-waiting waiter (if any) to the sync queue, so it
    /// re-acquires once the caller releases.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorStateError`] if the synchronizer is not held by the
    /// calling thread.
    pub fn signal(&self) -> Result<(), MonitorStateError> {
        let sync = self.sync()?;
        self.check_owner(&sync)?;

        let mut first = self.first_waiter.load(Ordering::SeqCst);
        while first != NIL {
            let next = sync
                .queue
                .node(first)
                .map_or(NIL, |n| n.cond_next.load(Ordering::SeqCst));
            self.first_waiter.store(next, Ordering::SeqCst);
            if next == NIL {
                self.last_waiter.store(NIL, Ordering::SeqCst);
            }
            if let Some(node) = sync.queue.node(first) {
                node.cond_next.store(NIL, Ordering::SeqCst);
            }
            // A cancelled waiter refuses the transfer; move on to the next.
            if Self::transfer_for_signal(&sync, first) {
                break;
            }
            first = self.first_waiter.load(Ordering::SeqCst);
        }
        Ok(())
    }

    /// Moves every waiter to the sync queue.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorStateError`] if the synchronizer is not held by the
    /// calling thread.
    pub fn signal_all(&self) -> Result<(), MonitorStateError> {
        let sync = self.sync()?;
        self.check_owner(&sync)?;

        let mut cursor = self.first_waiter.load(Ordering::SeqCst);
        self.first_waiter.store(NIL, Ordering::SeqCst);
        self.last_waiter.store(NIL, Ordering::SeqCst);
        while cursor != NIL {
            let next = sync
                .queue
                .node(cursor)
                .map_or(NIL, |n| n.cond_next.load(Ordering::SeqCst));
            if let Some(node) = sync.queue.node(cursor) {
                node.cond_next.store(NIL, Ordering::SeqCst);
            }
            let _ = Self::transfer_for_signal(&sync, cursor);
            cursor = next;
        }
        Ok(())
    }

    /// Whether any thread is waiting on this condition.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorStateError`] if the synchronizer is not held by the
    /// calling thread.
    pub fn has_waiters(&self) -> Result<bool, MonitorStateError> {
        Ok(self.wait_queue_length()? != 0)
    }

    /// The number of threads waiting on this condition.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorStateError`] if the synchronizer is not held by the
    /// calling thread.
    pub fn wait_queue_length(&self) -> Result<usize, MonitorStateError> {
        let sync = self.sync()?;
        self.check_owner(&sync)?;

        let mut count = 0;
        let mut cursor = self.first_waiter.load(Ordering::SeqCst);
        while cursor != NIL {
            let Some(node) = sync.queue.node(cursor) else {
                break;
            };
            if node.status.load(Ordering::SeqCst) == wait_status::CONDITION {
                count += 1;
            }
            cursor = node.cond_next.load(Ordering::SeqCst);
        }
        Ok(count)
    }

    // === internals ===

    /// Appends a fresh CONDITION node for the current thread, scrubbing any
    /// trailing cancelled waiter first.
    fn add_waiter(&self, sync: &QueuedSync<P>) -> usize {
        let mut tail = self.last_waiter.load(Ordering::SeqCst);
        if tail != NIL {
            let stale = sync
                .queue
                .node(tail)
                .is_none_or(|n| n.status.load(Ordering::SeqCst) != wait_status::CONDITION);
            if stale {
                self.unlink_cancelled_waiters(sync);
                tail = self.last_waiter.load(Ordering::SeqCst);
            }
        }

        let key = sync.queue.insert_unlinked(Node::new(
            Mode::Exclusive,
            Some(parking::current()),
            wait_status::CONDITION,
        ));
        if tail == NIL {
            self.first_waiter.store(key, Ordering::SeqCst);
        } else if let Some(t) = sync.queue.node(tail) {
            t.cond_next.store(key, Ordering::SeqCst);
        } else {
            self.first_waiter.store(key, Ordering::SeqCst);
        }
        self.last_waiter.store(key, Ordering::SeqCst);
        key
    }

    /// Releases the entire held state, returning the saved value to
    /// re-acquire with. On failure the node is marked cancelled so later
    /// list maintenance discards it.
    fn fully_release(
        &self,
        sync: &QueuedSync<P>,
        key: usize,
    ) -> Result<u32, MonitorStateError> {
        let saved = sync.state().get();
        if sync.release(saved) {
            Ok(saved)
        } else {
            if let Some(node) = sync.queue.node(key) {
                node.status.store(wait_status::CANCELLED, Ordering::SeqCst);
            }
            Err(MonitorStateError(()))
        }
    }

    /// Whether `key` has moved from this condition's list to the sync
    /// queue.
    fn is_on_sync_queue(sync: &QueuedSync<P>, key: usize) -> bool {
        let Some(node) = sync.queue.node(key) else {
            return true;
        };
        if node.status.load(Ordering::SeqCst) == wait_status::CONDITION
            || node.prev.load(Ordering::SeqCst) == NIL
        {
            return false;
        }
        // A set `next` proves the node is enqueued; otherwise the enqueue
        // may still be mid-flight, so search from the tail.
        if node.next.load(Ordering::SeqCst) != NIL {
            return true;
        }
        drop(node);
        sync.queue.find_node_from_tail(key)
    }

    /// Classifies an interrupt observed after a park: `Throw` if the
    /// interrupt beat any signal (we moved the node ourselves), `Reinterrupt`
    /// if a signal got there first, `None` if not interrupted at all.
    fn check_interrupt_while_waiting(&self, sync: &QueuedSync<P>, key: usize) -> InterruptMode {
        if parking::interrupted() {
            if Self::transfer_after_cancelled_wait(sync, key) {
                InterruptMode::Throw
            } else {
                InterruptMode::Reinterrupt
            }
        } else {
            InterruptMode::None
        }
    }

    /// Resolves the interrupt-versus-signal race. Returns `true` if the
    /// cancelled wait won (and enqueued the node itself); on `false`, spins
    /// until the winning signaller has finished enqueueing.
    fn transfer_after_cancelled_wait(sync: &QueuedSync<P>, key: usize) -> bool {
        let won = sync.queue.node(key).is_some_and(|n| {
            n.status
                .compare_exchange(wait_status::CONDITION, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        });
        if won {
            sync.queue.enq(key);
            return true;
        }
        while !Self::is_on_sync_queue(sync, key) {
            std::thread::yield_now();
        }
        false
    }

    /// Moves a signalled node onto the sync queue. Fails (returning `false`)
    /// if the waiter cancelled first. If the new predecessor cannot be
    /// relied on to signal, the waiter is unparked immediately so it can
    /// stabilize itself.
    fn transfer_for_signal(sync: &QueuedSync<P>, key: usize) -> bool {
        let won = sync.queue.node(key).is_some_and(|n| {
            n.status
                .compare_exchange(wait_status::CONDITION, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        });
        if !won {
            return false;
        }

        let pred = sync.queue.enq(key);
        let mut wake_now = true;
        if let Some(p) = sync.queue.node(pred) {
            let status = p.status.load(Ordering::SeqCst);
            if status <= 0
                && p.status
                    .compare_exchange(status, wait_status::SIGNAL, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                wake_now = false;
            }
        }
        if wake_now {
            if let Some(node) = sync.queue.node(key) {
                node.unpark();
            }
        }
        true
    }

    fn still_linked(&self, sync: &QueuedSync<P>, key: usize) -> bool {
        sync.queue
            .node(key)
            .is_some_and(|n| n.cond_next.load(Ordering::SeqCst) != NIL)
    }

    /// Sweeps the condition list, dropping every node that is no longer in
    /// CONDITION state. Nodes that never reached the sync queue are
    /// reclaimed here; transferred ones are the sync queue's to reclaim.
    ///
    /// Called only while holding the synchronizer.
    fn unlink_cancelled_waiters(&self, sync: &QueuedSync<P>) {
        let mut cursor = self.first_waiter.load(Ordering::SeqCst);
        let mut trail = NIL;
        while cursor != NIL {
            // (next, keep, reclaim); None means the key no longer resolves
            // and the list ends here.
            let step = sync.queue.node(cursor).map(|node| {
                if node.status.load(Ordering::SeqCst) == wait_status::CONDITION {
                    (node.cond_next.load(Ordering::SeqCst), true, false)
                } else {
                    let next = node.cond_next.load(Ordering::SeqCst);
                    node.cond_next.store(NIL, Ordering::SeqCst);
                    let reclaim = node.status.load(Ordering::SeqCst) == wait_status::CANCELLED
                        && node.prev.load(Ordering::SeqCst) == NIL;
                    (next, false, reclaim)
                }
            });

            match step {
                Some((next, true, _)) => {
                    trail = cursor;
                    cursor = next;
                }
                Some((next, false, reclaim)) => {
                    if trail == NIL {
                        self.first_waiter.store(next, Ordering::SeqCst);
                    } else if let Some(t) = sync.queue.node(trail) {
                        t.cond_next.store(next, Ordering::SeqCst);
                    }
                    if next == NIL {
                        self.last_waiter.store(trail, Ordering::SeqCst);
                    }
                    if reclaim {
                        sync.queue.discard(cursor);
                    }
                    cursor = next;
                }
                None => {
                    if trail == NIL {
                        self.first_waiter.store(NIL, Ordering::SeqCst);
                    } else if let Some(t) = sync.queue.node(trail) {
                        t.cond_next.store(NIL, Ordering::SeqCst);
                    }
                    self.last_waiter.store(trail, Ordering::SeqCst);
                    break;
                }
            }
        }
    }

    fn report(&self, mode: InterruptMode) -> Result<(), WaitError> {
        match mode {
            InterruptMode::None => Ok(()),
            InterruptMode::Reinterrupt => {
                parking::self_interrupt();
                Ok(())
            }
            InterruptMode::Throw => Err(Interrupted(()).into()),
        }
    }
}

impl<P: ExclusiveProtocol> fmt::Debug for Condition<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("first_waiter", &self.first_waiter.load(Ordering::SeqCst))
            .field("last_waiter", &self.last_waiter.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn remaining_nanos(deadline: Instant) -> i64 {
    let now = Instant::now();
    if now >= deadline {
        i64::try_from((now - deadline).as_nanos()).map_or(i64::MIN, i64::saturating_neg)
    } else {
        i64::try_from((deadline - now).as_nanos()).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::thread;
    use crate::test_util::TestMutex;
    use std::sync::mpsc;

    fn new_sync() -> Arc<QueuedSync<TestMutex>> {
        Arc::new(QueuedSync::new(TestMutex::new()))
    }

    /// Polls a predicate that can only be evaluated while holding the lock.
    fn poll_locked(
        sync: &Arc<QueuedSync<TestMutex>>,
        mut pred: impl FnMut() -> bool,
    ) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            sync.acquire(1);
            let done = pred();
            sync.release(1);
            if done {
                return;
            }
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn signal_requires_exclusive_hold() {
        let sync = new_sync();
        let cond = sync.new_condition();
        assert_eq!(cond.signal(), Err(MonitorStateError(())));
        assert_eq!(cond.signal_all(), Err(MonitorStateError(())));
        assert_eq!(cond.has_waiters(), Err(MonitorStateError(())));
        assert_eq!(cond.wait(), Err(WaitError::MonitorState(MonitorStateError(()))));
    }

    #[test]
    fn wait_and_signal_round_trip_preserves_reentrant_state() {
        let sync = new_sync();
        let cond = Arc::new(sync.new_condition());

        let (tx, rx) = mpsc::channel();
        let consumer = {
            let sync = Arc::clone(&sync);
            let cond = Arc::clone(&cond);
            thread::spawn(move || {
                sync.acquire(1);
                sync.acquire(1);
                assert_eq!(sync.state().get(), 2);
                cond.wait().unwrap();
                // The wait released everything and re-acquired the exact
                // saved state, across both reentrant holds.
                assert!(sync.is_held_exclusively());
                assert_eq!(sync.state().get(), 2);
                sync.release(1);
                sync.release(1);
                tx.send(()).unwrap();
            })
        };

        poll_locked(&sync, || cond.has_waiters().unwrap());
        sync.acquire(1);
        cond.signal().unwrap();
        sync.release(1);

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        consumer.join().unwrap();
    }

    #[test]
    fn interrupted_wait_reports_and_reacquires() {
        let sync = new_sync();
        let cond = Arc::new(sync.new_condition());

        let (thread_tx, thread_rx) = mpsc::channel();
        let (tx, rx) = mpsc::channel();
        let consumer = {
            let sync = Arc::clone(&sync);
            let cond = Arc::clone(&cond);
            thread::spawn(move || {
                thread_tx.send(parking::current()).unwrap();
                sync.acquire(1);
                let outcome = cond.wait();
                // Even the error path returns with the lock re-acquired and
                // the interrupt flag consumed.
                assert!(sync.is_held_exclusively());
                assert!(!parking::is_interrupted());
                sync.release(1);
                tx.send(outcome).unwrap();
            })
        };

        let target = thread_rx.recv().unwrap();
        poll_locked(&sync, || cond.has_waiters().unwrap());
        target.interrupt();

        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            outcome,
            Err(WaitError::Interrupted(Interrupted(())))
        );
        consumer.join().unwrap();
    }

    #[test]
    fn interrupt_signal_race_resolves_exactly_once() {
        let sync = new_sync();
        let cond = Arc::new(sync.new_condition());

        for _ in 0..30 {
            let (thread_tx, thread_rx) = mpsc::channel();
            let (tx, rx) = mpsc::channel();
            let consumer = {
                let sync = Arc::clone(&sync);
                let cond = Arc::clone(&cond);
                thread::spawn(move || {
                    thread_tx.send(parking::current()).unwrap();
                    sync.acquire(1);
                    let outcome = cond.wait();
                    assert!(sync.is_held_exclusively());
                    let flag = parking::interrupted();
                    sync.release(1);
                    tx.send((outcome.is_ok(), flag)).unwrap();
                })
            };

            let target = thread_rx.recv().unwrap();
            poll_locked(&sync, || cond.has_waiters().unwrap());

            // Interrupt first, then signal: the two now race inside the
            // kernel and exactly one outcome must be reported.
            target.interrupt();
            sync.acquire(1);
            cond.signal().unwrap();
            sync.release(1);

            let (ok, flag) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            if ok {
                // Signal won; the interrupt must have been re-asserted.
                assert!(flag, "normal return must re-assert the interrupt");
            } else {
                // Interrupt won; the flag was consumed by the error.
                assert!(!flag, "interrupted return must consume the flag");
            }
            consumer.join().unwrap();
        }
    }

    #[test]
    fn wait_nanos_times_out_while_still_holding_after_return() {
        let sync = new_sync();
        let cond = Arc::new(sync.new_condition());

        sync.acquire(1);
        let start = Instant::now();
        let remaining = cond.wait_nanos(Duration::from_millis(50)).unwrap();
        assert!(remaining <= 0);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(sync.is_held_exclusively());

        let signalled = cond
            .wait_until(Instant::now() + Duration::from_millis(20))
            .unwrap();
        assert!(!signalled);
        assert!(sync.is_held_exclusively());
        sync.release(1);
    }

    #[test]
    fn signal_all_wakes_every_waiter() {
        let sync = new_sync();
        let cond = Arc::new(sync.new_condition());

        let (tx, rx) = mpsc::channel();
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let sync = Arc::clone(&sync);
                let cond = Arc::clone(&cond);
                let tx = tx.clone();
                thread::spawn(move || {
                    sync.acquire(1);
                    cond.wait().unwrap();
                    sync.release(1);
                    tx.send(i).unwrap();
                })
            })
            .collect();

        poll_locked(&sync, || cond.wait_queue_length().unwrap() == 3);
        sync.acquire(1);
        cond.signal_all().unwrap();
        sync.release(1);

        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn wait_uninterruptibly_outlasts_interrupt() {
        let sync = new_sync();
        let cond = Arc::new(sync.new_condition());

        let (thread_tx, thread_rx) = mpsc::channel();
        let (tx, rx) = mpsc::channel();
        let consumer = {
            let sync = Arc::clone(&sync);
            let cond = Arc::clone(&cond);
            thread::spawn(move || {
                thread_tx.send(parking::current()).unwrap();
                sync.acquire(1);
                cond.wait_uninterruptibly().unwrap();
                let flag = parking::is_interrupted();
                sync.release(1);
                tx.send(flag).unwrap();
            })
        };

        let target = thread_rx.recv().unwrap();
        poll_locked(&sync, || cond.has_waiters().unwrap());
        target.interrupt();

        // The interrupt alone must not end the wait.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        poll_locked(&sync, || cond.has_waiters().unwrap());

        sync.acquire(1);
        cond.signal().unwrap();
        sync.release(1);

        // Signalled out of the wait with the interrupt re-asserted.
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        consumer.join().unwrap();
    }
}
