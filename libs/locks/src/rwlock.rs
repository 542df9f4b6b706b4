// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::time::Duration;
use mycelium_bitfield::bitfield;
use queued_sync::{ExclusiveProtocol, Interrupted, QueuedSync, SharedProtocol, SyncAccess};
use static_assertions::assert_impl_all;

bitfield! {
    /// The lock's packed state word: the low half counts the writer's
    /// recursive holds, the high half counts active readers.
    #[derive(Eq, PartialEq)]
    struct RwState<u32> {
        /// The writer's recursion depth (0 = no writer).
        const WRITER_HOLDS = 16;
        /// The number of read holds.
        const READERS = ..;
    }
}

/// Either half saturates at this; exceeding it is unrecoverable.
const MAX_COUNT: u32 = (1 << 16) - 1;

/// Read–write policy over the packed [`RwState`] word. The writer's
/// identity goes in the kernel's owner token, so writer holds can recurse
/// and the writer may take read holds (the downgrade path).
pub(crate) struct RwProtocol {
    fair: bool,
}

impl RwProtocol {
    fn new(fair: bool) -> Self {
        Self { fair }
    }

    fn reader_should_block(&self, sync: &SyncAccess<'_>) -> bool {
        if self.fair {
            sync.has_queued_predecessors()
        } else {
            // Barging readers still step aside for a queued writer; without
            // this, a steady stream of readers starves writers forever.
            sync.first_queued_is_exclusive()
        }
    }
}

impl ExclusiveProtocol for RwProtocol {
    fn try_acquire(&self, sync: &SyncAccess<'_>, arg: u32) -> bool {
        let me = parking::current().id();
        let bits = sync.state().get();
        let state = RwState::from_bits(bits);
        let writer = state.get(RwState::WRITER_HOLDS);

        if bits != 0 {
            // Held by readers, another writer, or ourselves.
            if writer == 0 || sync.owner() != Some(me) {
                return false;
            }
            let holds = writer + arg;
            assert!(holds <= MAX_COUNT, "write hold count overflow");
            sync.state()
                .set(state.with(RwState::WRITER_HOLDS, holds).0);
            true
        } else {
            if self.fair && sync.has_queued_predecessors() {
                return false;
            }
            let claimed = RwState::new().with(RwState::WRITER_HOLDS, arg).0;
            if sync.state().compare_exchange(0, claimed).is_ok() {
                sync.set_owner(Some(me));
                true
            } else {
                false
            }
        }
    }

    fn try_release(&self, sync: &SyncAccess<'_>, arg: u32) -> bool {
        if sync.owner() != Some(parking::current().id()) {
            return false;
        }
        let state = RwState::from_bits(sync.state().get());
        let Some(remaining) = state.get(RwState::WRITER_HOLDS).checked_sub(arg) else {
            return false;
        };
        let free = remaining == 0;
        if free {
            sync.set_owner(None);
        }
        sync.state()
            .set(state.with(RwState::WRITER_HOLDS, remaining).0);
        free
    }

    fn is_held_exclusively(&self, sync: &SyncAccess<'_>) -> bool {
        sync.owner() == Some(parking::current().id())
    }
}

impl SharedProtocol for RwProtocol {
    fn try_acquire_shared(&self, sync: &SyncAccess<'_>, _arg: u32) -> i32 {
        let me = parking::current().id();
        loop {
            let bits = sync.state().get();
            let state = RwState::from_bits(bits);
            let writer = state.get(RwState::WRITER_HOLDS);
            if writer != 0 && sync.owner() != Some(me) {
                return -1;
            }
            if writer == 0 && self.reader_should_block(sync) {
                return -1;
            }
            let readers = state.get(RwState::READERS);
            assert!(readers < MAX_COUNT, "reader count overflow");
            if sync
                .state()
                .compare_exchange(bits, state.with(RwState::READERS, readers + 1).0)
                .is_ok()
            {
                return 1;
            }
        }
    }

    fn try_release_shared(&self, sync: &SyncAccess<'_>, _arg: u32) -> bool {
        loop {
            let bits = sync.state().get();
            let state = RwState::from_bits(bits);
            let Some(remaining) = state.get(RwState::READERS).checked_sub(1) else {
                return false;
            };
            let next = state.with(RwState::READERS, remaining).0;
            if sync.state().compare_exchange(bits, next).is_ok() {
                // Wake waiters only once the lock is entirely free; if the
                // writer still holds (a downgrade in progress), nobody can
                // be admitted anyway.
                return next == 0;
            }
        }
    }
}

/// A blocking reader–writer lock: any number of readers or a single
/// writer.
///
/// Waiting threads queue in one FIFO shared with both modes. The default
/// flavor admits barging (a fresh reader or writer may overtake queued
/// waiters, except that readers step aside for a queued writer);
/// [`new_fair`](RwLock::new_fair) admits strictly in arrival order.
///
/// The single writer may re-take read holds only through
/// [`RwLockWriteGuard::downgrade`], which consumes the write guard;
/// calling [`read`](RwLock::read) or [`write`](RwLock::write) while
/// already holding the write lock panics, since a second guard would alias
/// the first's exclusive access. Recursively acquiring a read lock is
/// possible but may deadlock if a writer has queued in between.
pub struct RwLock<T: ?Sized> {
    pub(crate) sync: QueuedSync<RwProtocol>,
    data: UnsafeCell<T>,
}

// Safety: the lock serializes access: many `&T` under read holds, one
// `&mut T` under the write hold.
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
// Safety: as above.
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

assert_impl_all!(RwLock<u32>: Send, Sync);

/// RAII structure releasing one read hold when dropped.
#[clippy::has_significant_drop]
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    _not_send: PhantomData<*mut ()>,
}

/// RAII structure releasing the write hold when dropped.
#[clippy::has_significant_drop]
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    _not_send: PhantomData<*mut ()>,
}

// === impl RwLock ===

impl<T> RwLock<T> {
    /// Creates a new unlocked lock in the default (barging) flavor.
    pub fn new(value: T) -> Self {
        Self {
            sync: QueuedSync::new(RwProtocol::new(false)),
            data: UnsafeCell::new(value),
        }
    }

    /// Creates a lock that admits waiters strictly in arrival order.
    pub fn new_fair(value: T) -> Self {
        Self {
            sync: QueuedSync::new(RwProtocol::new(true)),
            data: UnsafeCell::new(value),
        }
    }

    /// Consumes the lock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Acquires a read hold, blocking while a writer holds or (in fair
    /// mode / behind a queued writer) while waiters go first.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread holds the write lock; use
    /// [`RwLockWriteGuard::downgrade`] instead.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        assert!(
            !self.sync.is_held_exclusively(),
            "read() while holding the write lock; use downgrade()"
        );
        self.sync.acquire_shared(1);
        RwLockReadGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Attempts to take a read hold without blocking or queueing.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        if self.sync.is_held_exclusively() {
            return None;
        }
        if self.sync.try_acquire_shared_once(1) {
            Some(RwLockReadGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    /// Attempts to take a read hold, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread is interrupted while waiting.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread holds the write lock.
    pub fn try_read_for(
        &self,
        timeout: Duration,
    ) -> Result<Option<RwLockReadGuard<'_, T>>, Interrupted> {
        assert!(
            !self.sync.is_held_exclusively(),
            "read() while holding the write lock; use downgrade()"
        );
        Ok(self.sync.try_acquire_shared_nanos(1, timeout)?.then(|| {
            RwLockReadGuard {
                lock: self,
                _not_send: PhantomData,
            }
        }))
    }

    /// Acquires the write hold, blocking until all readers and any writer
    /// are gone.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds the write lock.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        assert!(
            !self.sync.is_held_exclusively(),
            "recursive write() would alias the existing write guard"
        );
        self.sync.acquire(1);
        RwLockWriteGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Attempts to take the write hold without blocking or queueing.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        if self.sync.is_held_exclusively() {
            return None;
        }
        if self.sync.try_acquire_once(1) {
            Some(RwLockWriteGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    /// Attempts to take the write hold, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread is interrupted while waiting.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds the write lock.
    pub fn try_write_for(
        &self,
        timeout: Duration,
    ) -> Result<Option<RwLockWriteGuard<'_, T>>, Interrupted> {
        assert!(
            !self.sync.is_held_exclusively(),
            "recursive write() would alias the existing write guard"
        );
        Ok(self.sync.try_acquire_nanos(1, timeout)?.then(|| {
            RwLockWriteGuard {
                lock: self,
                _not_send: PhantomData,
            }
        }))
    }

    /// Returns a mutable reference to the underlying data; the mutable
    /// borrow statically guarantees no holds exist.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// The number of read holds currently outstanding.
    #[must_use]
    pub fn reader_count(&self) -> u32 {
        RwState::from_bits(self.sync.state().get()).get(RwState::READERS)
    }

    /// Whether a writer currently holds the lock.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        RwState::from_bits(self.sync.state().get()).get(RwState::WRITER_HOLDS) != 0
    }

    /// The calling thread's write recursion depth (0 if it is not the
    /// writer).
    #[must_use]
    pub fn write_hold_count(&self) -> u32 {
        if self.sync.is_held_exclusively() {
            RwState::from_bits(self.sync.state().get()).get(RwState::WRITER_HOLDS)
        } else {
            0
        }
    }

    /// Whether any thread is queued waiting for this lock.
    #[must_use]
    pub fn has_queued_threads(&self) -> bool {
        self.sync.has_queued_threads()
    }

    /// An estimate of the number of queued waiters.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        self.sync.queue_length()
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> RwLock<T> {
        RwLock::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("RwLock");
        match self.try_read() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish()
    }
}

// === impl RwLockReadGuard ===

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard proves a read hold, which excludes all mutable
        // access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.sync.release_shared(1);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLockReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

// === impl RwLockWriteGuard ===

impl<'a, T: ?Sized> RwLockWriteGuard<'a, T> {
    /// Atomically downgrades the write hold into a read hold, without
    /// letting another writer in between.
    pub fn downgrade(s: Self) -> RwLockReadGuard<'a, T> {
        let lock = s.lock;
        // Take the read hold while still the writer (the owner is always
        // admitted), then let the write hold go; the read hold keeps other
        // writers out for the whole window.
        lock.sync.acquire_shared(1);
        mem::forget(s);
        lock.sync.release(1);
        RwLockReadGuard {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard proves the write hold.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves the write hold, which is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.sync.release(1);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLockWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::thread;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::Instant;

    fn spin_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::yield_now();
        }
    }

    #[test]
    fn smoke() {
        let lock = RwLock::new(());
        drop(lock.read());
        drop(lock.write());
        drop((lock.read(), lock.read()));
        drop(lock.write());
    }

    #[test]
    fn writer_waits_for_every_reader() {
        let lock = Arc::new(RwLock::new(0u32));
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(lock.reader_count(), 2);

        let (tx, rx) = mpsc::channel();
        let writer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let mut guard = lock.write();
                *guard += 1;
                tx.send(()).unwrap();
            })
        };
        spin_until(|| lock.has_queued_threads());

        // One reader gone: the writer must still wait.
        drop(r2);
        assert_eq!(lock.reader_count(), 1);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        // Last reader gone: the writer gets in.
        drop(r1);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        writer.join().unwrap();

        assert_eq!(lock.reader_count(), 0);
        assert!(!lock.is_write_locked());
        assert_eq!(*lock.read(), 1);
    }

    #[test]
    fn readers_step_aside_for_a_queued_writer() {
        let lock = Arc::new(RwLock::new(()));
        let r1 = lock.read();

        let (wtx, wrx) = mpsc::channel();
        let writer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _guard = lock.write();
                wtx.send(()).unwrap();
            })
        };
        spin_until(|| lock.has_queued_threads());

        // A fresh reader may not barge past the queued writer.
        let (rtx, rrx) = mpsc::channel();
        let reader = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _guard = lock.read();
                rtx.send(()).unwrap();
            })
        };
        assert!(rrx.recv_timeout(Duration::from_millis(100)).is_err());

        drop(r1);
        // Writer first, then the reader.
        wrx.recv_timeout(Duration::from_secs(5)).unwrap();
        writer.join().unwrap();
        rrx.recv_timeout(Duration::from_secs(5)).unwrap();
        reader.join().unwrap();
    }

    #[test]
    fn try_variants_do_not_queue() {
        let lock = RwLock::new(());
        let read = lock.read();
        assert!(lock.try_write().is_none());
        assert!(lock.try_read().is_some());
        drop(read);

        let write = lock.write();
        assert!(lock.try_write().is_none());
        drop(write);

        assert_eq!(lock.queue_length(), 0);
    }

    #[test]
    fn timed_write_expires_under_readers() {
        let lock = Arc::new(RwLock::new(()));
        let read = lock.read();

        let elapsed = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let start = Instant::now();
                let outcome = lock.try_write_for(Duration::from_millis(10)).unwrap();
                assert!(outcome.is_none());
                start.elapsed()
            })
            .join()
            .unwrap()
        };
        assert!(elapsed >= Duration::from_millis(10));
        assert_eq!(lock.queue_length(), 0);
        drop(read);
    }

    #[test]
    fn downgrade_admits_no_writer_in_between() {
        let lock = Arc::new(RwLock::new(0));

        let mut guard = lock.write();
        *guard = 1;

        let writer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let mut guard = lock.write();
                *guard = 2;
            })
        };
        spin_until(|| lock.has_queued_threads());

        let read = RwLockWriteGuard::downgrade(guard);
        // The competing writer cannot have gotten in: we still observe our
        // own write.
        assert_eq!(*read, 1);
        assert_eq!(lock.reader_count(), 1);
        assert!(!lock.is_write_locked());
        drop(read);

        writer.join().unwrap();
        assert_eq!(*lock.read(), 2);
    }

    #[test]
    fn writer_holds_recurse_at_the_protocol_level() {
        // The guard API forbids recursive write(), but the underlying
        // protocol counts holds; drive it directly.
        let lock = RwLock::new(());
        lock.sync.acquire(1);
        lock.sync.acquire(1);
        assert_eq!(lock.write_hold_count(), 2);
        assert!(!lock.sync.release(1));
        assert_eq!(lock.write_hold_count(), 1);
        assert!(lock.sync.release(1));
        assert!(!lock.is_write_locked());
    }

    #[test]
    #[should_panic(expected = "recursive write()")]
    fn recursive_write_guard_panics() {
        let lock = RwLock::new(());
        let _guard = lock.write();
        let _second = lock.write();
    }

    #[test]
    #[should_panic(expected = "reader count overflow")]
    fn reader_saturation_is_fatal() {
        let lock = RwLock::new(());
        // Forge a state word with the reader half saturated.
        lock.sync
            .state()
            .set(RwState::new().with(RwState::READERS, MAX_COUNT).0);
        let _ = lock.try_read();
    }

    #[test]
    fn fair_lock_admits_in_arrival_order() {
        let lock_fair = Arc::new(RwLock::new_fair(Vec::<&str>::new()));

        // Exercise the fair flavor end to end: writer queued first, reader
        // second, both behind the initial writer; they must finish in that
        // order.
        let first = lock_fair.write();

        let (tx, rx) = mpsc::channel();
        let writer = {
            let lock = Arc::clone(&lock_fair);
            let tx = tx.clone();
            thread::spawn(move || {
                lock.write().push("writer");
                tx.send("writer").unwrap();
            })
        };
        spin_until(|| lock_fair.queue_length() == 1);
        let reader = {
            let lock = Arc::clone(&lock_fair);
            thread::spawn(move || {
                let guard = lock.read();
                assert_eq!(*guard, ["writer"]);
                tx.send("reader").unwrap();
            })
        };
        spin_until(|| lock_fair.queue_length() == 2);

        drop(first);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "writer");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "reader");
        writer.join().unwrap();
        reader.join().unwrap();
    }
}
