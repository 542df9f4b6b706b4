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
use core::ops::Deref;
use core::time::Duration;
use queued_sync::{
    Condition, ExclusiveProtocol, Interrupted, QueuedSync, SyncAccess, WaitError,
};
use std::sync::Arc;

/// Exclusive-mode policy: the state word is the hold count, the kernel's
/// owner token the holding thread.
pub(crate) struct ReentrantProtocol;

impl ExclusiveProtocol for ReentrantProtocol {
    fn try_acquire(&self, sync: &SyncAccess<'_>, arg: u32) -> bool {
        let me = parking::current().id();
        let holds = sync.state().get();
        if holds == 0 {
            if sync.state().compare_exchange(0, arg).is_ok() {
                sync.set_owner(Some(me));
                return true;
            }
            false
        } else if sync.owner() == Some(me) {
            // Only the owner writes while held, so a plain store is enough.
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

/// A mutex which can be recursively locked by the owning thread.
///
/// Unlike a plain mutex, the guard does *not* hand out mutable references:
/// with recursive locking a single thread can hold several guards at once,
/// so exclusive references would alias. Wrap the data in a
/// [`RefCell`](core::cell::RefCell) when mutation is needed.
///
/// Waiting/signalling is available through [`Condvar`]s minted by
/// [`new_condition`](ReentrantMutex::new_condition); a waiting thread
/// releases *all* of its recursive holds and gets the same count back when
/// it re-acquires.
pub struct ReentrantMutex<T> {
    pub(crate) sync: Arc<QueuedSync<ReentrantProtocol>>,
    data: UnsafeCell<T>,
}

// Safety: the lock hands out only shared references, to one thread at a
// time; `T` crosses threads between hand-offs, which `T: Send` covers.
unsafe impl<T: Send> Send for ReentrantMutex<T> {}
// Safety: as above; `&T` escapes only to the single holding thread.
unsafe impl<T: Send> Sync for ReentrantMutex<T> {}

/// RAII structure releasing one hold of a [`ReentrantMutex`] when dropped.
///
/// If the lock was acquired recursively it stays held until the last guard
/// is dropped.
#[clippy::has_significant_drop]
#[must_use = "if unused the ReentrantMutex will immediately unlock"]
pub struct ReentrantMutexGuard<'a, T> {
    mutex: &'a ReentrantMutex<T>,
    /// Holds are per-thread; the guard must be released where it was
    /// acquired.
    _not_send: PhantomData<*mut ()>,
}

// === impl ReentrantMutex ===

impl<T> ReentrantMutex<T> {
    /// Creates a new unlocked mutex.
    pub fn new(value: T) -> Self {
        Self {
            sync: Arc::new(QueuedSync::new(ReentrantProtocol)),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the mutex, blocking until it is available. May be called
    /// again by the owning thread without deadlocking.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, T> {
        self.sync.acquire(1);
        ReentrantMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire the mutex without blocking (barging ahead of any
    /// queued waiters).
    pub fn try_lock(&self) -> Option<ReentrantMutexGuard<'_, T>> {
        if self.sync.try_acquire_once(1) {
            Some(ReentrantMutexGuard {
                mutex: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    /// Acquires the mutex, aborting if the thread is interrupted first.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] (consuming the flag) instead of locking.
    pub fn lock_interruptibly(&self) -> Result<ReentrantMutexGuard<'_, T>, Interrupted> {
        self.sync.acquire_interruptibly(1)?;
        Ok(ReentrantMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }

    /// Creates a [`Condvar`] bound to this mutex.
    #[must_use]
    pub fn new_condition(&self) -> Condvar {
        Condvar {
            cond: self.sync.new_condition(),
        }
    }

    /// The owning thread's current recursion depth (0 when not held by the
    /// caller).
    #[must_use]
    pub fn hold_count(&self) -> u32 {
        if self.sync.is_held_exclusively() {
            self.sync.state().get()
        } else {
            0
        }
    }

    /// Whether the calling thread holds this mutex.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.sync.is_held_exclusively()
    }

    /// Returns a mutable reference to the underlying data; the mutable
    /// borrow statically guarantees no guards exist.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: fmt::Debug> fmt::Debug for ReentrantMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ReentrantMutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish()
    }
}

// === impl ReentrantMutexGuard ===

impl<T> Deref for ReentrantMutexGuard<'_, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard proves the calling thread holds the lock, so
        // shared access is confined to this thread.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> Drop for ReentrantMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.sync.release(1);
    }
}

impl<T: fmt::Debug> fmt::Debug for ReentrantMutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// A condition variable bound to one [`ReentrantMutex`].
///
/// All methods must be called while holding the originating mutex (the
/// guard-consuming signatures enforce the common case); using a guard from
/// an unrelated mutex panics before anything is released.
pub struct Condvar {
    cond: Condition<ReentrantProtocol>,
}

impl Condvar {
    fn check_guard<T>(&self, guard: &ReentrantMutexGuard<'_, T>) {
        assert!(
            self.cond.is_bound_to(&guard.mutex.sync),
            "condition used with a mutex it is not bound to"
        );
    }

    /// Releases the mutex (all recursive holds) and waits to be signalled,
    /// then re-acquires the same hold count and returns the guard.
    ///
    /// Interrupts are swallowed while waiting and re-asserted on the thread
    /// before returning.
    pub fn wait<'a, T>(&self, guard: ReentrantMutexGuard<'a, T>) -> ReentrantMutexGuard<'a, T> {
        self.check_guard(&guard);
        let mutex = guard.mutex;
        mem::forget(guard);
        self.cond
            .wait_uninterruptibly()
            .expect("guard proves the lock is held");
        ReentrantMutexGuard {
            mutex,
            _not_send: PhantomData,
        }
    }

    /// Like [`wait`](Self::wait), but aborts when the thread is
    /// interrupted. On interrupt the mutex is released before the error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`], consuming the flag.
    pub fn wait_interruptibly<'a, T>(
        &self,
        guard: ReentrantMutexGuard<'a, T>,
    ) -> Result<ReentrantMutexGuard<'a, T>, Interrupted> {
        self.check_guard(&guard);
        let mutex = guard.mutex;
        mem::forget(guard);
        match self.cond.wait() {
            Ok(()) => Ok(ReentrantMutexGuard {
                mutex,
                _not_send: PhantomData,
            }),
            Err(WaitError::Interrupted(err)) => {
                // The kernel re-acquired before reporting; hand the hold
                // back by dropping a reconstructed guard.
                drop(ReentrantMutexGuard {
                    mutex,
                    _not_send: PhantomData,
                });
                Err(err)
            }
            Err(WaitError::MonitorState(_)) => {
                unreachable!("guard proves the lock is held")
            }
        }
    }

    /// Waits with a timeout. The boolean is `true` if the wait timed out
    /// rather than being signalled. Interrupts are swallowed and
    /// re-asserted, and may cause an early (non-timed-out) return.
    pub fn wait_for<'a, T>(
        &self,
        guard: ReentrantMutexGuard<'a, T>,
        timeout: Duration,
    ) -> (ReentrantMutexGuard<'a, T>, bool) {
        self.check_guard(&guard);
        let mutex = guard.mutex;
        mem::forget(guard);
        let timed_out = match self.cond.wait_nanos(timeout) {
            Ok(remaining) => remaining <= 0,
            Err(WaitError::Interrupted(_)) => {
                parking::self_interrupt();
                false
            }
            Err(WaitError::MonitorState(_)) => {
                unreachable!("guard proves the lock is held")
            }
        };
        (
            ReentrantMutexGuard {
                mutex,
                _not_send: PhantomData,
            },
            timed_out,
        )
    }

    /// Wakes the longest-waiting thread, if any.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold the originating mutex.
    pub fn signal(&self) {
        self.cond
            .signal()
            .expect("signalling requires holding the mutex");
    }

    /// Wakes every waiting thread.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold the originating mutex.
    pub fn signal_all(&self) {
        self.cond
            .signal_all()
            .expect("signalling requires holding the mutex");
    }

    /// The number of threads waiting on this condition.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold the originating mutex.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.cond
            .wait_queue_length()
            .expect("inspecting waiters requires holding the mutex")
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar").finish_non_exhaustive()
    }
}
