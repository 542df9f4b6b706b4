// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread parking, identity and interruption.
//!
//! This crate is the platform layer underneath the blocking synchronizers in
//! this workspace: a [`Thread`] handle that can be compared, unparked and
//! interrupted from other threads, plus the [`park`]/[`park_timeout`]
//! suspension primitives the synchronizers block on.
//!
//! Parking follows the usual one-permit protocol: [`Thread::unpark`] makes at
//! most one permit available, and [`park`] consumes it (returning immediately
//! if it was already available). [`park`] may also return spuriously, so
//! callers must re-check their wait condition in a loop.
//!
//! Interruption is cooperative. [`Thread::interrupt`] sets a per-thread flag
//! and wakes the target if it is parked; the target observes the flag through
//! [`interrupted`] (which clears it) or [`is_interrupted`] (which does not).
//! Nothing is ever forcibly cancelled.

use core::fmt;
use core::num::NonZeroU64;
use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use static_assertions::assert_impl_all;

/// A handle to a thread, usable for unparking and interrupting it.
///
/// Handles are cheap to clone and compare equal iff they refer to the same
/// thread. The underlying identity token ([`Thread::id`]) is unique among
/// live threads but is *not* human-readable, sequential, or stable across
/// runs.
#[derive(Clone)]
pub struct Thread {
    inner: Arc<Inner>,
}
assert_impl_all!(Thread: Send, Sync);

struct Inner {
    id: NonZeroU64,
    interrupted: AtomicBool,
    handle: thread::Thread,
}

// === impl Thread ===

impl Thread {
    /// An opaque token identifying this thread.
    #[inline]
    #[must_use]
    pub fn id(&self) -> NonZeroU64 {
        self.inner.id
    }

    /// Makes one park permit available to this thread, waking it if it is
    /// currently parked. Granting a permit that is already available has no
    /// effect.
    #[inline]
    pub fn unpark(&self) {
        self.inner.handle.unpark();
    }

    /// Sets this thread's interrupt flag and wakes it if it is parked.
    ///
    /// The flag stays set until the thread itself consumes it with
    /// [`interrupted`].
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
        self.inner.handle.unpark();
    }

    /// Reads this thread's interrupt flag without clearing it.
    #[inline]
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Thread {}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread").field("id", &self.inner.id).finish()
    }
}

std::thread_local! {
    static CURRENT: Thread = {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let id = NonZeroU64::new(NEXT_ID.fetch_add(1, Ordering::Relaxed))
            .expect("thread ID counter wrapped");
        Thread {
            inner: Arc::new(Inner {
                id,
                interrupted: AtomicBool::new(false),
                handle: thread::current(),
            }),
        }
    };
}

/// Returns a handle to the calling thread.
#[must_use]
pub fn current() -> Thread {
    CURRENT.with(Thread::clone)
}

/// Parks the calling thread until a permit becomes available.
///
/// Returns immediately if a permit is already available or the thread's
/// interrupt flag is set; otherwise blocks until [`Thread::unpark`],
/// [`Thread::interrupt`], or a spurious wakeup. The interrupt flag is *not*
/// cleared; callers that care must check [`interrupted`] afterwards.
pub fn park() {
    if is_interrupted() {
        return;
    }
    thread::park();
}

/// Parks the calling thread for at most `timeout`.
///
/// Same contract as [`park`], with an additional deadline. Callers cannot
/// tell from the return alone whether they were unparked, interrupted, timed
/// out, or woken spuriously.
pub fn park_timeout(timeout: Duration) {
    if is_interrupted() {
        return;
    }
    thread::park_timeout(timeout);
}

/// Parks the calling thread until `deadline` at the latest. Returns
/// immediately if the deadline has already passed; otherwise behaves like
/// [`park_timeout`].
pub fn park_until(deadline: std::time::Instant) {
    let now = std::time::Instant::now();
    if now < deadline {
        park_timeout(deadline - now);
    }
}

/// Consumes the calling thread's interrupt flag, returning whether it was
/// set.
#[must_use]
pub fn interrupted() -> bool {
    CURRENT.with(|t| t.inner.interrupted.swap(false, Ordering::SeqCst))
}

/// Reads the calling thread's interrupt flag without clearing it.
#[must_use]
pub fn is_interrupted() -> bool {
    CURRENT.with(|t| t.inner.interrupted.load(Ordering::SeqCst))
}

/// Re-asserts the calling thread's own interrupt flag.
///
/// Used by uninterruptible blocking operations to hand an interrupt that
/// arrived mid-wait back to the caller.
pub fn self_interrupt() {
    CURRENT.with(|t| t.inner.interrupted.store(true, Ordering::SeqCst));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn identity_is_stable_and_unique() {
        let me = current();
        assert_eq!(me, current());

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || tx.send(current()).unwrap())
            .join()
            .unwrap();
        let other = rx.recv().unwrap();
        assert_ne!(me, other);
        assert_ne!(me.id(), other.id());
    }

    #[test]
    fn unpark_before_park_is_not_lost() {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            tx.send(current()).unwrap();
            // Wait until the permit has definitely been granted, then park;
            // the stored permit must make this return immediately.
            thread::sleep(Duration::from_millis(50));
            park();
        });
        rx.recv().unwrap().unpark();
        handle.join().unwrap();
    }

    #[test]
    fn interrupt_wakes_a_parked_thread() {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            tx.send(current()).unwrap();
            while !is_interrupted() {
                park();
            }
            assert!(interrupted());
            // consumed exactly once
            assert!(!interrupted());
        });
        let target = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));
        target.interrupt();
        handle.join().unwrap();
    }

    #[test]
    fn park_timeout_expires() {
        // park_timeout may return spuriously, so drive it the way callers
        // must: in a deadline loop.
        let deadline = Instant::now() + Duration::from_millis(50);
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            park_timeout(deadline - now);
        }
    }

    #[test]
    fn park_returns_immediately_when_interrupted() {
        self_interrupt();
        let start = Instant::now();
        park_timeout(Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(interrupted());
    }
}
