// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::latch::Latch;
use crate::mutex::{Condvar, ReentrantMutex};
use core::cell::RefCell;
use core::fmt;
use core::mem;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::{trace, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Error returned by [`WorkerPool::submit`] after shutdown.
#[derive(Debug, Eq, PartialEq)]
pub struct PoolClosed(());

impl fmt::Display for PoolClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("worker pool is shut down")
    }
}

impl core::error::Error for PoolClosed {}

/// A fixed set of worker threads draining a bounded job queue.
///
/// [`submit`](WorkerPool::submit) blocks while the queue is full and
/// unblocks as workers drain it; workers sleep on a condition while the
/// queue is empty. [`shutdown`](WorkerPool::shutdown) stops intake, lets
/// the workers finish everything already queued, and joins them (a
/// countdown latch tracks the last worker out). Dropping the pool performs
/// the same shutdown.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

struct PoolShared {
    queue: ReentrantMutex<RefCell<PoolState>>,
    not_empty: Condvar,
    not_full: Condvar,
    exited: Latch,
    capacity: usize,
}

struct PoolState {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

// === impl WorkerPool ===

impl WorkerPool {
    /// Spawns `workers` threads servicing a queue of at most `capacity`
    /// pending jobs.
    ///
    /// # Panics
    ///
    /// Panics if either parameter is zero or a worker thread cannot be
    /// spawned.
    #[must_use]
    pub fn new(workers: usize, capacity: usize) -> Self {
        assert!(workers > 0, "pool needs at least one worker");
        assert!(capacity > 0, "pool needs a nonzero queue capacity");

        let queue = ReentrantMutex::new(RefCell::new(PoolState {
            jobs: VecDeque::with_capacity(capacity),
            shutdown: false,
        }));
        let not_empty = queue.new_condition();
        let not_full = queue.new_condition();
        let shared = Arc::new(PoolShared {
            queue,
            not_empty,
            not_full,
            exited: Latch::new(u32::try_from(workers).expect("worker count overflow")),
            capacity,
        });

        let workers = (0..workers)
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("pool-worker-{index}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn pool worker")
            })
            .collect();

        Self { shared, workers }
    }

    /// Enqueues a job, blocking while the queue is at capacity.
    ///
    /// # Errors
    ///
    /// Returns [`PoolClosed`] once [`shutdown`](WorkerPool::shutdown) has
    /// begun; the job is not run.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = self.shared.queue.lock();
        loop {
            {
                let state = guard.borrow();
                if state.shutdown {
                    return Err(PoolClosed(()));
                }
                if state.jobs.len() < self.shared.capacity {
                    break;
                }
            }
            guard = self.shared.not_full.wait(guard);
        }
        guard.borrow_mut().jobs.push_back(Box::new(job));
        trace!(queued = guard.borrow().jobs.len(), "job submitted");
        self.shared.not_empty.signal();
        Ok(())
    }

    /// The number of jobs waiting for a worker.
    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        self.shared.queue.lock().borrow().jobs.len()
    }

    /// Stops intake, drains the queue, and joins every worker.
    ///
    /// Jobs already queued still run; concurrent and later
    /// [`submit`](WorkerPool::submit) calls fail with [`PoolClosed`].
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        {
            let guard = self.shared.queue.lock();
            guard.borrow_mut().shutdown = true;
            self.shared.not_empty.signal_all();
            self.shared.not_full.signal_all();
        }
        trace!("pool shutting down");

        self.shared.exited.wait();
        for handle in mem::take(&mut self.workers) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

fn worker_loop(shared: &PoolShared) {
    trace!("worker started");
    loop {
        let mut guard = shared.queue.lock();
        let job = loop {
            // Drain before honoring shutdown, so queued work still runs.
            if let Some(job) = guard.borrow_mut().jobs.pop_front() {
                break Some(job);
            }
            if guard.borrow().shutdown {
                break None;
            }
            guard = shared.not_empty.wait(guard);
        };

        match job {
            Some(job) => {
                // Free a submitter's slot before running the job.
                shared.not_full.signal();
                drop(guard);
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    warn!("job panicked; worker continues");
                }
            }
            None => {
                drop(guard);
                break;
            }
        }
    }
    trace!("worker exiting");
    shared.exited.count_down();
}
