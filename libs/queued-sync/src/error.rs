// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// The calling thread was interrupted while blocked.
///
/// Returned by the interruptible acquire and wait entry points. The thread's
/// interrupt flag has been consumed by the time this error is produced.
#[derive(Debug, Eq, PartialEq)]
pub struct Interrupted(pub(crate) ());

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("thread interrupted while waiting")
    }
}

impl core::error::Error for Interrupted {}

/// An owner-checked operation was attempted by a thread that does not hold
/// the synchronizer in exclusive mode.
#[derive(Debug, Eq, PartialEq)]
pub struct MonitorStateError(pub(crate) ());

impl fmt::Display for MonitorStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("synchronizer is not held in exclusive mode by the current thread")
    }
}

impl core::error::Error for MonitorStateError {}

/// Error returned by [`Condition`](crate::Condition) wait operations.
#[derive(Debug, Eq, PartialEq)]
pub enum WaitError {
    /// The waiting thread was interrupted before it was signalled.
    Interrupted(Interrupted),
    /// The wait was attempted without holding the synchronizer exclusively.
    MonitorState(MonitorStateError),
}

impl From<Interrupted> for WaitError {
    fn from(err: Interrupted) -> Self {
        WaitError::Interrupted(err)
    }
}

impl From<MonitorStateError> for WaitError {
    fn from(err: MonitorStateError) -> Self {
        WaitError::MonitorState(err)
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Interrupted(err) => err.fmt(f),
            WaitError::MonitorState(err) => err.fmt(f),
        }
    }
}

impl core::error::Error for WaitError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            WaitError::Interrupted(err) => Some(err),
            WaitError::MonitorState(err) => Some(err),
        }
    }
}
