// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::io;
use strand_context::InitError;

pub use strand_context::SwapError;

/// Errors that can occur while creating a task.
///
/// In both cases nothing was enqueued and everything that had already been allocated for the task
/// has been released again, so the caller is free to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// The stack or the task control block could not be allocated.
    AllocationFailed,
    /// The initial execution state could not be laid out on the task stack.
    ContextInitFailed(InitError),
}

impl From<io::Error> for SpawnError {
    fn from(_: io::Error) -> Self {
        Self::AllocationFailed
    }
}

impl From<InitError> for SpawnError {
    fn from(err: InitError) -> Self {
        Self::ContextInitFailed(err)
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::AllocationFailed => f.write_str("memory allocation failed"),
            SpawnError::ContextInitFailed(_) => f.write_str("failed to initialize task context"),
        }
    }
}

impl core::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            SpawnError::AllocationFailed => None,
            SpawnError::ContextInitFailed(err) => Some(err),
        }
    }
}
