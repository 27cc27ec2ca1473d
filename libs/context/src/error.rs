// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// The `InitError` error indicates that a stack could not be prepared for its first switch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InitError {
    /// The stack is too small to hold the initial register frame.
    TooSmall,
    /// The top of the stack is not aligned to [`STACK_ALIGNMENT`](crate::STACK_ALIGNMENT).
    Misaligned,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::TooSmall => f.write_str("stack is too small for the initial frame"),
            InitError::Misaligned => f.write_str("stack top is not properly aligned"),
        }
    }
}

impl core::error::Error for InitError {}

/// The `SwapError` error indicates that a [`swap`](crate::swap) was refused before any register
/// state was touched.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SwapError {
    /// The target context holds no saved state: it was never initialized, is currently executing,
    /// or has been cleared.
    NotSuspended,
    /// The source and target are the same context.
    SameContext,
}

impl fmt::Display for SwapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapError::NotSuspended => f.write_str("target context is not suspended"),
            SwapError::SameContext => f.write_str("cannot switch a context into itself"),
        }
    }
}

impl core::error::Error for SwapError {}
