// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// Stack size used for tasks that don't ask for a specific one.
pub const DEFAULT_STACK_SIZE: usize = 32 * 1024;

/// Scheduler-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Usable stack size, in bytes, of tasks spawned without an explicit size.
    ///
    /// Sizes below [`strand_context::MIN_STACK_SIZE`] are rounded up when the stack is mapped.
    pub default_stack_size: usize,
}

impl Config {
    /// Override the default stack size.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    #[must_use]
    pub fn with_default_stack_size(mut self, size: usize) -> Self {
        assert!(size > 0, "stack size must be non-zero");
        self.default_stack_size = size;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_stack_size: DEFAULT_STACK_SIZE,
        }
    }
}
