// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::stack::{MIN_STACK_SIZE, Stack, StackPointer};
use core::fmt;
use std::io;
use std::ptr;

/// An anonymous memory mapping used as a task stack.
///
/// The lowest page of the mapping is left inaccessible so that running off the end of the stack
/// faults instead of silently corrupting whatever is mapped below it.
pub struct TaskStack {
    top: StackPointer,
    mmap_len: usize,
}

impl TaskStack {
    /// Creates a new stack which has at least the given usable size.
    ///
    /// Sizes below [`MIN_STACK_SIZE`] are rounded up to it.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the address space could not be reserved or made accessible.
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(MIN_STACK_SIZE);

        // Round up to a page boundary and add one guard page below.
        let page_size = page_size();
        let mmap_len = size
            .checked_add(page_size + page_size - 1)
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?
            & !(page_size - 1);

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        // Safety: anonymous mapping at an address of the kernel's choosing, no aliasing possible
        let mmap = unsafe { libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0) };
        if mmap == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let Some(top) = StackPointer::new(mmap as usize + mmap_len) else {
            return Err(io::Error::from(io::ErrorKind::OutOfMemory));
        };

        // Constructed before mprotect so that a failure below unmaps the region again.
        let out = Self { top, mmap_len };

        let usable = mmap_len - page_size;
        // Safety: the range lies entirely within the mapping created above
        let ret = unsafe {
            libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(out)
    }

    /// Returns the number of bytes usable by code running on this stack.
    pub fn usable_size(&self) -> usize {
        self.mmap_len - page_size()
    }
}

impl Drop for TaskStack {
    fn drop(&mut self) {
        let mmap = self.top.get() - self.mmap_len;
        // Safety: we own this mapping and nothing executes on it anymore (ensured by whoever owns us)
        let ret = unsafe { libc::munmap(mmap as *mut libc::c_void, self.mmap_len) };
        debug_assert_eq!(ret, 0);
    }
}

impl fmt::Debug for TaskStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskStack")
            .field("top", &format_args!("{:#x}", self.top.get()))
            .field("bottom", &format_args!("{:#x}", self.bottom().get()))
            .finish()
    }
}

// Safety: the mapping stays in place until `drop`
unsafe impl Stack for TaskStack {
    fn top(&self) -> StackPointer {
        self.top
    }

    fn bottom(&self) -> StackPointer {
        // Safety: the guard page sits below this, so it can't be zero
        unsafe { StackPointer::new_unchecked(self.top.get() - self.usable_size()) }
    }
}

fn page_size() -> usize {
    // Safety: sysconf has no preconditions
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let pagesize = usize::try_from(pagesize).unwrap_or(4096);
    debug_assert!(pagesize.is_power_of_two());
    pagesize
}
