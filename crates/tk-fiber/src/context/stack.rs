// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber stacks: anonymous mappings with a guard page at the low end.

use std::io;
use std::ptr::{self, NonNull};

#[cfg(any(target_os = "linux", target_os = "android"))]
const EXTRA_MAP_FLAGS: libc::c_int = libc::MAP_NORESERVE | libc::MAP_STACK;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const EXTRA_MAP_FLAGS: libc::c_int = 0;

/// An owned, page-aligned stack. Grows down from [`Stack::top`].
pub(crate) struct Stack {
    base: NonNull<u8>,
    len: usize,
}

impl Stack {
    /// Map `size` usable bytes (rounded up to whole pages) plus one
    /// inaccessible guard page below them.
    pub fn new(size: usize) -> io::Result<Self> {
        let page = page_size();
        let usable = size.div_ceil(page).max(1) * page;
        let len = usable + page;

        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | EXTRA_MAP_FLAGS;
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        if unsafe { libc::mprotect(ptr, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(ptr, len) };
            return Err(err);
        }

        let base = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "mmap returned a null stack")
        })?;
        Ok(Self { base, len })
    }

    /// One past the highest usable address.
    pub fn top(&self) -> usize {
        self.base.as_ptr() as usize + self.len
    }

    /// Usable bytes, guard page excluded.
    pub fn usable_size(&self) -> usize {
        self.len - page_size()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("top", &format_args!("{:#x}", self.top()))
            .field("usable", &self.usable_size())
            .finish()
    }
}

fn page_size() -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 {
        page as usize
    } else {
        4096
    }
}
