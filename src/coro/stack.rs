//! # Coroutine Stacks
//!
//! Each coroutine runs on its own mmapped stack. The region is anonymous
//! and page-aligned; the lowest page doubles as a guard page that is
//! `PROT_NONE` while the coroutine can run, so an overflow faults at a
//! recognizable address instead of silently corrupting the neighbor
//! allocation.
//!
//! Protection toggling is idempotent: free-listed coroutines drop the
//! guard (so the pool does not pin unreadable pages) and re-arm it on
//! reuse, and callers do not need to track whether the last toggle
//! already happened. A process-wide counter of actually issued `mprotect`
//! calls backs the idempotence test.
//!
//! `mmap`/`mprotect` failures are fatal. `ENOMEM` here almost always
//! means the process ran into the kernel's mapping-count limit, so the
//! message says which knob to turn.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::coro::context::{self, CoroContext};

static PROTECTION_SYSCALLS: AtomicU64 = AtomicU64::new(0);

pub fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

pub struct Stack {
    base: *mut u8,
    size: usize,
    protected: bool,
}

// The base pointer is uniquely owned by this Stack.
unsafe impl Send for Stack {}

impl Stack {
    /// Maps a fresh stack of `size` bytes (which must be a multiple of the
    /// page size). The guard page is not armed yet.
    pub fn new(size: usize) -> Stack {
        let page = page_size();
        // one page goes to the guard, so two is the absolute floor
        assert!(
            size >= 2 * page && size % page == 0,
            "stack size {} must be a multiple of the {} byte page size and span at least two pages",
            size,
            page,
        );

        // SAFETY: anonymous mapping, no file descriptor involved
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            fatal_map_error("mmap of coroutine stack");
        }

        // the pages are untouched; let the OS know it may reclaim them
        // until first use
        unsafe {
            libc::madvise(base, size, libc::MADV_DONTNEED);
        }

        Stack {
            base: base.cast(),
            size,
            protected: false,
        }
    }

    /// Arms the guard page. No-op (and no syscall) if already armed.
    pub fn enable_overflow_protection(&mut self) {
        if self.protected {
            return;
        }
        self.mprotect_guard(libc::PROT_NONE);
        self.protected = true;
    }

    /// Disarms the guard page so the lowest page is plain memory again.
    pub fn disable_overflow_protection(&mut self) {
        if !self.protected {
            return;
        }
        self.mprotect_guard(libc::PROT_READ | libc::PROT_WRITE);
        self.protected = false;
    }

    fn mprotect_guard(&mut self, prot: libc::c_int) {
        PROTECTION_SYSCALLS.fetch_add(1, Ordering::Relaxed);
        // SAFETY: the guard page lies inside our own mapping
        let rc = unsafe { libc::mprotect(self.base.cast(), page_size(), prot) };
        if rc != 0 {
            fatal_map_error("mprotect of coroutine stack guard page");
        }
    }

    /// Total number of protection syscalls issued process-wide.
    pub fn protection_syscalls() -> u64 {
        PROTECTION_SYSCALLS.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Highest address of the stack (exclusive); execution grows downward
    /// from here.
    pub fn top(&self) -> *mut u8 {
        // SAFETY: one-past-the-end of our own mapping
        unsafe { self.base.add(self.size) }
    }

    pub fn address_in_stack(&self, addr: *const u8) -> bool {
        if cfg!(feature = "threaded-coroutines")
            || !cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
        {
            // threaded fallback: execution is on an OS thread stack we do
            // not own, so be permissive
            return true;
        }
        addr >= self.base.cast_const() && addr < self.top().cast_const()
    }

    pub fn address_is_stack_overflow(&self, addr: *const u8) -> bool {
        if cfg!(feature = "threaded-coroutines")
            || !cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
        {
            return false;
        }
        let guard_end = unsafe { self.base.add(page_size()) };
        addr >= self.base.cast_const() && addr < guard_end.cast_const()
    }

    /// Usable bytes between `addr` and the guard page. Saturates at zero
    /// for addresses outside the stack; the threaded fallback reports
    /// unlimited headroom.
    pub fn free_space_below(&self, addr: *const u8) -> usize {
        if cfg!(feature = "threaded-coroutines")
            || !cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
        {
            return usize::MAX;
        }
        if !self.address_in_stack(addr) {
            return 0;
        }
        let usable_base = self.base as usize + page_size();
        (addr as usize).saturating_sub(usable_base)
    }

    /// Builds the initial call frame so that resuming the returned context
    /// starts executing `entry` on this stack.
    pub fn init_frame(&mut self, entry: extern "C" fn() -> !) -> CoroContext {
        context::init_frame(self.top(), entry)
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: unmapping the region this Stack owns
        unsafe {
            libc::munmap(self.base.cast(), self.size);
        }
    }
}

fn fatal_map_error(what: &str) -> ! {
    let errno = std::io::Error::last_os_error();
    if errno.raw_os_error() == Some(libc::ENOMEM) {
        panic!(
            "{} failed with ENOMEM; the process likely hit the kernel mapping \
             limit — raise vm.max_map_count (sysctl) or lower the worker and \
             coroutine pool sizes",
            what
        );
    }
    panic!("{} failed: {}", what, errno);
}
