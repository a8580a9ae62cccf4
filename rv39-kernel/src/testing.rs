//! Fixtures shared by the unit tests: memory, booted kernels, and stand-ins for the file system.

use std::alloc::{alloc_zeroed, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::error::KernelResult;
use crate::file::{OpenFile, WorkingDir};
use crate::kalloc::{FrameAllocator, KernelPageAllocator};
use crate::param::PAGE_SIZE;
use crate::proc::Kernel;

/// An allocator over a leaked arena with exactly `usable` pages to hand out
pub(crate) fn page_allocator(usable: usize) -> &'static KernelPageAllocator<'static> {
    // one reference byte per page sits in front of the pages
    let page_count = usable + (usable + PAGE_SIZE) / PAGE_SIZE;
    let layout = Layout::from_size_align(page_count * PAGE_SIZE, PAGE_SIZE).unwrap();
    let start = unsafe { alloc_zeroed(layout) } as usize;
    assert!(start != 0, "arena allocation failed");
    let allocator: &'static KernelPageAllocator<'static> = Box::leak(Box::default());
    unsafe { allocator.free_range(start, start + page_count * PAGE_SIZE) };
    assert_eq!(allocator.free_count(), usable);
    allocator
}

/// A kernel over `pages` pages of memory, not yet running anything
pub(crate) fn kernel(pages: usize) -> &'static Kernel {
    let allocator = page_allocator(pages + 1);
    let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(allocator)));
    kernel.init(allocator.alloc_page().unwrap());
    kernel
}

/// A kernel with `init` as its first program, running on `harts` harts
pub(crate) fn boot(pages: usize, harts: usize, init: fn() -> i32) -> &'static Kernel {
    let kernel = kernel(pages);
    kernel.userinit(&[], init as *const () as usize).unwrap();
    kernel.start_harts(harts);
    kernel
}

/// Forks the running process into a child that runs `program`
pub(crate) fn spawn(kernel: &Kernel, program: fn() -> i32) -> KernelResult<usize> {
    let entry = unsafe { kernel.trapframe() }.epc;
    unsafe { kernel.trapframe() }.epc = program as *const () as usize;
    let forked = kernel.fork(None);
    unsafe { kernel.trapframe() }.epc = entry;
    forked
}

/// Keeps init reaping orphans once its test body is done
pub(crate) fn reap_forever(kernel: &Kernel) -> ! {
    loop {
        if kernel.wait(-1, None).is_err() {
            kernel.yield_now();
        }
    }
}

/// One-shot mailbox from a simulated program back to the test thread
pub(crate) struct Outcome<T> {
    value: Mutex<Option<T>>,
    posted: Condvar,
}

impl<T> Outcome<T> {
    pub(crate) const fn new() -> Self {
        Self {
            value: Mutex::new(None),
            posted: Condvar::new(),
        }
    }

    pub(crate) fn post(&self, value: T) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
        self.posted.notify_all();
    }

    /// Takes the posted value, failing the test if nothing arrives in time
    pub(crate) fn wait(&self) -> T {
        let (mut value, timeout) = self
            .posted
            .wait_timeout_while(
                self.value.lock().unwrap_or_else(PoisonError::into_inner),
                Duration::from_secs(20),
                |value| value.is_none(),
            )
            .unwrap_or_else(PoisonError::into_inner);
        assert!(!timeout.timed_out(), "no outcome posted");
        value.take().unwrap()
    }
}

/// In-memory file with a reference count
pub(crate) struct MockFile {
    contents: Vec<u8>,
    references: AtomicUsize,
}

impl MockFile {
    pub(crate) fn leak(contents: Vec<u8>) -> &'static MockFile {
        Box::leak(Box::new(Self {
            contents,
            references: AtomicUsize::new(1),
        }))
    }

    pub(crate) fn references(&self) -> usize {
        self.references.load(Ordering::SeqCst)
    }
}

impl OpenFile for MockFile {
    fn read_at(&self, buffer: &mut [u8], offset: usize) -> KernelResult<usize> {
        let available = self.contents.get(offset..).unwrap_or_default();
        let count = buffer.len().min(available.len());
        buffer[..count].copy_from_slice(&available[..count]);
        Ok(count)
    }

    fn dup(&self) {
        self.references.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        let previous = self.references.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "close: file already closed");
    }
}

pub(crate) struct MockDir {
    references: AtomicUsize,
}

impl MockDir {
    pub(crate) fn leak() -> &'static MockDir {
        Box::leak(Box::new(Self {
            references: AtomicUsize::new(1),
        }))
    }

    pub(crate) fn references(&self) -> usize {
        self.references.load(Ordering::SeqCst)
    }
}

impl WorkingDir for MockDir {
    fn dup(&self) {
        self.references.fetch_add(1, Ordering::SeqCst);
    }

    fn put(&self) {
        let previous = self.references.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "put: directory already released");
    }
}
