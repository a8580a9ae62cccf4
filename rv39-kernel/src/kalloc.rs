use core::cell::Cell;
use core::ptr::{self, NonNull};
use log::debug;
use spin::mutex::Mutex;
use spin::once::Once;

use crate::param::{PGROUNDDOWN, PGROUNDUP, PAGE_SIZE};

/// Source of 4096-byte physical frames. Physical addresses are directly addressable by the kernel.
pub trait FrameAllocator: Sync {
    /// Takes a free page. Its contents are unspecified.
    fn alloc_page(&self) -> Option<usize>;

    /// Gives back a page obtained from [`FrameAllocator::alloc_page`]
    fn free_page(&self, physical_address: usize);
}

#[repr(C)]
struct Run {
    pub next: Cell<Option<NonNull<Run>>>,
}

/// Free-list page allocator threaded through the free pages themselves.
/// One byte per page at the head of the managed range records whether that page is handed out.
pub struct KernelPageAllocator<'a> {
    freelist: Mutex<Cell<Option<NonNull<Run>>>>,
    page_references: Mutex<Cell<Option<&'a mut [u8]>>>,
    /// First managed page and the end of the managed range
    bounds: Once<(usize, usize)>,
}

unsafe impl Sync for KernelPageAllocator<'_> {}
unsafe impl Send for KernelPageAllocator<'_> {}

#[cfg(target_os = "none")]
pub static KMEM: KernelPageAllocator<'static> = KernelPageAllocator::new();

impl<'a> KernelPageAllocator<'a> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            freelist: Mutex::new(Cell::new(None)),
            page_references: Mutex::new(Cell::new(None)),
            bounds: Once::new(),
        }
    }

    /// Hands every page of RAM between the end of the kernel image and the end of physical memory to the allocator
    #[cfg(target_os = "none")]
    pub fn init(&'static self) {
        let stop = crate::dev::spec::get_physical_memory_size();
        debug!("Initializing allocator from {:x} to {:x}", crate::end as *const () as usize, stop);
        unsafe { self.free_range(crate::end as *const () as usize, stop) };
    }

    /// Seeds the allocator with the memory in `[start, stop)`
    /// # Safety
    /// The range must be unused, writable memory that lives for `'a`, and this must be called only once.
    /// # Panics
    /// Panics if the allocator was already seeded
    pub unsafe fn free_range(&self, start: usize, stop: usize) {
        assert!(self.bounds.get().is_none(), "free_range: already initialized");
        let table = PGROUNDUP!(start);
        let page_count = (PGROUNDDOWN!(stop) - table) / PAGE_SIZE;
        // Every page starts out marked as handed out, so the loop below can free it
        unsafe {
            ptr::write_bytes(table as *mut u8, 1, page_count);
        }
        self.page_references
            .lock()
            .set(Some(unsafe { core::slice::from_raw_parts_mut(table as *mut u8, page_count) }));

        let first_page = PGROUNDUP!(table + page_count);
        let stop = PGROUNDDOWN!(stop);
        self.bounds.call_once(|| (first_page, stop));
        for page in (first_page..stop).step_by(PAGE_SIZE) {
            self.free_page(page);
        }
        debug!("Allocator holds {} pages", (stop - first_page) / PAGE_SIZE);
    }

    /// Pages currently on the free list
    pub fn free_count(&self) -> usize {
        let mut free_pages = 0usize;
        let freelist = self.freelist.lock();
        let mut optional_run_ref = freelist.get();
        while let Some(run) = optional_run_ref {
            free_pages += 1;
            optional_run_ref = unsafe { run.as_ref() }.next.get();
        }
        free_pages
    }

    fn set_reference(&self, physical_address: usize, expected: u8, value: u8) {
        let (first_page, _) = *self.bounds.get().expect("allocator used before free_range");
        let page_references = self.page_references.lock();
        let reference_data = page_references.take().expect("allocator used before free_range");
        let page_index = (physical_address - first_page) / PAGE_SIZE;
        let current = reference_data[page_index];
        reference_data[page_index] = value;
        page_references.set(Some(reference_data));
        assert!(
            current == expected,
            "kalloc: page {physical_address:#x} has {current} references, expected {expected}"
        );
    }
}

impl Default for KernelPageAllocator<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for KernelPageAllocator<'_> {
    fn alloc_page(&self) -> Option<usize> {
        let freelist = self.freelist.lock();
        let run = freelist.get()?;
        freelist.set(unsafe { run.as_ref() }.next.get());
        let page = run.as_ptr() as usize;
        self.set_reference(page, 0, 1);
        core::mem::drop(freelist);
        // Fill with junk so readers of uninitialized pages fail loudly
        unsafe { ptr::write_bytes(page as *mut u8, 5, PAGE_SIZE) };
        Some(page)
    }

    #[allow(clippy::cast_ptr_alignment)]
    fn free_page(&self, physical_address: usize) {
        let (first_page, stop) = *self.bounds.get().expect("free_page before free_range");
        if physical_address % PAGE_SIZE != 0 || physical_address < first_page || physical_address >= stop {
            panic!("free_page: {physical_address:#x} out of bounds");
        }

        let freelist = self.freelist.lock();
        self.set_reference(physical_address, 1, 0);
        unsafe { ptr::write_bytes(physical_address as *mut u8, 1, PAGE_SIZE) };
        let run = physical_address as *mut Run;
        unsafe {
            run.write(Run {
                next: Cell::new(freelist.get()),
            });
        }
        freelist.set(NonNull::new(run));
    }
}
