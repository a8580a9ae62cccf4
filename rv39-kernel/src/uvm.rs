//! User address spaces: the contiguous `[0, size)` region, the trampoline and trapframe pages at the top, and the
//! separately mapped mmap regions in between.

use bitflags::bitflags;
use core::ptr;
use log::trace;

use crate::error::{KernelError, KernelResult};
use crate::file::OpenFile;
use crate::kalloc::FrameAllocator;
use crate::param::{
    PGROUNDUP, N_VM_REGION, PAGE_SIZE, TRAMPOLINE, TRAPFRAME, VM_MMAP_END, VM_MMAP_START,
};
use crate::spinlock::Spinlock;
use crate::vm::{PageTable, PteFlags};

bitflags! {
    /// `prot` argument of mmap and mprotect
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: usize {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

bitflags! {
    /// `flags` argument of mmap
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: usize {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
        const FIXED = 0x10;
        const ANONYMOUS = 0x20;
    }
}

impl Prot {
    /// Leaf permissions for a user page with this protection. `PROT_NONE` keeps the page mapped but out of
    /// reach of user mode.
    fn user_permissions(self) -> PteFlags {
        if self.is_empty() {
            return PteFlags::R;
        }
        let mut permissions = PteFlags::U;
        permissions.set(PteFlags::R, self.contains(Prot::READ));
        permissions.set(PteFlags::W, self.contains(Prot::WRITE));
        permissions.set(PteFlags::X, self.contains(Prot::EXEC));
        // write-only is not expressible in Sv39
        if permissions.contains(PteFlags::W) {
            permissions |= PteFlags::R;
        }
        permissions
    }
}

/// Whole pages covering `length` bytes, never fewer than one. `None` when rounding up overflows.
fn pages_for(length: usize) -> Option<usize> {
    let pages = length.checked_add(PAGE_SIZE - 1)? / PAGE_SIZE;
    Some(core::cmp::max(pages, 1))
}

/// One mmap allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmRegion {
    pub start: usize,
    pub page_count: usize,
    pub flags: MapFlags,
    /// Next region of the same address space, as a pool index
    next: Option<usize>,
}

impl VmRegion {
    #[must_use]
    pub fn end(&self) -> usize {
        self.start + self.page_count * PAGE_SIZE
    }
}

/// Fixed pool of region descriptors shared by every address space
pub struct RegionPool {
    slots: Spinlock<[Option<VmRegion>; N_VM_REGION]>,
}

impl RegionPool {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Spinlock::new("vm_region", [None; N_VM_REGION]),
        }
    }

    fn allocate(&self, region: VmRegion) -> KernelResult<usize> {
        let mut slots = self.slots.lock();
        let index = slots
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::NoFreeRegion)?;
        slots[index] = Some(region);
        Ok(index)
    }

    fn release(&self, index: usize) {
        let mut slots = self.slots.lock();
        assert!(slots[index].is_some(), "release: vm region {index} not in use");
        slots[index] = None;
    }

    fn get(&self, index: usize) -> VmRegion {
        self.slots.lock()[index].unwrap_or_else(|| panic!("vm region {index} not in use"))
    }

    fn set_next(&self, index: usize, next: Option<usize>) {
        if let Some(region) = self.slots.lock()[index].as_mut() {
            region.next = next;
        }
    }

    /// Descriptors currently handed out
    pub fn in_use(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for RegionPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Regions of an address space, walked through the pool
struct Regions<'p> {
    pool: &'p RegionPool,
    next: Option<usize>,
}

impl Iterator for Regions<'_> {
    type Item = (usize, VmRegion);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next?;
        let region = self.pool.get(index);
        self.next = region.next;
        Some((index, region))
    }
}

/// Memory of one process, owned by its process slot
pub struct AddressSpace<'a> {
    table: PageTable<'a>,
    size: usize,
    /// Where the next mmap region starts. Only ever moves up.
    mmap_cursor: usize,
    regions: Option<usize>,
}

impl<'a> AddressSpace<'a> {
    /// An empty user address space with `trampoline` and the private `trapframe` page mapped at the top
    /// # Errors
    /// `OutOfMemory` if the page table could not be built
    pub fn new(
        allocator: &'a dyn FrameAllocator,
        trampoline: usize,
        trapframe: usize,
    ) -> KernelResult<Self> {
        let mut table = PageTable::new(allocator)?;
        if let Err(error) =
            table.map_range(TRAMPOLINE, PAGE_SIZE, trampoline, PteFlags::R | PteFlags::X)
        {
            table.free_table();
            return Err(error);
        }
        if let Err(error) =
            table.map_range(TRAPFRAME, PAGE_SIZE, trapframe, PteFlags::R | PteFlags::W)
        {
            table.unmap_range(TRAMPOLINE, 1, false);
            table.free_table();
            return Err(error);
        }
        Ok(Self {
            table,
            size: 0,
            mmap_cursor: VM_MMAP_START,
            regions: None,
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn table(&self) -> &PageTable<'a> {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut PageTable<'a> {
        &mut self.table
    }

    fn regions<'p>(&self, pool: &'p RegionPool) -> Regions<'p> {
        Regions {
            pool,
            next: self.regions,
        }
    }

    /// Loads the first program at address 0, followed by one page of stack
    /// # Errors
    /// `OutOfMemory`, leaving the address space empty
    pub fn load_image(&mut self, image: &[u8]) -> KernelResult<()> {
        assert!(self.size == 0, "load_image: address space in use");
        let code_size = PGROUNDUP!(image.len());
        if code_size > 0 {
            self.table.grow(0, code_size, PteFlags::R | PteFlags::W | PteFlags::X)?;
            if let Err(error) = self.table.copy_out(0, image) {
                self.table.shrink(code_size, 0);
                return Err(error);
            }
        }
        let size = code_size + PAGE_SIZE;
        if let Err(error) = self.table.grow(code_size, size, PteFlags::R | PteFlags::W) {
            self.table.shrink(code_size, 0);
            return Err(error);
        }
        self.size = size;
        Ok(())
    }

    /// Moves the end of `[0, size)` by `delta` bytes, returning the new size
    /// # Errors
    /// `OutOfMemory` if growth would run out of pages or into the mmap window, `InvalidArgument` when shrinking
    /// below zero
    pub fn grow(&mut self, delta: isize) -> KernelResult<usize> {
        let size = self
            .size
            .checked_add_signed(delta)
            .ok_or(KernelError::InvalidArgument)?;
        if delta > 0 {
            if size > VM_MMAP_START {
                return Err(KernelError::OutOfMemory);
            }
            self.size = self.table.grow(self.size, size, PteFlags::R | PteFlags::W)?;
        } else {
            self.size = self.table.shrink(self.size, size);
        }
        Ok(self.size)
    }

    /// Maps a new region of `length` bytes (at least one page) at the next unused address of the mmap window,
    /// zero filled or loaded from `file` starting at `offset`. Returns its start address.
    /// # Errors
    /// `InvalidArgument` for an empty `prot` or `MAP_FIXED`, `BadFileDescriptor` for a file mapping without a
    /// file, `NoFreeRegion` if the pool or the window is exhausted, `OutOfMemory`, or a read failure. Nothing is
    /// left mapped on failure.
    pub fn mmap(
        &mut self,
        pool: &RegionPool,
        length: usize,
        prot: Prot,
        flags: MapFlags,
        file: Option<(&dyn OpenFile, usize)>,
    ) -> KernelResult<usize> {
        if prot.is_empty() || flags.contains(MapFlags::FIXED) {
            return Err(KernelError::InvalidArgument);
        }
        let file = if flags.contains(MapFlags::ANONYMOUS) {
            None
        } else {
            Some(file.ok_or(KernelError::BadFileDescriptor)?)
        };

        let page_count = pages_for(length).ok_or(KernelError::NoFreeRegion)?;
        let start = self.mmap_cursor;
        let end = page_count
            .checked_mul(PAGE_SIZE)
            .and_then(|bytes| start.checked_add(bytes))
            .filter(|&end| end <= VM_MMAP_END)
            .ok_or(KernelError::NoFreeRegion)?;

        let index = pool.allocate(VmRegion {
            start,
            page_count,
            flags,
            next: self.regions,
        })?;
        let permissions = prot.user_permissions();
        for page_index in 0..page_count {
            if let Err(error) = self.map_region_page(start, page_index, permissions, file) {
                if page_index > 0 {
                    self.table.unmap_range(start, page_index, true);
                }
                pool.release(index);
                return Err(error);
            }
        }

        self.regions = Some(index);
        self.mmap_cursor = end;
        trace!("mmap: {page_count} pages at {start:#x}");
        Ok(start)
    }

    fn map_region_page(
        &mut self,
        start: usize,
        page_index: usize,
        permissions: PteFlags,
        file: Option<(&dyn OpenFile, usize)>,
    ) -> KernelResult<()> {
        let file = match file {
            Some((file, offset)) => {
                let offset = page_index
                    .checked_mul(PAGE_SIZE)
                    .and_then(|skip| offset.checked_add(skip))
                    .ok_or(KernelError::InvalidArgument)?;
                Some((file, offset))
            }
            None => None,
        };
        let allocator = self.table.allocator();
        let page = allocator.alloc_page().ok_or(KernelError::OutOfMemory)?;
        unsafe { ptr::write_bytes(page as *mut u8, 0, PAGE_SIZE) };
        let result = match file {
            Some((file, offset)) => {
                let buffer = unsafe { core::slice::from_raw_parts_mut(page as *mut u8, PAGE_SIZE) };
                file.read_at(buffer, offset).map(|_| ())
            }
            None => Ok(()),
        }
        .and_then(|()| {
            self.table
                .map_range(start + page_index * PAGE_SIZE, PAGE_SIZE, page, permissions)
        });
        if result.is_err() {
            allocator.free_page(page);
        }
        result
    }

    /// Removes the region that starts at `start` and spans `length` bytes rounded up to whole pages
    /// # Errors
    /// `InvalidArgument` if no region matches exactly
    pub fn munmap(&mut self, pool: &RegionPool, start: usize, length: usize) -> KernelResult<()> {
        let page_count = pages_for(length).ok_or(KernelError::InvalidArgument)?;
        let mut previous = None;
        for (index, region) in self.regions(pool) {
            if region.start == start && region.page_count == page_count {
                match previous {
                    None => self.regions = region.next,
                    Some(previous) => pool.set_next(previous, region.next),
                }
                self.table.unmap_range(region.start, region.page_count, true);
                pool.release(index);
                return Ok(());
            }
            previous = Some(index);
        }
        Err(KernelError::InvalidArgument)
    }

    /// Changes the protection of the mapped pages covering `[start, start + length)`
    /// # Errors
    /// `InvalidArgument` for an unaligned start, `BadAddress` if a page is not mapped (nothing changes then)
    pub fn mprotect(&mut self, start: usize, length: usize, prot: Prot) -> KernelResult<()> {
        if start % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        if start.checked_add(length).map_or(true, |end| end > VM_MMAP_END) {
            return Err(KernelError::BadAddress);
        }
        let page_count = PGROUNDUP!(length) / PAGE_SIZE;
        self.table.protect(start, page_count, prot.user_permissions())
    }

    /// Deep copy into `target`, which must be freshly created. Region descriptors are copied too.
    /// # Errors
    /// `OutOfMemory` or `NoFreeRegion`, leaving `target` as it was
    pub fn duplicate(&self, pool: &RegionPool, target: &mut AddressSpace<'_>) -> KernelResult<()> {
        assert!(
            target.size == 0 && target.regions.is_none(),
            "duplicate: target in use"
        );
        let mut spans = [(0, 0); N_VM_REGION];
        let mut span_count = 0;
        for (_, region) in self.regions(pool) {
            spans[span_count] = (region.start, region.page_count);
            span_count += 1;
        }

        // descriptors first, they are the cheapest to give back
        let mut copied_regions = None;
        for (_, region) in self.regions(pool) {
            match pool.allocate(VmRegion {
                next: copied_regions,
                ..region
            }) {
                Ok(index) => copied_regions = Some(index),
                Err(error) => {
                    release_chain(pool, copied_regions);
                    return Err(error);
                }
            }
        }

        if let Err(error) = self
            .table
            .duplicate(&mut target.table, self.size, &spans[..span_count])
        {
            release_chain(pool, copied_regions);
            return Err(error);
        }

        target.size = self.size;
        target.mmap_cursor = self.mmap_cursor;
        target.regions = copied_regions;
        Ok(())
    }

    /// Frees every user page, region and table page. The trampoline and trapframe pages are not freed.
    pub fn free(mut self, pool: &RegionPool) {
        self.table.unmap_range(TRAMPOLINE, 1, false);
        self.table.unmap_range(TRAPFRAME, 1, false);
        let mut next = self.regions.take();
        while let Some(index) = next {
            let region = pool.get(index);
            self.table.unmap_range(region.start, region.page_count, true);
            pool.release(index);
            next = region.next;
        }
        self.table.shrink(self.size, 0);
        self.table.free_table();
    }
}

fn release_chain(pool: &RegionPool, mut next: Option<usize>) {
    while let Some(index) = next {
        next = pool.get(index).next;
        pool.release(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::KernelPageAllocator;
    use crate::testing::{page_allocator, MockFile};

    fn space(allocator: &'static KernelPageAllocator<'static>) -> AddressSpace<'static> {
        let trampoline = allocator.alloc_page().unwrap();
        let trapframe = allocator.alloc_page().unwrap();
        AddressSpace::new(allocator, trampoline, trapframe).unwrap()
    }

    fn read(space: &AddressSpace<'_>, start: usize, length: usize) -> Vec<u8> {
        let mut bytes = vec![0; length];
        space.table().copy_in(&mut bytes, start).unwrap();
        bytes
    }

    #[test]
    fn trampoline_and_trapframe_stay_out_of_user_reach() {
        let allocator = page_allocator(16);
        let space = space(allocator);
        let trampoline = space.table().lookup(TRAMPOLINE).unwrap();
        assert!(trampoline.readable() && trampoline.executable() && !trampoline.writeable());
        assert!(!trampoline.user_accessible());
        let trapframe = space.table().lookup(TRAPFRAME).unwrap();
        assert!(trapframe.writeable() && !trapframe.user_accessible());
        assert_eq!(space.size(), 0);
    }

    #[test]
    fn growth_stops_at_the_mmap_window() {
        let allocator = page_allocator(32);
        let pool = RegionPool::new();
        let mut space = space(allocator);
        assert_eq!(space.grow(3 * PAGE_SIZE as isize), Ok(3 * PAGE_SIZE));
        assert_eq!(space.grow(-(PAGE_SIZE as isize)), Ok(2 * PAGE_SIZE));
        assert_eq!(space.grow(-(3 * PAGE_SIZE as isize)), Err(KernelError::InvalidArgument));
        assert_eq!(space.grow(VM_MMAP_START as isize), Err(KernelError::OutOfMemory));
        assert_eq!(space.size(), 2 * PAGE_SIZE);
        let free_before_release = allocator.free_count();
        space.free(&pool);
        // the data pages and the five table pages come back; trampoline and trapframe are the caller's
        assert_eq!(allocator.free_count(), free_before_release + 2 + 5);
    }

    #[test]
    fn image_is_loaded_below_a_stack_page() {
        let allocator = page_allocator(16);
        let mut space = space(allocator);
        space.load_image(&[0x13, 0, 0, 0, 0x73, 0, 0, 0]).unwrap();
        assert_eq!(space.size(), 2 * PAGE_SIZE);
        assert_eq!(read(&space, 0, 8), vec![0x13, 0, 0, 0, 0x73, 0, 0, 0]);
        assert!(space.table().lookup(0).unwrap().executable());
        assert!(!space.table().lookup(PAGE_SIZE).unwrap().executable());
    }

    #[test]
    fn anonymous_regions_are_zeroed_and_never_reuse_addresses() {
        let allocator = page_allocator(32);
        let pool = RegionPool::new();
        let mut space = space(allocator);
        let first = space
            .mmap(&pool, 2 * PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::ANONYMOUS | MapFlags::PRIVATE, None)
            .unwrap();
        assert_eq!(first, VM_MMAP_START);
        assert_eq!(read(&space, first, 2 * PAGE_SIZE), vec![0; 2 * PAGE_SIZE]);
        space.table_mut().copy_out(first + 5, b"region").unwrap();

        let one_page = space
            .mmap(&pool, 0, Prot::READ, MapFlags::ANONYMOUS, None)
            .unwrap();
        assert_eq!(one_page, first + 2 * PAGE_SIZE);
        assert_eq!(pool.in_use(), 2);

        space.munmap(&pool, first, 2 * PAGE_SIZE).unwrap();
        assert!(space.table().lookup(first).is_none());
        assert_eq!(pool.in_use(), 1);
        let third = space
            .mmap(&pool, PAGE_SIZE, Prot::READ, MapFlags::ANONYMOUS, None)
            .unwrap();
        assert_eq!(third, one_page + PAGE_SIZE);
        space.free(&pool);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn file_regions_are_loaded_from_the_offset() {
        let allocator = page_allocator(32);
        let pool = RegionPool::new();
        let mut space = space(allocator);
        let contents: Vec<u8> = (0..PAGE_SIZE + 1000).map(|index| (index % 251) as u8 + 1).collect();
        let file: &dyn OpenFile = MockFile::leak(contents.clone());
        let start = space
            .mmap(&pool, 2 * PAGE_SIZE, Prot::READ, MapFlags::PRIVATE, Some((file, 100)))
            .unwrap();
        let mapped = read(&space, start, 2 * PAGE_SIZE);
        assert_eq!(&mapped[..PAGE_SIZE + 900], &contents[100..]);
        assert!(mapped[PAGE_SIZE + 900..].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn bad_mmap_requests_change_nothing() {
        let allocator = page_allocator(8);
        let pool = RegionPool::new();
        let mut space = space(allocator);
        assert_eq!(
            space.mmap(&pool, PAGE_SIZE, Prot::empty(), MapFlags::ANONYMOUS, None),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            space.mmap(&pool, PAGE_SIZE, Prot::READ, MapFlags::PRIVATE, None),
            Err(KernelError::BadFileDescriptor)
        );
        assert_eq!(
            space.mmap(&pool, PAGE_SIZE, Prot::READ, MapFlags::ANONYMOUS | MapFlags::FIXED, None),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            space.mmap(&pool, VM_MMAP_END, Prot::READ, MapFlags::ANONYMOUS, None),
            Err(KernelError::NoFreeRegion)
        );
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn mmap_rolls_back_when_memory_runs_out() {
        let allocator = page_allocator(16);
        let pool = RegionPool::new();
        let mut space = space(allocator);
        let free_before = allocator.free_count();
        assert_eq!(
            space.mmap(&pool, 64 * PAGE_SIZE, Prot::READ, MapFlags::ANONYMOUS, None),
            Err(KernelError::OutOfMemory)
        );
        assert_eq!(pool.in_use(), 0);
        assert!(space.table().lookup(VM_MMAP_START).is_none());
        // the table that now holds the window stays with the address space
        assert_eq!(allocator.free_count(), free_before - 1);
        let next = space
            .mmap(&pool, PAGE_SIZE, Prot::READ, MapFlags::ANONYMOUS, None)
            .unwrap();
        assert_eq!(next, VM_MMAP_START);
    }

    #[test]
    fn region_pool_exhaustion_is_reported() {
        let allocator = page_allocator(N_VM_REGION + 16);
        let pool = RegionPool::new();
        let mut space = space(allocator);
        for _ in 0..N_VM_REGION {
            space
                .mmap(&pool, PAGE_SIZE, Prot::READ, MapFlags::ANONYMOUS, None)
                .unwrap();
        }
        let free_before = allocator.free_count();
        assert_eq!(
            space.mmap(&pool, PAGE_SIZE, Prot::READ, MapFlags::ANONYMOUS, None),
            Err(KernelError::NoFreeRegion)
        );
        assert_eq!(allocator.free_count(), free_before);
    }

    #[test]
    fn munmap_needs_an_exact_match() {
        let allocator = page_allocator(16);
        let pool = RegionPool::new();
        let mut space = space(allocator);
        let start = space
            .mmap(&pool, 2 * PAGE_SIZE, Prot::READ, MapFlags::ANONYMOUS, None)
            .unwrap();
        assert_eq!(space.munmap(&pool, start, PAGE_SIZE), Err(KernelError::InvalidArgument));
        assert_eq!(space.munmap(&pool, start + PAGE_SIZE, PAGE_SIZE), Err(KernelError::InvalidArgument));
        assert_eq!(space.munmap(&pool, start, 2 * PAGE_SIZE - 1), Ok(()));
    }

    #[test]
    fn lengths_near_the_top_of_the_address_range_are_refused() {
        let allocator = page_allocator(16);
        let pool = RegionPool::new();
        let mut space = space(allocator);
        assert_eq!(
            space.mmap(&pool, usize::MAX, Prot::READ, MapFlags::ANONYMOUS, None),
            Err(KernelError::NoFreeRegion)
        );
        let file: &dyn OpenFile = MockFile::leak(vec![1; 16]);
        assert_eq!(
            space.mmap(&pool, 2 * PAGE_SIZE, Prot::READ, MapFlags::PRIVATE, Some((file, usize::MAX - 10))),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(pool.in_use(), 0);
        assert!(space.table().lookup(VM_MMAP_START).is_none());

        let start = space
            .mmap(&pool, PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::ANONYMOUS, None)
            .unwrap();
        assert_eq!(space.munmap(&pool, start, usize::MAX), Err(KernelError::InvalidArgument));
        assert_eq!(space.mprotect(start, usize::MAX, Prot::READ), Err(KernelError::BadAddress));
        assert!(space.table().lookup(start).unwrap().writeable());
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn mprotect_rewrites_region_permissions() {
        let allocator = page_allocator(16);
        let pool = RegionPool::new();
        let mut space = space(allocator);
        let start = space
            .mmap(&pool, 2 * PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::ANONYMOUS, None)
            .unwrap();
        space.mprotect(start, PAGE_SIZE, Prot::READ).unwrap();
        assert_eq!(space.table_mut().copy_out(start, &[1]), Err(KernelError::BadAddress));
        space.table_mut().copy_out(start + PAGE_SIZE, &[1]).unwrap();

        space.mprotect(start, 2 * PAGE_SIZE, Prot::empty()).unwrap();
        assert_eq!(space.table().translate(start + PAGE_SIZE), None);
        assert!(space.table().lookup(start + PAGE_SIZE).is_some());

        assert_eq!(space.mprotect(start + 1, PAGE_SIZE, Prot::READ), Err(KernelError::InvalidArgument));
        assert_eq!(
            space.mprotect(start, 3 * PAGE_SIZE, Prot::READ),
            Err(KernelError::BadAddress)
        );
    }

    #[test]
    fn duplicate_copies_regions_and_descriptors() {
        let allocator = page_allocator(64);
        let pool = RegionPool::new();
        let mut parent = space(allocator);
        parent.grow(PAGE_SIZE as isize).unwrap();
        parent.table_mut().copy_out(0, b"heap").unwrap();
        let region = parent
            .mmap(&pool, PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::ANONYMOUS, None)
            .unwrap();
        parent.table_mut().copy_out(region, b"mapped").unwrap();

        let mut child = space(allocator);
        parent.duplicate(&pool, &mut child).unwrap();
        assert_eq!(child.size(), PAGE_SIZE);
        assert_eq!(read(&child, 0, 4), b"heap".to_vec());
        assert_eq!(read(&child, region, 6), b"mapped".to_vec());
        assert_eq!(pool.in_use(), 2);

        parent.table_mut().copy_out(region, b"parent").unwrap();
        assert_eq!(read(&child, region, 6), b"mapped".to_vec());

        // each side unmaps its own region
        parent.munmap(&pool, region, PAGE_SIZE).unwrap();
        assert_eq!(read(&child, region, 6), b"mapped".to_vec());
        let next = child
            .mmap(&pool, PAGE_SIZE, Prot::READ, MapFlags::ANONYMOUS, None)
            .unwrap();
        assert_eq!(next, region + PAGE_SIZE);
        child.free(&pool);
        parent.free(&pool);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn duplicate_rolls_back_descriptors_when_memory_runs_out() {
        let parent_allocator = page_allocator(32);
        let pool = RegionPool::new();
        let mut parent = space(parent_allocator);
        parent.grow(2 * PAGE_SIZE as isize).unwrap();
        parent
            .mmap(&pool, 2 * PAGE_SIZE, Prot::READ, MapFlags::ANONYMOUS, None)
            .unwrap();

        let child_allocator = page_allocator(8);
        let mut child = space(child_allocator);
        let free_before = child_allocator.free_count();
        assert_eq!(parent.duplicate(&pool, &mut child), Err(KernelError::OutOfMemory));
        assert_eq!(pool.in_use(), 1);
        assert_eq!(child.size(), 0);
        assert!(child.table().lookup(0).is_none());
        assert!(child.table().lookup(VM_MMAP_START).is_none());
        assert!(child_allocator.free_count() <= free_before);
        let leftover = free_before - child_allocator.free_count();
        // only intermediate tables may stay behind, and they are released with the address space
        assert!(leftover <= 4);
        child.free(&pool);
    }
}
