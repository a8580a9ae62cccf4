use bitfield::{bitfield, BitMut, BitRange, BitRangeMut};
use bitflags::bitflags;
use core::ptr;

use crate::error::{KernelError, KernelResult, PageTableWalkError};
use crate::kalloc::FrameAllocator;
use crate::param::{PGROUNDDOWN, PGROUNDUP, MAX_VIRTUAL_ADDRESS, PAGE_SHIFT, PAGE_SIZE};

const PTES_PER_TABLE: usize = PAGE_SIZE / core::mem::size_of::<PageTableEntry>();

bitflags! {
    /// Permission and status bits in the low byte of a [`PageTableEntry`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

/// Index into the table at `level` for `virtual_address`
#[inline]
fn px(level: usize, virtual_address: usize) -> usize {
    (virtual_address >> (PAGE_SHIFT + 9 * level)) & 0x1FF
}

/// A full Page Table
pub struct PageTable<'a> {
    first_level: &'a mut [PageTableEntry],
    allocator: &'a dyn FrameAllocator,
}

impl<'a> PageTable<'a> {
    /// Creates an empty page table in a page from `allocator`
    /// # Errors
    /// `OutOfMemory` if no page is free
    pub fn new(allocator: &'a dyn FrameAllocator) -> KernelResult<Self> {
        let page = allocator.alloc_page().ok_or(KernelError::OutOfMemory)?;
        Ok(PageTable {
            first_level: unsafe { zeroed_table(page) },
            allocator,
        })
    }

    /// Physical address of the first level table
    #[must_use]
    pub fn root(&self) -> usize {
        self.first_level.as_ptr() as usize
    }

    #[must_use]
    pub fn allocator(&self) -> &'a dyn FrameAllocator {
        self.allocator
    }

    /// The `satp` value selecting this table in Sv39 mode
    #[cfg(target_os = "none")]
    #[must_use]
    pub fn satp(&self) -> usize {
        (8 << 60) | (self.root() >> PAGE_SHIFT)
    }

    /// Sets this page table as the active table
    #[cfg(target_os = "none")]
    pub fn set_as_active_table(&self) {
        use riscv::register::satp;
        unsafe {
            core::arch::asm!("sfence.vma zero, zero");
            satp::set(satp::Mode::Sv39, 0, self.root() >> PAGE_SHIFT);
            core::arch::asm!("sfence.vma zero, zero");
        }
    }

    /// Finds the leaf slot for `virtual_address`, creating missing intermediate tables when `should_allocate`
    fn walk(
        &self,
        virtual_address: usize,
        should_allocate: bool,
    ) -> Result<*mut PageTableEntry, PageTableWalkError> {
        assert!(
            virtual_address < MAX_VIRTUAL_ADDRESS,
            "walk: {virtual_address:#x} beyond the virtual address ceiling"
        );

        let mut page_table = self.first_level.as_ptr().cast_mut();

        for level in (1..=2).rev() {
            let page_table_entry = unsafe { &mut *page_table.add(px(level, virtual_address)) };
            if page_table_entry.valid() {
                assert!(
                    !page_table_entry.is_leaf(),
                    "walk: unexpected superpage at {virtual_address:#x}"
                );
                page_table = page_table_entry.pa_mut::<PageTableEntry>().as_mut_ptr();
            } else if !should_allocate {
                return Err(PageTableWalkError::PageTableUnallocated);
            } else {
                let page = self
                    .allocator
                    .alloc_page()
                    .ok_or(PageTableWalkError::UnableToAllocate)?;
                page_table = unsafe { zeroed_table(page) }.as_mut_ptr();
                *page_table_entry = PageTableEntry::branch(page);
            }
        }

        Ok(unsafe { page_table.add(px(0, virtual_address)) })
    }

    /// The leaf slot for `virtual_address`, which may be invalid
    /// # Errors
    /// `PageTableUnallocated` if an intermediate table is missing and `should_allocate` is false,
    /// `UnableToAllocate` if a missing table could not be allocated
    /// # Panics
    /// Panics if `virtual_address` is beyond [`MAX_VIRTUAL_ADDRESS`]
    pub fn get_entry(
        &mut self,
        virtual_address: usize,
        should_allocate: bool,
    ) -> Result<&mut PageTableEntry, PageTableWalkError> {
        self.walk(virtual_address, should_allocate)
            .map(|entry| unsafe { &mut *entry })
    }

    pub fn walk_const<T>(
        &self,
        virtual_address: usize,
        pte_lookup: impl FnOnce(&PageTableEntry) -> T,
    ) -> Result<T, PageTableWalkError> {
        self.walk(virtual_address, false)
            .map(|entry| pte_lookup(unsafe { &*entry }))
    }

    /// The valid leaf mapping `virtual_address`, if any
    #[must_use]
    pub fn lookup(&self, virtual_address: usize) -> Option<PageTableEntry> {
        self.walk_const(virtual_address, |entry| *entry)
            .ok()
            .filter(PageTableEntry::valid)
    }

    /// Physical address behind a user-accessible `virtual_address`
    #[must_use]
    pub fn translate(&self, virtual_address: usize) -> Option<usize> {
        self.user_page(virtual_address)
            .ok()
            .map(|entry| entry.physical_address() + (virtual_address - PGROUNDDOWN!(virtual_address)))
    }

    fn user_page(&self, virtual_address: usize) -> KernelResult<PageTableEntry> {
        if virtual_address >= MAX_VIRTUAL_ADDRESS {
            return Err(KernelError::BadAddress);
        }
        self.lookup(PGROUNDDOWN!(virtual_address))
            .filter(|entry| entry.user_accessible() && entry.is_leaf())
            .ok_or(KernelError::BadAddress)
    }

    /// Maps `[virtual_base, virtual_base + region_size)` onto consecutive physical pages from `physical_base`.
    /// `virtual_base` and `region_size` need not be page aligned. Either every page gets mapped or none does.
    /// # Errors
    /// `OutOfMemory` if an intermediate table could not be allocated
    /// # Panics
    /// Panics on a zero size, permissions that would not form a leaf, or a page that is already mapped
    pub fn map_range(
        &mut self,
        virtual_base: usize,
        region_size: usize,
        physical_base: usize,
        permissions: PteFlags,
    ) -> KernelResult<()> {
        assert!(region_size != 0, "map_range: size");
        assert!(physical_base % PAGE_SIZE == 0, "map_range: unaligned physical address");
        assert!(
            permissions.intersects(PteFlags::R | PteFlags::W | PteFlags::X),
            "map_range: leaf without permissions"
        );

        let virtual_page_start = PGROUNDDOWN!(virtual_base);
        let virtual_page_end = PGROUNDDOWN!(virtual_base + region_size - 1);
        let mut mapped = 0;
        for virtual_addr in (virtual_page_start..=virtual_page_end).step_by(PAGE_SIZE) {
            match self.get_entry(virtual_addr, true) {
                Ok(pte) => {
                    assert!(!pte.valid(), "map_range: remap {virtual_addr:#x}");
                    *pte = PageTableEntry::leaf(
                        virtual_addr - virtual_page_start + physical_base,
                        permissions,
                    );
                    mapped += 1;
                }
                Err(error) => {
                    if mapped > 0 {
                        self.unmap_range(virtual_page_start, mapped, false);
                    }
                    return Err(error.into());
                }
            }
        }
        Ok(())
    }

    /// Removes `page_count` leaf mappings starting at the page-aligned `virtual_base`,
    /// returning the physical pages to the allocator when `reclaim` is set
    /// # Panics
    /// Panics if any page in the range is not a valid leaf
    pub fn unmap_range(&mut self, virtual_base: usize, page_count: usize, reclaim: bool) {
        assert!(virtual_base % PAGE_SIZE == 0, "unmap_range: not aligned");

        for virtual_addr in (virtual_base..virtual_base + page_count * PAGE_SIZE).step_by(PAGE_SIZE) {
            let Ok(pte) = self.get_entry(virtual_addr, false) else {
                panic!("unmap_range: no table for {virtual_addr:#x}");
            };
            assert!(pte.valid(), "unmap_range: {virtual_addr:#x} not mapped");
            assert!(pte.is_leaf(), "unmap_range: {virtual_addr:#x} not a leaf");
            let physical_address = pte.physical_address();
            *pte = PageTableEntry(0);
            if reclaim {
                self.allocator.free_page(physical_address);
            }
        }
    }

    /// Rewrites the permissions of `page_count` mapped pages from `virtual_base`.
    /// Nothing changes unless every page is a valid leaf.
    /// # Errors
    /// `BadAddress` if a page in the range is not mapped
    pub fn protect(
        &mut self,
        virtual_base: usize,
        page_count: usize,
        permissions: PteFlags,
    ) -> KernelResult<()> {
        assert!(
            permissions.intersects(PteFlags::R | PteFlags::W | PteFlags::X),
            "protect: leaf without permissions"
        );
        let pages = (virtual_base..virtual_base + page_count * PAGE_SIZE).step_by(PAGE_SIZE);
        if pages.clone().any(|virtual_addr| {
            virtual_addr >= MAX_VIRTUAL_ADDRESS
                || !self.lookup(virtual_addr).is_some_and(|entry| entry.is_leaf())
        }) {
            return Err(KernelError::BadAddress);
        }
        for virtual_addr in pages {
            if let Ok(pte) = self.get_entry(virtual_addr, false) {
                *pte = PageTableEntry::leaf(pte.physical_address(), permissions);
            }
        }
        Ok(())
    }

    /// Copies `source` to the user address `destination`
    /// # Errors
    /// `BadAddress` if a destination page is unmapped, not user accessible, or not writeable
    pub fn copy_out(&mut self, destination: usize, source: &[u8]) -> KernelResult<()> {
        let mut copied = 0;
        while copied < source.len() {
            let virtual_addr = destination.checked_add(copied).ok_or(KernelError::BadAddress)?;
            let entry = self.user_page(virtual_addr)?;
            if !entry.writeable() {
                return Err(KernelError::BadAddress);
            }
            let offset = virtual_addr - PGROUNDDOWN!(virtual_addr);
            let length = core::cmp::min(PAGE_SIZE - offset, source.len() - copied);
            unsafe {
                ptr::copy_nonoverlapping(
                    source[copied..].as_ptr(),
                    (entry.physical_address() + offset) as *mut u8,
                    length,
                );
            }
            copied += length;
        }
        Ok(())
    }

    /// Fills `destination` from the user address `source`
    /// # Errors
    /// `BadAddress` if a source page is unmapped or not user accessible
    pub fn copy_in(&self, destination: &mut [u8], source: usize) -> KernelResult<()> {
        let mut copied = 0;
        while copied < destination.len() {
            let virtual_addr = source.checked_add(copied).ok_or(KernelError::BadAddress)?;
            let entry = self.user_page(virtual_addr)?;
            let offset = virtual_addr - PGROUNDDOWN!(virtual_addr);
            let length = core::cmp::min(PAGE_SIZE - offset, destination.len() - copied);
            unsafe {
                ptr::copy_nonoverlapping(
                    (entry.physical_address() + offset) as *const u8,
                    destination[copied..].as_mut_ptr(),
                    length,
                );
            }
            copied += length;
        }
        Ok(())
    }

    /// Copies a NUL-terminated string from the user address `source` into `destination`, terminator included.
    /// Returns the string length without the terminator.
    /// # Errors
    /// `BadAddress` for an unmapped page, `InvalidArgument` if no terminator fits in `destination`
    pub fn copy_in_str(&self, destination: &mut [u8], source: usize) -> KernelResult<usize> {
        let mut copied = 0;
        while copied < destination.len() {
            let virtual_addr = source.checked_add(copied).ok_or(KernelError::BadAddress)?;
            let entry = self.user_page(virtual_addr)?;
            let offset = virtual_addr - PGROUNDDOWN!(virtual_addr);
            let length = core::cmp::min(PAGE_SIZE - offset, destination.len() - copied);
            let page = unsafe {
                core::slice::from_raw_parts((entry.physical_address() + offset) as *const u8, length)
            };
            for &byte in page {
                destination[copied] = byte;
                if byte == 0 {
                    return Ok(copied);
                }
                copied += 1;
            }
        }
        Err(KernelError::InvalidArgument)
    }

    /// Grows the user memory `[0, old_size)` to `new_size` with zeroed pages. On failure every page added by this
    /// call is removed again.
    /// # Errors
    /// `OutOfMemory` if a data page or table page could not be allocated
    pub fn grow(
        &mut self,
        old_size: usize,
        new_size: usize,
        permissions: PteFlags,
    ) -> KernelResult<usize> {
        if new_size <= old_size {
            return Ok(old_size);
        }

        let start = PGROUNDUP!(old_size);
        for virtual_addr in (start..new_size).step_by(PAGE_SIZE) {
            let Some(page) = self.allocator.alloc_page() else {
                self.shrink(virtual_addr, start);
                return Err(KernelError::OutOfMemory);
            };
            unsafe { ptr::write_bytes(page as *mut u8, 0, PAGE_SIZE) };
            if let Err(error) =
                self.map_range(virtual_addr, PAGE_SIZE, page, permissions | PteFlags::U)
            {
                self.allocator.free_page(page);
                self.shrink(virtual_addr, start);
                return Err(error);
            }
        }
        Ok(new_size)
    }

    /// Shrinks the user memory `[0, old_size)` to `new_size`, freeing whole pages that fall out of it
    pub fn shrink(&mut self, old_size: usize, new_size: usize) -> usize {
        if new_size >= old_size {
            return old_size;
        }

        let new_end = PGROUNDUP!(new_size);
        let old_end = PGROUNDUP!(old_size);
        if new_end < old_end {
            self.unmap_range(new_end, (old_end - new_end) / PAGE_SIZE, true);
        }
        new_size
    }

    /// Copies `[0, size)` and each `(start, page_count)` region into `target`, page by page into freshly allocated
    /// frames with the same permissions. On failure everything copied by this call is unmapped and freed.
    /// # Errors
    /// `OutOfMemory` if `target` could not get a page
    pub fn duplicate(
        &self,
        target: &mut PageTable<'_>,
        size: usize,
        regions: &[(usize, usize)],
    ) -> KernelResult<()> {
        let primary = (0, PGROUNDUP!(size) / PAGE_SIZE);
        let spans = core::iter::once(&primary).chain(regions);
        for (index, &(start, page_count)) in spans.clone().enumerate() {
            if let Err((copied, error)) = self.copy_pages(target, start, page_count) {
                if copied > 0 {
                    target.unmap_range(start, copied, true);
                }
                for &(start, page_count) in spans.take(index) {
                    if page_count > 0 {
                        target.unmap_range(start, page_count, true);
                    }
                }
                return Err(error);
            }
        }
        Ok(())
    }

    /// Copies `page_count` pages from `start`, reporting how many made it across on failure
    fn copy_pages(
        &self,
        target: &mut PageTable<'_>,
        start: usize,
        page_count: usize,
    ) -> Result<(), (usize, KernelError)> {
        for index in 0..page_count {
            let virtual_addr = start + index * PAGE_SIZE;
            let Some(entry) = self.lookup(virtual_addr).filter(PageTableEntry::is_leaf) else {
                panic!("duplicate: {virtual_addr:#x} not mapped");
            };
            let page = target
                .allocator
                .alloc_page()
                .ok_or((index, KernelError::OutOfMemory))?;
            unsafe {
                ptr::copy_nonoverlapping(
                    entry.physical_address() as *const u8,
                    page as *mut u8,
                    PAGE_SIZE,
                );
            }
            if let Err(error) = target.map_range(virtual_addr, PAGE_SIZE, page, entry.permissions()) {
                target.allocator.free_page(page);
                return Err((index, error));
            }
        }
        Ok(())
    }

    /// Frees every table page, children before parents. All leaves must already be unmapped.
    /// # Panics
    /// Panics if a leaf mapping is left
    pub fn free_table(self) {
        let PageTable {
            first_level,
            allocator,
        } = self;
        free_level(allocator, first_level.as_mut_ptr());
    }
}

fn free_level(allocator: &dyn FrameAllocator, table: *mut PageTableEntry) {
    for index in 0..PTES_PER_TABLE {
        let pte = unsafe { &mut *table.add(index) };
        if pte.valid() {
            assert!(!pte.is_leaf(), "free_table: leaf still mapped");
            free_level(allocator, pte.pa_mut::<PageTableEntry>().as_mut_ptr());
            *pte = PageTableEntry(0);
        }
    }
    allocator.free_page(table as usize);
}

/// Zeroes the page at `physical_address` and views it as a table
/// # Safety
/// The page must be an unused, kernel-addressable page
unsafe fn zeroed_table<'t>(physical_address: usize) -> &'t mut [PageTableEntry] {
    unsafe {
        ptr::write_bytes(physical_address as *mut u8, 0, PAGE_SIZE);
        core::slice::from_raw_parts_mut(physical_address as *mut PageTableEntry, PTES_PER_TABLE)
    }
}

#[cfg(target_os = "none")]
pub static KERNEL_PAGE_TABLE: spin::once::Once<PageTable<'static>> = spin::once::Once::new();

/// Builds the kernel page table: the kernel image and RAM mapped at their physical addresses, the trampoline at
/// the top of the address space, and a kernel stack for every process slot
/// # Errors
/// `OutOfMemory` if the table or a stack page could not be allocated
#[cfg(target_os = "none")]
pub fn kvmmake(allocator: &'static dyn FrameAllocator) -> KernelResult<()> {
    use crate::param::{kstack, KSTACK_PAGES, NPROC, TRAMPOLINE};

    let mut page_table = PageTable::new(allocator)?;
    let text_start = crate::_start as *const () as usize;
    let text_end = crate::etext as *const () as usize;

    page_table.map_range(text_start, text_end - text_start, text_start, PteFlags::R | PteFlags::X)?;
    page_table.map_range(
        text_end,
        crate::dev::spec::get_physical_memory_size() - text_end,
        text_end,
        PteFlags::R | PteFlags::W,
    )?;
    page_table.map_range(
        TRAMPOLINE,
        PAGE_SIZE,
        crate::trampoline as *const () as usize,
        PteFlags::R | PteFlags::X,
    )?;

    for slot in 0..NPROC {
        for page_index in 0..KSTACK_PAGES {
            let page = allocator.alloc_page().ok_or(KernelError::OutOfMemory)?;
            page_table.map_range(
                kstack(slot) + page_index * PAGE_SIZE,
                PAGE_SIZE,
                page,
                PteFlags::R | PteFlags::W,
            )?;
        }
    }

    KERNEL_PAGE_TABLE.call_once(|| page_table);
    Ok(())
}

bitfield! {
    /// A wrapper around a Sv39 Page Table Entry
    #[derive(PartialEq, Eq, Copy, Clone)]
    #[repr(transparent)]
    pub struct PageTableEntry(u64);
    impl Debug;
    /// Find if the referenced page is valid
    pub valid, set_valid: 0;
    /// Can this page be read?
    pub readable, set_readable: 1;
    /// Can this page be written to?
    pub writeable, set_writeable: 2;
    /// Can memory in this page be executed?
    pub executable, set_executable: 3;
    /// Can user code access this page?
    pub user_accessible, set_user_accessible: 4;
    /// Is this mapping present in every address space?
    pub global, set_global: 5;
    /// Has this page been accessed since the last reset?
    /// Must be cleared by [`PageTableEntry::clear_accessed`]
    pub accessed, _: 6;
    /// Has this page been written since the last reset?
    /// Must be cleared by [`PageTableEntry::clear_dirty`]
    pub dirty, _: 7;
    /// Physical Page to map to
    pa, set_pa: 53, 10;
}

impl PageTableEntry {
    fn branch(physical_address: usize) -> Self {
        let mut entry = PageTableEntry(0);
        entry.set_mapping(physical_address);
        entry.set_valid(true);
        entry
    }

    fn leaf(physical_address: usize, permissions: PteFlags) -> Self {
        let mut entry = PageTableEntry(0);
        entry.set_mapping(physical_address);
        entry.set_flags(permissions | PteFlags::V);
        entry
    }

    /// A valid entry with none of R/W/X points at the next level table
    #[must_use]
    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn is_leaf(&self) -> bool {
        self.readable() || self.writeable() || self.executable()
    }

    /// Clear the accessed bit on the Page Table Entry
    /// Cannot set this bit, only read and clear
    pub fn clear_accessed(&mut self) {
        self.0.set_bit(6, false);
    }

    /// Clear the dirty bit on the Page Table Entry
    /// Cannot set this bit, only read and clear
    pub fn clear_dirty(&mut self) {
        self.0.set_bit(7, false);
    }

    /// The physical address this PTE points to
    #[must_use]
    #[allow(clippy::trivially_copy_pass_by_ref, clippy::cast_possible_truncation)]
    pub fn physical_address(&self) -> usize {
        (self.pa() << PAGE_SHIFT) as usize
    }

    /// Map this PTE to a physical address as a mutable slice
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    fn pa_mut<T>(&self) -> &mut [T] {
        unsafe {
            core::slice::from_raw_parts_mut(
                self.physical_address() as *mut T,
                PAGE_SIZE / core::mem::size_of::<T>(),
            )
        }
    }

    /// Set the physical address this PTE points to
    pub fn set_mapping(&mut self, physical_address: usize) {
        self.set_pa(physical_address as u64 >> PAGE_SHIFT);
    }

    /// Get the flag bits in this PTE
    #[must_use]
    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn get_flags(&self) -> PteFlags {
        let bits: u8 = self.bit_range(7, 0);
        PteFlags::from_bits_truncate(bits)
    }

    pub fn set_flags(&mut self, flags: PteFlags) {
        self.set_bit_range(7, 0, flags.bits());
    }

    /// The access permissions of a leaf, without the status bits
    #[must_use]
    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn permissions(&self) -> PteFlags {
        self.get_flags() & (PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U | PteFlags::G)
    }
}

impl From<PageTableEntry> for u64 {
    fn from(value: PageTableEntry) -> Self {
        value.0
    }
}

impl From<u64> for PageTableEntry {
    fn from(value: u64) -> Self {
        PageTableEntry(value)
    }
}
