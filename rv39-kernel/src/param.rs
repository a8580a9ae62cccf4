//! Kernel parameters and the virtual memory layout shared by every address space.

/// Maximum number of process slots
pub const NPROC: usize = 64;
/// Open files per process
pub const NOFILE: usize = 16;
/// Harts the kernel keeps per-CPU state for; qemu `virt` tops out at 8
pub const MAX_HART_COUNT: usize = 8;
/// Descriptors in the shared mmap region pool
pub const N_VM_REGION: usize = 128;
/// Pages of kernel stack per process, each stack sits above one unmapped guard page
pub const KSTACK_PAGES: usize = 4;
/// Bytes reserved for a process name
pub const PROC_NAME_LEN: usize = 16;
/// Timer ticks between preemption interrupts (about 10ms on qemu)
pub const TIMER_INTERVAL: u64 = 100_000;
/// Boot stack per hart
pub const BOOT_STACK_SIZE: usize = 4 * PAGE_SIZE;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// One beyond the highest usable virtual address. SV39 allows 1 << 39, but xv6-style kernels stay
/// one bit short so addresses never need sign extension.
pub const MAX_VIRTUAL_ADDRESS: usize = 1 << (9 + 9 + 9 + 12 - 1);

/// The trampoline page, mapped at the same address in the kernel and in every user space
pub const TRAMPOLINE: usize = MAX_VIRTUAL_ADDRESS - PAGE_SIZE;
/// Each process' trapframe page, directly below the trampoline in user space
pub const TRAPFRAME: usize = TRAMPOLINE - PAGE_SIZE;

/// Start of the mmap window
pub const VM_MMAP_START: usize = TRAPFRAME - PAGE_SIZE * (4096 * 16 + 128);
/// End of the mmap window, leaving room below the trapframe
pub const VM_MMAP_END: usize = TRAPFRAME - PAGE_SIZE * 128;

/// Kernel stack of process slot `slot`, in the kernel page table below the trampoline
#[must_use]
pub const fn kstack(slot: usize) -> usize {
    TRAMPOLINE - (slot + 1) * (KSTACK_PAGES + 1) * PAGE_SIZE
}

macro_rules! PGROUNDUP {
    ($size:expr) => {
        (($size) + $crate::param::PAGE_SIZE - 1) & !($crate::param::PAGE_SIZE - 1)
    };
}

macro_rules! PGROUNDDOWN {
    ($address:expr) => {
        ($address) & !($crate::param::PAGE_SIZE - 1)
    };
}

pub(crate) use PGROUNDDOWN;
pub(crate) use PGROUNDUP;
