use core::arch::{asm, global_asm};
use core::cell::UnsafeCell;

use riscv::register::sstatus;

use super::InterruptNest;
use crate::param::{MAX_HART_COUNT, TRAPFRAME};

global_asm!(include_str!("swtch.S"));
global_asm!(include_str!("kernelvec.S"));
global_asm!(include_str!("trampoline.S"), TRAPFRAME = const TRAPFRAME);

/// Hart id, kept in `tp` since boot
#[inline]
pub fn cpu_id() -> usize {
    let id: usize;
    unsafe { asm!("mv {0}, tp", out(reg) id) };
    id
}

#[inline]
pub fn intr_get() -> bool {
    sstatus::read().sie()
}

#[inline]
pub fn intr_on() {
    unsafe { sstatus::set_sie() };
}

#[inline]
pub fn intr_off() {
    unsafe { sstatus::clear_sie() };
}

#[inline]
pub fn relax() {
    core::hint::spin_loop();
}

#[inline]
pub fn wait_for_interrupt() {
    unsafe { asm!("wfi") };
}

/// Powers the machine off through the SBI firmware
pub fn halt() -> ! {
    sbi_rt::system_reset(sbi_rt::Shutdown, sbi_rt::NoReason);
    loop {
        wait_for_interrupt();
    }
}

struct HartNests([UnsafeCell<InterruptNest>; MAX_HART_COUNT]);

// SAFETY: each hart only touches its own record, and only with interrupts off
unsafe impl Sync for HartNests {}

static NESTS: HartNests = HartNests(
    [const {
        UnsafeCell::new(InterruptNest {
            depth: 0,
            enabled_before: false,
        })
    }; MAX_HART_COUNT],
);

/// Runs `f` on this hart's interrupt nesting record. Interrupts must be off.
pub fn with_nest<R>(f: impl FnOnce(&mut InterruptNest) -> R) -> R {
    debug_assert!(!intr_get(), "with_nest: interruptible");
    f(unsafe { &mut *NESTS.0[cpu_id()].get() })
}

/// Callee-saved registers of a suspended kernel thread, laid out for `swtch.S`
#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    s: [usize; 12],
}

impl Context {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s: [0; 12],
        }
    }

    /// Arranges for the next switch into this context to start `entry` on a fresh stack
    pub fn prepare(&mut self, entry: usize, stack_top: usize) {
        *self = Self {
            ra: entry,
            sp: stack_top,
            s: [0; 12],
        };
    }
}

extern "C" {
    #[link_name = "swtch"]
    fn swtch_registers(old: *mut Context, new: *const Context);
}

/// Saves the running context into `old` and resumes `new`, returning once something switches back to `old`
/// # Safety
/// Both pointers must be valid, and `new` must hold either a prepared entry point or a context saved by an
/// earlier `swtch`.
#[inline]
pub unsafe fn swtch(old: *mut Context, new: *const Context) {
    unsafe { swtch_registers(old, new) };
}
