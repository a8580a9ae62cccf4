use core::cell::UnsafeCell;

use crate::arch::{self, Context};
use crate::param::MAX_HART_COUNT;

/// Scheduler state of one hart
#[derive(Debug)]
pub struct Cpu {
    /// Slot of the process running here, if any
    pub(crate) proc: Option<usize>,
    /// `swtch` here to enter this hart's scheduler loop
    pub(crate) context: Context,
}

pub struct Cpus([UnsafeCell<Cpu>; MAX_HART_COUNT]);

// SAFETY: a hart only touches its own record
unsafe impl Sync for Cpus {}

impl Cpus {
    #[must_use]
    pub const fn new() -> Self {
        Self(
            [const {
                UnsafeCell::new(Cpu {
                    proc: None,
                    context: Context::new(),
                })
            }; MAX_HART_COUNT],
        )
    }

    /// This hart's record, or `None` on a thread that is not one of the kernel's harts.
    /// Interrupts must be off while the pointer is used, so the caller cannot move to another hart.
    pub(crate) fn mycpu(&self) -> Option<*mut Cpu> {
        self.0.get(arch::cpu_id()).map(UnsafeCell::get)
    }
}

impl Default for Cpus {
    fn default() -> Self {
        Self::new()
    }
}

/// Disables interrupts, remembering whether they were on before the outermost call.
/// `push_off` nests: it takes as many `pop_off`s to undo.
pub fn push_off() {
    let old = arch::intr_get();
    arch::intr_off();
    arch::with_nest(|nest| {
        if nest.depth == 0 {
            nest.enabled_before = old;
        }
        nest.depth += 1;
    });
}

/// Undoes one `push_off`, re-enabling interrupts when the outermost one is undone and they were on before it
/// # Panics
/// Panics if interrupts are on, or if there is no matching `push_off`
pub fn pop_off() {
    assert!(!arch::intr_get(), "pop_off - interruptible");
    let enable = arch::with_nest(|nest| {
        assert!(nest.depth >= 1, "pop_off");
        nest.depth -= 1;
        nest.depth == 0 && nest.enabled_before
    });
    if enable {
        arch::intr_on();
    }
}

/// Current `push_off` nesting depth of this hart
pub fn nesting_depth() -> usize {
    let old = arch::intr_get();
    arch::intr_off();
    let depth = arch::with_nest(|nest| nest.depth);
    if old {
        arch::intr_on();
    }
    depth
}
