//! The machine underneath the kernel: hart identity, interrupt enable, and the register-level context switch.
//!
//! On bare metal this is RISC-V supervisor mode. Everywhere else the same interface is simulated with one
//! OS thread per hart, so the scheduler and process code can be exercised by ordinary tests.

#[cfg(target_os = "none")]
mod riscv;
#[cfg(target_os = "none")]
pub use self::riscv::*;

#[cfg(not(target_os = "none"))]
mod hosted;
#[cfg(not(target_os = "none"))]
pub use self::hosted::*;

/// Interrupt-disable nesting of one hart, see [`crate::cpu::push_off`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterruptNest {
    pub depth: usize,
    /// Whether interrupts were on before the outermost `push_off`
    pub enabled_before: bool,
}
