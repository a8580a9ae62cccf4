//! Entry into the kernel from user mode and from supervisor-mode interrupts, and the way back out.

use crate::proc::Kernel;
use crate::syscall;

/// Per-process page holding the user registers while the process is in the kernel, plus what the trampoline
/// needs to get back into the kernel. Field offsets are shared with `trampoline.S`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TrapFrame {
    /*   0 */ pub kernel_satp: usize,
    /*   8 */ pub kernel_sp: usize,
    /*  16 */ pub kernel_trap: usize,
    /*  24 */ pub epc: usize,
    /*  32 */ pub kernel_hartid: usize,
    /*  40 */ pub ra: usize,
    /*  48 */ pub sp: usize,
    /*  56 */ pub gp: usize,
    /*  64 */ pub tp: usize,
    /*  72 */ pub t0: usize,
    /*  80 */ pub t1: usize,
    /*  88 */ pub t2: usize,
    /*  96 */ pub s0: usize,
    /* 104 */ pub s1: usize,
    /* 112 */ pub a0: usize,
    /* 120 */ pub a1: usize,
    /* 128 */ pub a2: usize,
    /* 136 */ pub a3: usize,
    /* 144 */ pub a4: usize,
    /* 152 */ pub a5: usize,
    /* 160 */ pub a6: usize,
    /* 168 */ pub a7: usize,
    /* 176 */ pub s2: usize,
    /* 184 */ pub s3: usize,
    /* 192 */ pub s4: usize,
    /* 200 */ pub s5: usize,
    /* 208 */ pub s6: usize,
    /* 216 */ pub s7: usize,
    /* 224 */ pub s8: usize,
    /* 232 */ pub s9: usize,
    /* 240 */ pub s10: usize,
    /* 248 */ pub s11: usize,
    /* 256 */ pub t3: usize,
    /* 264 */ pub t4: usize,
    /* 272 */ pub t5: usize,
    /* 280 */ pub t6: usize,
}

impl TrapFrame {
    /// System call arguments `a0`..`a5`
    #[must_use]
    pub fn args(&self) -> [usize; 6] {
        [self.a0, self.a1, self.a2, self.a3, self.a4, self.a5]
    }
}

/// Runs the system call in the trapframe. A killed process never gets back to user mode from here.
fn user_syscall(kernel: &Kernel) {
    if kernel.killed() {
        kernel.exit(-1);
    }
    syscall::syscall(kernel);
    if kernel.killed() {
        kernel.exit(-1);
    }
}

#[cfg(target_os = "none")]
pub use self::machine::{kerneltrap, trap_inithart, usertrap, usertrapret};

#[cfg(target_os = "none")]
mod machine {
    use core::arch::asm;
    use log::warn;
    use riscv::register::scause::{self, Exception, Interrupt, Trap};
    use riscv::register::sstatus::{self, SPP};
    use riscv::register::{satp, sepc, sie, stval, stvec, time};

    use super::user_syscall;
    use crate::arch;
    use crate::param::{KSTACK_PAGES, PAGE_SIZE, TIMER_INTERVAL, TRAMPOLINE};
    use crate::proc::Kernel;

    extern "C" {
        fn kernelvec();
        fn uservec();
        fn userret();
    }

    fn set_next_timer() {
        sbi_rt::set_timer(time::read64() + TIMER_INTERVAL);
    }

    /// Sends this hart's traps to `kernelvec` and starts its timer
    pub fn trap_inithart() {
        unsafe {
            stvec::write(kernelvec as *const () as usize, stvec::TrapMode::Direct);
            sie::set_stimer();
        }
        set_next_timer();
    }

    /// Address of a trampoline symbol in the page mapped at `TRAMPOLINE`
    fn trampoline_address(symbol: usize) -> usize {
        TRAMPOLINE + (symbol - crate::trampoline as *const () as usize)
    }

    /// Handles a trap from user mode, reached from `uservec`
    #[no_mangle]
    pub extern "C" fn usertrap() -> ! {
        assert!(
            sstatus::read().spp() == SPP::User,
            "usertrap: not from user mode"
        );
        unsafe { stvec::write(kernelvec as *const () as usize, stvec::TrapMode::Direct) };

        let kernel = Kernel::current();
        unsafe { kernel.trapframe() }.epc = sepc::read();
        match scause::read().cause() {
            Trap::Exception(Exception::UserEnvCall) => {
                unsafe { kernel.trapframe() }.epc += 4;
                arch::intr_on();
                user_syscall(kernel);
            }
            Trap::Interrupt(Interrupt::SupervisorTimer) => {
                set_next_timer();
                if kernel.killed() {
                    kernel.exit(-1);
                }
                kernel.yield_now();
            }
            cause => {
                warn!(
                    "usertrap: unexpected {cause:?} pid={} sepc={:#x} stval={:#x}",
                    kernel.mypid(),
                    sepc::read(),
                    stval::read()
                );
                kernel.set_killed();
            }
        }

        if kernel.killed() {
            kernel.exit(-1);
        }
        usertrapret(kernel)
    }

    /// Returns to user mode through `userret`, switching to the process's page table on the way
    pub fn usertrapret(kernel: &Kernel) -> ! {
        arch::intr_off();
        unsafe { stvec::write(trampoline_address(uservec as *const () as usize), stvec::TrapMode::Direct) };

        let data = unsafe { kernel.my_data() };
        let user_satp = data
            .aspace
            .as_ref()
            .map(|aspace| aspace.table().satp())
            .unwrap_or_else(|| panic!("usertrapret: no address space"));
        let tf = unsafe { kernel.trapframe() };
        tf.kernel_satp = satp::read().bits();
        tf.kernel_sp = data.kstack + KSTACK_PAGES * PAGE_SIZE;
        tf.kernel_trap = usertrap as *const () as usize;
        tf.kernel_hartid = arch::cpu_id();

        unsafe {
            sstatus::set_spp(SPP::User);
            sstatus::set_spie();
            sepc::write(tf.epc);
        }

        let userret: extern "C" fn(usize) -> ! =
            unsafe { core::mem::transmute(trampoline_address(userret as *const () as usize)) };
        userret(user_satp)
    }

    /// Interrupts and exceptions taken in supervisor mode, reached from `kernelvec` on the current kernel stack
    #[no_mangle]
    pub extern "C" fn kerneltrap() {
        let saved_sepc = sepc::read();
        let saved_sstatus = sstatus::read();
        assert!(
            saved_sstatus.spp() == SPP::Supervisor,
            "kerneltrap: not from supervisor mode"
        );
        assert!(!arch::intr_get(), "kerneltrap: interrupts enabled");

        match scause::read().cause() {
            Trap::Interrupt(Interrupt::SupervisorTimer) => {
                set_next_timer();
                let kernel = Kernel::current();
                if kernel.myproc().is_some() {
                    kernel.yield_now();
                }
            }
            cause => panic!(
                "kerneltrap: unexpected {cause:?} sepc={saved_sepc:#x} stval={:#x}",
                stval::read()
            ),
        }

        // yield may have taken other traps in between
        unsafe {
            sepc::write(saved_sepc);
            asm!("csrw sstatus, {}", in(reg) saved_sstatus.bits());
        }
    }
}

/// Starts, or resumes after `fork`, the program whose entry point is in `epc`. Its return value is its exit code.
#[cfg(not(target_os = "none"))]
pub fn usertrapret(kernel: &Kernel) -> ! {
    let entry = unsafe { kernel.trapframe() }.epc;
    assert!(entry != 0, "usertrapret: no program");
    // SAFETY: on the simulated machine `epc` always holds a `fn() -> i32`
    let program = unsafe { core::mem::transmute::<usize, fn() -> i32>(entry) };
    let code = program();
    if kernel.killed() {
        kernel.exit(-1);
    }
    kernel.exit(code)
}

/// A system call from the running program: `number` goes to `a7`, `args` to `a0`..`a5`, and the result comes
/// back from `a0`
#[cfg(not(target_os = "none"))]
pub fn ecall(kernel: &Kernel, number: usize, args: [usize; 6]) -> isize {
    {
        let tf = unsafe { kernel.trapframe() };
        tf.a7 = number;
        [tf.a0, tf.a1, tf.a2, tf.a3, tf.a4, tf.a5] = args;
    }
    user_syscall(kernel);
    unsafe { kernel.trapframe() }.a0 as isize
}
