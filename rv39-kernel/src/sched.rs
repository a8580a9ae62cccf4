//! Per-hart scheduler loop and the switches into and out of it.

use core::ptr;
use core::sync::atomic::Ordering;

use crate::arch;
use crate::cpu::nesting_depth;
use crate::proc::{Kernel, ProcInner, ProcState};
use crate::spinlock::SpinlockGuard;
use crate::trap;

impl Kernel {
    /// Round-robins over the process table forever. Every hart ends up here after boot.
    pub fn scheduler(&self) -> ! {
        let cpu = self
            .cpus
            .mycpu()
            .unwrap_or_else(|| panic!("scheduler: hart {} out of range", arch::cpu_id()));
        unsafe { (*cpu).proc = None };

        loop {
            // let devices interrupt a hart that would otherwise never leave this loop
            arch::intr_on();
            if self.halted.load(Ordering::Acquire) {
                arch::halt();
            }

            let mut found = false;
            for (slot, p) in self.procs.iter().enumerate() {
                let mut inner = p.inner.lock();
                if inner.state != ProcState::Runnable {
                    continue;
                }
                // the process releases the row lock, and takes it again before coming back
                inner.state = ProcState::Running;
                unsafe {
                    (*cpu).proc = Some(slot);
                    arch::swtch(
                        ptr::addr_of_mut!((*cpu).context),
                        ptr::addr_of!((*p.data.get()).context),
                    );
                    (*cpu).proc = None;
                }
                found = true;
            }

            if !found {
                arch::wait_for_interrupt();
            }
        }
    }

    /// Switches from the process in `slot` to this hart's scheduler, returning the row lock once the process is
    /// picked again. The caller must hold only that lock and must already have moved the process out of
    /// `Running`.
    pub(crate) fn sched<'g>(
        &self,
        slot: usize,
        inner: SpinlockGuard<'g, ProcInner>,
    ) -> SpinlockGuard<'g, ProcInner> {
        assert!(SpinlockGuard::spinlock(&inner).holding(), "sched p->lock");
        assert!(nesting_depth() == 1, "sched locks");
        assert!(inner.state != ProcState::Running, "sched running");
        assert!(!arch::intr_get(), "sched interruptible");

        // interrupt state belongs to this kernel thread, not to the hart
        let enabled_before = arch::with_nest(|nest| nest.enabled_before);
        let cpu = self
            .cpus
            .mycpu()
            .unwrap_or_else(|| panic!("sched: not on a hart"));
        unsafe {
            arch::swtch(
                ptr::addr_of_mut!((*self.procs[slot].data.get()).context),
                ptr::addr_of!((*cpu).context),
            );
        }
        arch::with_nest(|nest| nest.enabled_before = enabled_before);
        inner
    }

    /// Gives up the hart for one scheduling round
    pub fn yield_now(&self) {
        let slot = self.current_slot("yield");
        let mut inner = self.procs[slot].inner.lock();
        inner.state = ProcState::Runnable;
        drop(self.sched(slot, inner));
    }

    /// Atomically releases `guard` and sleeps on `chan`, taking the lock again once woken.
    /// The process row stays locked from before the release until the switch, so a `wakeup` cannot slip in between.
    pub fn sleep<'g, T: ?Sized>(&self, chan: usize, guard: SpinlockGuard<'g, T>) -> SpinlockGuard<'g, T> {
        let slot = self.current_slot("sleep");
        let mut inner = self.procs[slot].inner.lock();
        let lock = SpinlockGuard::unlock(guard);

        inner.chan = chan;
        inner.state = ProcState::Sleeping;
        let mut inner = self.sched(slot, inner);
        inner.chan = 0;

        // row lock first, then the caller's lock
        drop(inner);
        lock.lock()
    }

    /// Makes every other process sleeping on `chan` runnable
    pub fn wakeup(&self, chan: usize) {
        let me = self.myslot();
        for (slot, p) in self.procs.iter().enumerate() {
            if Some(slot) == me {
                continue;
            }
            let mut inner = p.inner.lock();
            if inner.state == ProcState::Sleeping && inner.chan == chan {
                inner.state = ProcState::Runnable;
            }
        }
    }

    /// Stops every scheduler at its next pass
    pub fn shutdown(&self) {
        self.halted.store(true, Ordering::Release);
    }
}

/// First code a new process runs in the kernel, entered through the scheduler's `swtch`
pub(crate) extern "C" fn fork_ret() -> ! {
    let kernel = Kernel::current();
    let slot = kernel.current_slot("fork_ret");
    // the scheduler locked the row before switching here
    unsafe { kernel.procs[slot].inner.force_unlock() };
    trap::usertrapret(kernel)
}
