//! Long-term locks for processes. Waiters sleep instead of spinning, so the lock may be held across operations
//! that themselves sleep.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr;

use crate::proc::Kernel;
use crate::spinlock::Spinlock;

#[derive(Debug)]
struct Holder {
    locked: bool,
    /// Pid of the holding process
    pid: usize,
}

pub struct Sleeplock<T: ?Sized> {
    name: &'static str,
    holder: Spinlock<Holder>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for Sleeplock<T> {}
unsafe impl<T: ?Sized + Send> Send for Sleeplock<T> {}

impl<T> Sleeplock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            holder: Spinlock::new("sleep lock", Holder { locked: false, pid: 0 }),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Sleeplock<T> {
    fn chan(&self) -> usize {
        ptr::from_ref(self).cast::<u8>() as usize
    }

    /// Sleeps until the lock is free, then takes it for the running process
    /// # Panics
    /// Panics outside a process
    pub fn lock<'a>(&'a self, kernel: &'a Kernel) -> SleeplockGuard<'a, T> {
        let pid = kernel.mypid();
        let mut holder = self.holder.lock();
        while holder.locked {
            holder = kernel.sleep(self.chan(), holder);
        }
        holder.locked = true;
        holder.pid = pid;
        SleeplockGuard { lock: self, kernel }
    }

    /// Whether the running process holds the lock
    pub fn holding(&self, kernel: &Kernel) -> bool {
        let pid = kernel.mypid();
        let holder = self.holder.lock();
        holder.locked && holder.pid == pid
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn unlock(&self, kernel: &Kernel) {
        let mut holder = self.holder.lock();
        holder.locked = false;
        holder.pid = 0;
        kernel.wakeup(self.chan());
    }
}

impl<T: ?Sized> core::fmt::Debug for Sleeplock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Sleeplock")
            .field("name", &self.name)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

pub struct SleeplockGuard<'a, T: ?Sized> {
    lock: &'a Sleeplock<T>,
    kernel: &'a Kernel,
}

impl<T: ?Sized> Deref for SleeplockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SleeplockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SleeplockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock(self.kernel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::ProcState;
    use crate::testing::{boot, reap_forever, spawn, Outcome};

    #[test]
    fn holders_exclude_each_other_across_yields() {
        static COUNTER: Sleeplock<usize> = Sleeplock::new("counter", 0);
        static OUTCOME: Outcome<usize> = Outcome::new();

        fn incrementer() -> i32 {
            let kernel = Kernel::current();
            for _ in 0..20 {
                let mut counter = COUNTER.lock(kernel);
                let seen = *counter;
                kernel.yield_now();
                *counter = seen + 1;
            }
            0
        }

        fn init() -> i32 {
            let kernel = Kernel::current();
            for _ in 0..3 {
                spawn(kernel, incrementer).unwrap();
            }
            while kernel.wait(-1, None).is_ok() {}
            OUTCOME.post(*COUNTER.lock(kernel));
            reap_forever(kernel)
        }

        let kernel = boot(64, 2, init);
        assert_eq!(OUTCOME.wait(), 60);
        kernel.shutdown();
    }

    #[test]
    fn contended_waiter_sleeps() {
        static LOCK: Sleeplock<()> = Sleeplock::new("contended", ());
        static OUTCOME: Outcome<(bool, Option<ProcState>, i32)> = Outcome::new();

        fn waiter() -> i32 {
            let kernel = Kernel::current();
            let guard = LOCK.lock(kernel);
            let held = LOCK.holding(kernel);
            drop(guard);
            i32::from(held && !LOCK.holding(kernel))
        }

        fn init() -> i32 {
            let kernel = Kernel::current();
            let guard = LOCK.lock(kernel);
            let held = LOCK.holding(kernel);
            let pid = spawn(kernel, waiter).unwrap();
            let mut rounds = 0;
            while kernel.state_of(pid) != Some(ProcState::Sleeping) && rounds < 1000 {
                kernel.yield_now();
                rounds += 1;
            }
            let state = kernel.state_of(pid);
            drop(guard);
            kernel.wait(-1, Some(0)).unwrap();
            let mut status = [0; 4];
            kernel.copy_in(&mut status, 0).unwrap();
            OUTCOME.post((held, state, i32::from_ne_bytes(status) >> 8));
            reap_forever(kernel)
        }

        let kernel = boot(64, 1, init);
        let (held, state, code) = OUTCOME.wait();
        assert!(held);
        assert_eq!(state, Some(ProcState::Sleeping));
        assert_eq!(code, 1);
        kernel.shutdown();
    }
}
