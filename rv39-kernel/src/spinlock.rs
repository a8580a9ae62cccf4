//! Mutual exclusion that busy-waits, with interrupts held off on the owning hart for as long as the lock is held.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch;
use crate::cpu::{pop_off, push_off};

const NO_CPU: usize = usize::MAX;

pub struct Spinlock<T: ?Sized> {
    name: &'static str,
    locked: AtomicBool,
    /// Hart holding the lock
    cpu: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            cpu: AtomicUsize::new(NO_CPU),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Spinlock<T> {
    /// Spins until the lock is ours
    /// # Panics
    /// Panics if this hart already holds the lock
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        push_off();
        assert!(!self.holding(), "acquire {}", self.name);
        while self.locked.swap(true, Ordering::Acquire) {
            arch::relax();
        }
        self.cpu.store(arch::cpu_id(), Ordering::Relaxed);
        SpinlockGuard { lock: self }
    }

    /// Whether this hart holds the lock. Meaningful only with interrupts off.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu.load(Ordering::Relaxed) == arch::cpu_id()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Releases a lock whose guard was handed off across a context switch
    /// # Safety
    /// This hart must hold the lock, and no guard for it may be used afterwards.
    pub unsafe fn force_unlock(&self) {
        self.release();
    }

    /// Access without locking, for diagnostics that must not block
    /// # Safety
    /// The data may be changing underneath; only read fields that tolerate a torn view.
    pub unsafe fn get_unsynchronized(&self) -> &T {
        unsafe { &*self.data.get() }
    }

    fn release(&self) {
        assert!(self.holding(), "release {}", self.name);
        self.cpu.store(NO_CPU, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        pop_off();
    }
}

impl<T: ?Sized> core::fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Spinlock")
            .field("name", &self.name)
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

pub struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
}

impl<'a, T: ?Sized> SpinlockGuard<'a, T> {
    /// Releases the lock, handing back the lock itself so it can be taken again later
    pub fn unlock(guard: Self) -> &'a Spinlock<T> {
        let lock = guard.lock;
        drop(guard);
        lock
    }

    /// The lock this guard holds
    pub fn spinlock(guard: &Self) -> &'a Spinlock<T> {
        guard.lock
    }
}

impl<T: ?Sized> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::nesting_depth;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn guard_disables_interrupts_until_released() {
        thread::spawn(|| {
            let outer = Spinlock::new("outer", 0u32);
            let inner = Spinlock::new("inner", 0u32);
            arch::intr_on();
            let mut first = outer.lock();
            let mut second = inner.lock();
            *first += 1;
            *second += 1;
            assert!(!arch::intr_get());
            assert!(outer.holding() && inner.holding());
            assert_eq!(nesting_depth(), 2);
            drop(second);
            assert!(!arch::intr_get());
            drop(first);
            assert!(arch::intr_get());
            assert!(!outer.holding());
        })
        .join()
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "acquire twice")]
    fn reacquire_is_fatal() {
        let lock = Spinlock::new("twice", ());
        let _first = lock.lock();
        let _second = lock.lock();
    }

    #[test]
    #[should_panic(expected = "release idle")]
    fn releasing_an_unheld_lock_is_fatal() {
        let lock = Spinlock::new("idle", ());
        unsafe { lock.force_unlock() };
    }

    #[test]
    fn holding_is_per_hart() {
        let lock = Arc::new(Spinlock::new("shared", ()));
        let guard = lock.lock();
        let elsewhere = Arc::clone(&lock);
        assert!(!thread::spawn(move || elsewhere.holding()).join().unwrap());
        drop(guard);
    }

    #[test]
    fn counter_survives_contention() {
        let lock = Arc::new(Spinlock::new("counter", 0usize));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }

    #[test]
    fn unlock_hands_back_the_lock() {
        let lock = Spinlock::new("handoff", 1u8);
        let guard = lock.lock();
        let again = SpinlockGuard::unlock(guard);
        assert!(!again.holding());
        assert_eq!(*again.lock(), 1);
    }
}
