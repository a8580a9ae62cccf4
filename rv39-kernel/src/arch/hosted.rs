//! Hosted stand-in for the hardware: every hart is an OS thread, and every kernel context that has ever run
//! owns a thread of its own ("strand"). A context switch hands the hart identity from the running strand to
//! the target strand and parks the caller until some hart hands it back.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

use super::InterruptNest;

/// Threads that never booted as a hart get ids from here, well clear of any real hart id
const BARE_HART_BASE: usize = 1 << 16;
static NEXT_BARE_HART: AtomicUsize = AtomicUsize::new(BARE_HART_BASE);

#[derive(Debug, Clone, Copy)]
struct Hart {
    id: usize,
    interrupts: bool,
    nest: InterruptNest,
    /// Address of the kernel this hart belongs to
    machine: usize,
}

impl Hart {
    fn bare() -> Self {
        Self {
            id: NEXT_BARE_HART.fetch_add(1, Ordering::Relaxed),
            interrupts: false,
            nest: InterruptNest::default(),
            machine: 0,
        }
    }
}

thread_local! {
    static HART: Cell<Option<Hart>> = const { Cell::new(None) };
}

fn current() -> Hart {
    HART.with(|slot| {
        slot.get().unwrap_or_else(|| {
            let hart = Hart::bare();
            slot.set(Some(hart));
            hart
        })
    })
}

fn install(hart: Hart) {
    HART.with(|slot| slot.set(Some(hart)));
}

fn update<R>(f: impl FnOnce(&mut Hart) -> R) -> R {
    let mut hart = current();
    let result = f(&mut hart);
    install(hart);
    result
}

#[inline]
pub fn cpu_id() -> usize {
    current().id
}

#[inline]
pub fn intr_get() -> bool {
    current().interrupts
}

#[inline]
pub fn intr_on() {
    update(|hart| hart.interrupts = true);
}

#[inline]
pub fn intr_off() {
    update(|hart| hart.interrupts = false);
}

/// Spin-wait hint. Simulated harts may outnumber host cores, so give the core away.
#[inline]
pub fn relax() {
    thread::yield_now();
}

pub fn wait_for_interrupt() {
    thread::sleep(Duration::from_micros(100));
}

pub fn halt() -> ! {
    loop {
        thread::park();
    }
}

/// Runs `f` on this hart's interrupt nesting record
pub fn with_nest<R>(f: impl FnOnce(&mut InterruptNest) -> R) -> R {
    update(|hart| f(&mut hart.nest))
}

/// Address of the kernel the running hart belongs to, 0 on a thread that is not a hart
#[inline]
pub fn machine() -> usize {
    current().machine
}

/// Boots hart `id` of the kernel at address `machine` on a new thread running `main`
/// # Panics
/// Panics if the host refuses to spawn the thread
pub fn start_hart(id: usize, machine: usize, main: fn() -> !) {
    thread::Builder::new()
        .name(format!("hart{id}"))
        .spawn(move || {
            install(Hart {
                id,
                interrupts: false,
                nest: InterruptNest::default(),
                machine,
            });
            main()
        })
        .expect("unable to spawn hart thread");
}

#[derive(Debug, Default)]
struct Strand {
    baton: Mutex<Option<Hart>>,
    turn: Condvar,
}

impl Strand {
    fn resume(&self, hart: Hart) {
        let mut baton = self.baton.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(baton.is_none(), "swtch: context resumed twice");
        *baton = Some(hart);
        self.turn.notify_one();
    }

    fn suspend(&self) -> Hart {
        let mut baton = self
            .turn
            .wait_while(
                self.baton.lock().unwrap_or_else(PoisonError::into_inner),
                |baton| baton.is_none(),
            )
            .unwrap_or_else(PoisonError::into_inner);
        baton.take().unwrap_or_else(|| unreachable!())
    }
}

/// Saved kernel context. `ra` is the entry point of a context that has not run yet.
#[derive(Debug, Default)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    strand: OnceLock<Arc<Strand>>,
}

impl Context {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            strand: OnceLock::new(),
        }
    }

    /// Arranges for the next switch into this context to start `entry` on a fresh stack
    pub fn prepare(&mut self, entry: usize, stack_top: usize) {
        *self = Self {
            ra: entry,
            sp: stack_top,
            strand: OnceLock::new(),
        };
    }
}

/// Saves the running context into `old` and resumes `new`, returning once something switches back to `old`
/// # Safety
/// Both pointers must be valid, and `new` must hold either a prepared entry point or a context saved by an
/// earlier `swtch`.
pub unsafe fn swtch(old: *mut Context, new: *const Context) {
    let (old, new) = unsafe { (&*old, &*new) };
    let mine = Arc::clone(old.strand.get_or_init(Arc::default));
    let next = match new.strand.get() {
        Some(strand) => Arc::clone(strand),
        None => spawn_strand(new),
    };
    next.resume(current());
    install(mine.suspend());
}

fn spawn_strand(context: &Context) -> Arc<Strand> {
    assert!(context.ra != 0, "swtch: context was never prepared");
    let strand = Arc::clone(context.strand.get_or_init(Arc::default));
    // SAFETY: `prepare` callers store the address of an `extern "C" fn() -> !`
    let entry = unsafe { core::mem::transmute::<usize, extern "C" fn() -> !>(context.ra) };
    let baton = Arc::clone(&strand);
    thread::Builder::new()
        .name("strand".into())
        .spawn(move || {
            install(baton.suspend());
            entry()
        })
        .expect("unable to spawn strand thread");
    strand
}
