use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::AtomicBool;
use log::{debug, info};
use spin::once::Once;

use crate::arch::Context;
use crate::cpu::{pop_off, push_off, Cpus};
use crate::error::{KernelError, KernelResult};
use crate::file::{DirRef, FileRef};
use crate::kalloc::FrameAllocator;
use crate::param::{kstack, KSTACK_PAGES, NOFILE, NPROC, PAGE_SIZE, PROC_NAME_LEN};
use crate::sched::fork_ret;
use crate::spinlock::{Spinlock, SpinlockGuard};
use crate::trap::TrapFrame;
use crate::uvm::{AddressSpace, MapFlags, Prot, RegionPool};

/// One row of the process table
pub(crate) struct Proc {
    /// Guards every state transition
    pub(crate) inner: Spinlock<ProcInner>,
    /// Touched only by the process itself, or by whoever holds the row while it is not running
    pub(crate) data: UnsafeCell<ProcData>,
}

// SAFETY: `data` follows the ownership rule above
unsafe impl Sync for Proc {}

#[derive(Debug, Default)]
pub(crate) struct ProcInner {
    pub(crate) state: ProcState,
    /// Sleeping on this channel when non-zero
    pub(crate) chan: usize,
    pub(crate) killed: bool,
    pub(crate) exit_code: i32,
    pub(crate) pid: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    #[default]
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

pub(crate) struct ProcData {
    pub(crate) kstack: usize,
    pub(crate) context: Context,
    /// Physical address of the trapframe page, 0 when the row is free
    trapframe: usize,
    pub(crate) aspace: Option<AddressSpace<'static>>,
    files: [Option<FileRef>; NOFILE],
    cwd: Option<DirRef>,
    name: [u8; PROC_NAME_LEN],
}

impl ProcInner {
    const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            chan: 0,
            killed: false,
            exit_code: 0,
            pid: 0,
        }
    }
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: 0,
            context: Context::new(),
            trapframe: 0,
            aspace: None,
            files: [None; NOFILE],
            cwd: None,
            name: [0; PROC_NAME_LEN],
        }
    }

    fn aspace_mut(&mut self) -> &mut AddressSpace<'static> {
        self.aspace
            .as_mut()
            .unwrap_or_else(|| panic!("process without an address space"))
    }

    fn set_name(&mut self, name: &str) {
        let length = core::cmp::min(name.len(), PROC_NAME_LEN - 1);
        self.name = [0; PROC_NAME_LEN];
        self.name[..length].copy_from_slice(&name.as_bytes()[..length]);
    }

    fn name(&self) -> &str {
        let length = self.name.iter().position(|&byte| byte == 0).unwrap_or(PROC_NAME_LEN);
        core::str::from_utf8(&self.name[..length]).unwrap_or("???")
    }
}

impl Proc {
    const fn new() -> Self {
        Self {
            inner: Spinlock::new("proc", ProcInner::new()),
            data: UnsafeCell::new(ProcData::new()),
        }
    }
}

/// Everything the process layer shares between harts
pub struct Kernel {
    pub(crate) allocator: &'static dyn FrameAllocator,
    pub(crate) procs: [Proc; NPROC],
    pub(crate) cpus: Cpus,
    /// Parent slot of every slot. Also serializes `exit` against `wait`, so a parent cannot miss a child's exit.
    parents: Spinlock<[Option<usize>; NPROC]>,
    next_pid: Spinlock<usize>,
    regions: RegionPool,
    /// Physical page holding the trampoline code
    trampoline: Once<usize>,
    /// Slot of the first process
    init: Once<usize>,
    pub(crate) halted: AtomicBool,
}

#[cfg(target_os = "none")]
pub static KERNEL: Kernel = Kernel::new(&crate::kalloc::KMEM);

impl Kernel {
    #[must_use]
    pub const fn new(allocator: &'static dyn FrameAllocator) -> Self {
        Self {
            allocator,
            procs: [const { Proc::new() }; NPROC],
            cpus: Cpus::new(),
            parents: Spinlock::new("wait_lock", [None; NPROC]),
            next_pid: Spinlock::new("nextpid", 1),
            regions: RegionPool::new(),
            trampoline: Once::new(),
            init: Once::new(),
            halted: AtomicBool::new(false),
        }
    }

    /// The kernel running on this hart
    #[cfg(target_os = "none")]
    #[must_use]
    pub fn current() -> &'static Kernel {
        &KERNEL
    }

    /// The kernel running on this hart
    /// # Panics
    /// Panics on a thread that is not one of a kernel's harts
    #[cfg(not(target_os = "none"))]
    #[must_use]
    pub fn current() -> &'static Kernel {
        let machine = crate::arch::machine();
        assert!(machine != 0, "no kernel on this hart");
        unsafe { &*(machine as *const Kernel) }
    }

    /// Records where the trampoline code lives. Must happen before the first process is created.
    pub fn init(&self, trampoline: usize) {
        self.trampoline.call_once(|| trampoline);
    }

    /// Boots `count` simulated harts, each running the scheduler
    /// # Panics
    /// Panics if `count` exceeds [`crate::param::MAX_HART_COUNT`]
    #[cfg(not(target_os = "none"))]
    pub fn start_harts(&'static self, count: usize) {
        fn hart_main() -> ! {
            Kernel::current().scheduler()
        }

        assert!(count <= crate::param::MAX_HART_COUNT, "start_harts: too many harts");
        for id in 0..count {
            crate::arch::start_hart(id, ptr::from_ref(self) as usize, hart_main);
        }
    }

    /// Slot of the process running on this hart
    pub(crate) fn myslot(&self) -> Option<usize> {
        push_off();
        let slot = self.cpus.mycpu().and_then(|cpu| unsafe { (*cpu).proc });
        pop_off();
        slot
    }

    pub(crate) fn myproc(&self) -> Option<&Proc> {
        self.myslot().map(|slot| &self.procs[slot])
    }

    pub(crate) fn current_slot(&self, operation: &str) -> usize {
        self.myslot()
            .unwrap_or_else(|| panic!("{operation}: no process"))
    }

    /// # Safety
    /// The caller must be the process in `slot`, or hold its row while it cannot run. No other reference into
    /// the data may be live.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data_of(&self, slot: usize) -> &mut ProcData {
        unsafe { &mut *self.procs[slot].data.get() }
    }

    /// Private data of the running process
    /// # Safety
    /// See [`Kernel::data_of`]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn my_data(&self) -> &mut ProcData {
        unsafe { self.data_of(self.current_slot("my_data")) }
    }

    /// Trapframe of the running process
    /// # Safety
    /// Only the running process may use it, through one reference at a time
    /// # Panics
    /// Panics if no process is running here
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn trapframe(&self) -> &mut TrapFrame {
        let trapframe = unsafe { self.my_data() }.trapframe;
        assert!(trapframe != 0, "trapframe: none");
        unsafe { &mut *(trapframe as *mut TrapFrame) }
    }

    /// Sleep channel of the process in `slot`
    pub(crate) fn chan_of(&self, slot: usize) -> usize {
        ptr::from_ref(&self.procs[slot]) as usize
    }

    fn alloc_pid(&self) -> usize {
        let mut next_pid = self.next_pid.lock();
        let pid = *next_pid;
        *next_pid += 1;
        pid
    }

    /// Claims an unused row, returning its slot still locked in state `Used`
    fn alloc_proc(&self) -> KernelResult<(usize, SpinlockGuard<'_, ProcInner>)> {
        let trampoline = *self
            .trampoline
            .get()
            .unwrap_or_else(|| panic!("alloc_proc: kernel not initialized"));
        for (slot, p) in self.procs.iter().enumerate() {
            let mut inner = p.inner.lock();
            if inner.state != ProcState::Unused {
                continue;
            }
            inner.pid = self.alloc_pid();
            inner.state = ProcState::Used;

            let data = unsafe { self.data_of(slot) };
            if let Err(error) = self.reserve(slot, data, trampoline) {
                self.free_proc(slot, &mut inner);
                return Err(error);
            }
            return Ok((slot, inner));
        }
        Err(KernelError::NoFreeProcess)
    }

    fn reserve(&self, slot: usize, data: &mut ProcData, trampoline: usize) -> KernelResult<()> {
        let trapframe = self.allocator.alloc_page().ok_or(KernelError::OutOfMemory)?;
        unsafe { ptr::write_bytes(trapframe as *mut u8, 0, PAGE_SIZE) };
        data.trapframe = trapframe;
        data.aspace = Some(AddressSpace::new(self.allocator, trampoline, trapframe)?);
        data.kstack = kstack(slot);
        data.context
            .prepare(fork_ret as *const () as usize, data.kstack + KSTACK_PAGES * PAGE_SIZE);
        Ok(())
    }

    /// Releases everything a row owns and marks it unused. The row must be locked and its process not running.
    fn free_proc(&self, slot: usize, inner: &mut ProcInner) {
        let data = unsafe { self.data_of(slot) };
        if let Some(aspace) = data.aspace.take() {
            aspace.free(&self.regions);
        }
        if data.trapframe != 0 {
            self.allocator.free_page(data.trapframe);
            data.trapframe = 0;
        }
        data.name = [0; PROC_NAME_LEN];
        *inner = ProcInner::new();
    }

    /// Creates the first process from `image`, starting at `entry` with the stack at the top of its memory.
    /// It never exits and adopts every orphan.
    /// # Errors
    /// `NoFreeProcess` or `OutOfMemory`
    pub fn userinit(&self, image: &[u8], entry: usize) -> KernelResult<usize> {
        let (slot, mut inner) = self.alloc_proc()?;
        let data = unsafe { self.data_of(slot) };
        if let Err(error) = data.aspace_mut().load_image(image) {
            self.free_proc(slot, &mut inner);
            return Err(error);
        }
        let size = data.aspace_mut().size();
        let tf = unsafe { &mut *(data.trapframe as *mut TrapFrame) };
        tf.epc = entry;
        tf.sp = size;
        data.set_name("initcode");

        self.init.call_once(|| slot);
        inner.state = ProcState::Runnable;
        info!("init is pid {}", inner.pid);
        Ok(inner.pid)
    }

    /// Copies the running process into a new one, which resumes from the same trapframe with `a0 = 0` and, if
    /// given, `stack` as its stack pointer. Returns the child's pid.
    /// # Errors
    /// `NoFreeProcess`, `OutOfMemory` or `NoFreeRegion`
    pub fn fork(&self, stack: Option<usize>) -> KernelResult<usize> {
        let me = self.current_slot("fork");
        let (child, mut child_inner) = self.alloc_proc()?;
        let parent = unsafe { self.data_of(me) };
        let data = unsafe { self.data_of(child) };

        if let Err(error) = parent
            .aspace_mut()
            .duplicate(&self.regions, data.aspace_mut())
        {
            self.free_proc(child, &mut child_inner);
            return Err(error);
        }

        let tf = unsafe { &mut *(data.trapframe as *mut TrapFrame) };
        *tf = unsafe { *(parent.trapframe as *const TrapFrame) };
        tf.a0 = 0;
        if let Some(stack) = stack {
            tf.sp = stack;
        }

        for (theirs, mine) in data.files.iter_mut().zip(parent.files.iter()) {
            if let Some(file) = mine {
                file.dup();
                *theirs = Some(*file);
            }
        }
        if let Some(cwd) = parent.cwd {
            cwd.dup();
            data.cwd = Some(cwd);
        }
        data.name = parent.name;

        let pid = child_inner.pid;
        drop(child_inner);

        self.parents.lock()[child] = Some(me);

        self.procs[child].inner.lock().state = ProcState::Runnable;
        debug!("fork: {} -> {pid}", parent.name());
        Ok(pid)
    }

    /// Hands every child of `slot` to init
    fn reparent(&self, slot: usize, parents: &mut [Option<usize>; NPROC]) {
        let Some(&init) = self.init.get() else {
            return;
        };
        let mut adopted = false;
        for parent in parents.iter_mut().filter(|parent| **parent == Some(slot)) {
            *parent = Some(init);
            adopted = true;
        }
        if adopted {
            self.wakeup(self.chan_of(init));
        }
    }

    /// Ends the running process. It stays a zombie until its parent waits for it.
    /// # Panics
    /// Panics when called by init, or outside a process
    pub fn exit(&self, code: i32) -> ! {
        let me = self.current_slot("exit");
        assert!(self.init.get() != Some(&me), "init exiting");

        let data = unsafe { self.data_of(me) };
        for file in &mut data.files {
            if let Some(file) = file.take() {
                file.close();
            }
        }
        if let Some(cwd) = data.cwd.take() {
            cwd.put();
        }

        let mut parents = self.parents.lock();
        self.reparent(me, &mut parents);
        if let Some(parent) = parents[me] {
            self.wakeup(self.chan_of(parent));
        }

        let mut inner = self.procs[me].inner.lock();
        inner.exit_code = code;
        inner.state = ProcState::Zombie;
        debug!("exit: pid {} ({}) with {code}", inner.pid, data.name());
        drop(parents);

        let _inner = self.sched(me, inner);
        unreachable!("zombie exit");
    }

    /// Waits for a child to exit and reaps it, returning its pid. `pid > 0` waits for that child only.
    /// The exit status, `code << 8`, is copied to `status` when given.
    /// # Errors
    /// `NoChildren` if no child matches, `Killed` if the caller was killed while waiting, `BadAddress` if the
    /// status could not be copied out (the child is then left for a later `wait`)
    pub fn wait(&self, pid: isize, status: Option<usize>) -> KernelResult<usize> {
        let me = self.current_slot("wait");
        let mut parents = self.parents.lock();
        loop {
            let mut have_children = false;
            for child in 0..NPROC {
                if parents[child] != Some(me) {
                    continue;
                }
                let mut inner = self.procs[child].inner.lock();
                if pid > 0 && inner.pid as isize != pid {
                    continue;
                }
                have_children = true;
                if inner.state == ProcState::Zombie {
                    let child_pid = inner.pid;
                    if let Some(address) = status {
                        self.copy_out(address, &(inner.exit_code << 8).to_ne_bytes())?;
                    }
                    self.free_proc(child, &mut inner);
                    parents[child] = None;
                    return Ok(child_pid);
                }
            }

            if !have_children {
                return Err(KernelError::NoChildren);
            }
            if self.killed() {
                return Err(KernelError::Killed);
            }
            parents = self.sleep(self.chan_of(me), parents);
        }
    }

    /// Marks `pid` killed. A sleeping victim is made runnable so it reaches a checkpoint.
    /// # Errors
    /// `NoSuchProcess`, or `InvalidArgument` for init, which never exits
    pub fn kill(&self, pid: usize) -> KernelResult<()> {
        for (slot, p) in self.procs.iter().enumerate() {
            let mut inner = p.inner.lock();
            if inner.pid == pid && inner.state != ProcState::Unused {
                if self.init.get() == Some(&slot) {
                    return Err(KernelError::InvalidArgument);
                }
                inner.killed = true;
                if inner.state == ProcState::Sleeping {
                    inner.state = ProcState::Runnable;
                }
                return Ok(());
            }
        }
        Err(KernelError::NoSuchProcess)
    }

    pub fn killed(&self) -> bool {
        self.myproc().is_some_and(|p| p.inner.lock().killed)
    }

    pub fn set_killed(&self) {
        if let Some(p) = self.myproc() {
            p.inner.lock().killed = true;
        }
    }

    /// # Panics
    /// Panics outside a process
    pub fn mypid(&self) -> usize {
        self.procs[self.current_slot("mypid")].inner.lock().pid
    }

    /// Pid of the parent, 0 for init
    pub fn getppid(&self) -> usize {
        let me = self.current_slot("getppid");
        let parent = self.parents.lock()[me];
        parent.map_or(0, |slot| self.procs[slot].inner.lock().pid)
    }

    pub fn state_of(&self, pid: usize) -> Option<ProcState> {
        self.procs.iter().find_map(|p| {
            let inner = p.inner.lock();
            (inner.pid == pid && inner.state != ProcState::Unused).then_some(inner.state)
        })
    }

    /// Size of the running process's `[0, size)` memory
    pub fn size(&self) -> usize {
        unsafe { self.my_data() }.aspace_mut().size()
    }

    /// Grows or shrinks the running process's memory by `delta` bytes, returning the new size
    /// # Errors
    /// `OutOfMemory` or `InvalidArgument`, see [`AddressSpace::grow`]
    pub fn grow(&self, delta: isize) -> KernelResult<usize> {
        unsafe { self.my_data() }.aspace_mut().grow(delta)
    }

    /// Puts `file` in the lowest free descriptor of the running process
    /// # Errors
    /// `BadFileDescriptor` if the table is full
    pub fn fd_install(&self, file: FileRef) -> KernelResult<usize> {
        let data = unsafe { self.my_data() };
        let fd = data
            .files
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::BadFileDescriptor)?;
        data.files[fd] = Some(file);
        Ok(fd)
    }

    /// # Errors
    /// `BadFileDescriptor` if `fd` is not open
    pub fn file(&self, fd: usize) -> KernelResult<FileRef> {
        unsafe { self.my_data() }
            .files
            .get(fd)
            .copied()
            .flatten()
            .ok_or(KernelError::BadFileDescriptor)
    }

    pub fn set_cwd(&self, dir: DirRef) {
        if let Some(old) = unsafe { self.my_data() }.cwd.replace(dir) {
            old.put();
        }
    }

    /// # Errors
    /// See [`AddressSpace::mmap`]
    pub fn mmap(
        &self,
        length: usize,
        prot: Prot,
        flags: MapFlags,
        file: Option<(FileRef, usize)>,
    ) -> KernelResult<usize> {
        unsafe { self.my_data() }
            .aspace_mut()
            .mmap(&self.regions, length, prot, flags, file)
    }

    /// # Errors
    /// See [`AddressSpace::munmap`]
    pub fn munmap(&self, start: usize, length: usize) -> KernelResult<()> {
        unsafe { self.my_data() }
            .aspace_mut()
            .munmap(&self.regions, start, length)
    }

    /// # Errors
    /// See [`AddressSpace::mprotect`]
    pub fn mprotect(&self, start: usize, length: usize, prot: Prot) -> KernelResult<()> {
        unsafe { self.my_data() }
            .aspace_mut()
            .mprotect(start, length, prot)
    }

    /// # Errors
    /// `BadAddress`
    pub fn copy_out(&self, destination: usize, source: &[u8]) -> KernelResult<()> {
        unsafe { self.my_data() }
            .aspace_mut()
            .table_mut()
            .copy_out(destination, source)
    }

    /// # Errors
    /// `BadAddress`
    pub fn copy_in(&self, destination: &mut [u8], source: usize) -> KernelResult<()> {
        unsafe { self.my_data() }
            .aspace_mut()
            .table()
            .copy_in(destination, source)
    }

    /// Logs the process table. Takes no locks, so it works from a wedged machine.
    pub fn dump(&self) {
        info!("pid state name");
        for p in &self.procs {
            let inner = unsafe { p.inner.get_unsynchronized() };
            if inner.state == ProcState::Unused {
                continue;
            }
            let data = unsafe { &*p.data.get() };
            info!("{} {:?} {}", inner.pid, inner.state, data.name());
        }
    }
}
