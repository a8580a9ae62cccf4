use log::{trace, warn};
use num_enum::TryFromPrimitive;

use crate::error::{KernelError, KernelResult};
use crate::proc::Kernel;
use crate::uvm::{MapFlags, Prot};

/// Linux RISC-V system call numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(usize)]
pub enum Syscall {
    Exit = 93,
    ExitGroup = 94,
    SchedYield = 124,
    Kill = 129,
    GetPid = 172,
    GetPpid = 173,
    Brk = 214,
    Munmap = 215,
    Clone = 220,
    Mmap = 222,
    Mprotect = 226,
    Wait4 = 260,
}

/// The only `clone` flavour supported: a plain fork that signals the parent on exit
const SIGCHLD: usize = 17;

/// Runs the system call in `a7` of the running process, leaving the result or negative errno in `a0`
pub fn syscall(kernel: &Kernel) {
    let (number, args) = {
        let tf = unsafe { kernel.trapframe() };
        (tf.a7, tf.args())
    };
    let result = match Syscall::try_from(number) {
        Ok(call) => {
            trace!("pid {}: {call:?}", kernel.mypid());
            dispatch(kernel, call, args).unwrap_or_else(KernelError::errno)
        }
        Err(_) => {
            warn!("pid {}: unknown sys call {number}", kernel.mypid());
            KernelError::Unsupported.errno()
        }
    };
    unsafe { kernel.trapframe() }.a0 = result as usize;
}

fn user_pointer(address: usize) -> Option<usize> {
    (address != 0).then_some(address)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn dispatch(kernel: &Kernel, call: Syscall, args: [usize; 6]) -> KernelResult<isize> {
    match call {
        Syscall::Clone => {
            if args[0] != SIGCHLD {
                return Err(KernelError::InvalidArgument);
            }
            kernel.fork(user_pointer(args[1])).map(|pid| pid as isize)
        }
        Syscall::Exit | Syscall::ExitGroup => kernel.exit(args[0] as i32),
        Syscall::Wait4 => kernel
            .wait(args[0] as isize, user_pointer(args[1]))
            .map(|pid| pid as isize),
        Syscall::Brk => Ok(brk(kernel, args[0]) as isize),
        Syscall::Mmap => {
            let prot = Prot::from_bits(args[2]).ok_or(KernelError::InvalidArgument)?;
            let flags = MapFlags::from_bits_truncate(args[3]);
            let file = if flags.contains(MapFlags::ANONYMOUS) {
                None
            } else {
                Some((kernel.file(args[4])?, args[5]))
            };
            kernel
                .mmap(args[1], prot, flags, file)
                .map(|start| start as isize)
        }
        Syscall::Munmap => kernel.munmap(args[0], args[1]).map(|()| 0),
        Syscall::Mprotect => {
            let prot = Prot::from_bits(args[2]).ok_or(KernelError::InvalidArgument)?;
            kernel.mprotect(args[0], args[1], prot).map(|()| 0)
        }
        Syscall::Kill => kernel.kill(args[0]).map(|()| 0),
        Syscall::GetPid => Ok(kernel.mypid() as isize),
        Syscall::GetPpid => Ok(kernel.getppid() as isize),
        Syscall::SchedYield => {
            kernel.yield_now();
            Ok(0)
        }
    }
}

/// Moves the program break to `address` and returns the break in effect afterwards, which stays put when the
/// move is impossible. `0` only asks for the current break.
fn brk(kernel: &Kernel, address: usize) -> usize {
    let size = kernel.size();
    if address == 0 {
        return size;
    }
    let delta = if address >= size {
        isize::try_from(address - size)
    } else {
        isize::try_from(size - address).map(|shrink| -shrink)
    };
    match delta {
        Ok(delta) => kernel.grow(delta).unwrap_or(size),
        Err(_) => size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{PAGE_SIZE, VM_MMAP_START};
    use crate::testing::{boot, reap_forever, Outcome};
    use crate::trap::ecall;

    fn call(kernel: &Kernel, syscall: Syscall, args: &[usize]) -> isize {
        let mut registers = [0; 6];
        registers[..args.len()].copy_from_slice(args);
        ecall(kernel, syscall as usize, registers)
    }

    #[test]
    fn numbers_follow_linux() {
        assert_eq!(Syscall::try_from(220).ok(), Some(Syscall::Clone));
        assert_eq!(Syscall::try_from(260).ok(), Some(Syscall::Wait4));
        assert!(Syscall::try_from(999).is_err());
    }

    #[test]
    fn process_calls_report_identity() {
        static OUTCOME: Outcome<Vec<isize>> = Outcome::new();

        fn init() -> i32 {
            let kernel = Kernel::current();
            let results = vec![
                call(kernel, Syscall::GetPid, &[]),
                call(kernel, Syscall::GetPpid, &[]),
                call(kernel, Syscall::SchedYield, &[]),
                call(kernel, Syscall::Kill, &[4242]),
                ecall(kernel, 999, [0; 6]),
            ];
            OUTCOME.post(results);
            reap_forever(kernel)
        }

        let kernel = boot(32, 1, init);
        assert_eq!(OUTCOME.wait(), vec![1, 0, 0, -3, -38]);
        kernel.shutdown();
    }

    #[test]
    fn clone_and_wait4_round_trip() {
        static OUTCOME: Outcome<(isize, isize, isize, i32)> = Outcome::new();

        fn child() -> i32 {
            let kernel = Kernel::current();
            call(kernel, Syscall::Exit, &[5]);
            unreachable!()
        }

        fn init() -> i32 {
            let kernel = Kernel::current();
            let refused = call(kernel, Syscall::Clone, &[0]);
            let entry = unsafe { kernel.trapframe() }.epc;
            unsafe { kernel.trapframe() }.epc = child as *const () as usize;
            let pid = call(kernel, Syscall::Clone, &[SIGCHLD]);
            unsafe { kernel.trapframe() }.epc = entry;
            let reaped = call(kernel, Syscall::Wait4, &[usize::MAX, 8]);
            let mut status = [0; 4];
            kernel.copy_in(&mut status, 8).unwrap();
            OUTCOME.post((refused, pid, reaped, i32::from_ne_bytes(status) >> 8));
            reap_forever(kernel)
        }

        let kernel = boot(64, 2, init);
        let (refused, pid, reaped, code) = OUTCOME.wait();
        assert_eq!(refused, -22);
        assert!(pid > 1);
        assert_eq!(reaped, pid);
        assert_eq!(code, 5);
        kernel.shutdown();
    }

    #[test]
    fn brk_reports_the_break() {
        static OUTCOME: Outcome<Vec<isize>> = Outcome::new();

        fn init() -> i32 {
            let kernel = Kernel::current();
            let results = vec![
                call(kernel, Syscall::Brk, &[0]),
                call(kernel, Syscall::Brk, &[3 * PAGE_SIZE]),
                call(kernel, Syscall::Brk, &[2 * PAGE_SIZE]),
                call(kernel, Syscall::Brk, &[VM_MMAP_START + PAGE_SIZE]),
            ];
            OUTCOME.post(results);
            reap_forever(kernel)
        }

        let kernel = boot(32, 1, init);
        let page = PAGE_SIZE as isize;
        assert_eq!(OUTCOME.wait(), vec![page, 3 * page, 2 * page, 2 * page]);
        kernel.shutdown();
    }

    #[test]
    fn mapping_calls_manage_regions() {
        static OUTCOME: Outcome<Vec<isize>> = Outcome::new();

        fn init() -> i32 {
            let kernel = Kernel::current();
            let anonymous = (MapFlags::PRIVATE | MapFlags::ANONYMOUS).bits();
            let read_write = (Prot::READ | Prot::WRITE).bits();
            let start = call(kernel, Syscall::Mmap, &[0, PAGE_SIZE, read_write, anonymous, usize::MAX, 0]);
            let written = kernel.copy_out(start as usize, b"mapped").is_ok();
            let results = vec![
                start,
                isize::from(written),
                call(kernel, Syscall::Mprotect, &[start as usize, PAGE_SIZE, Prot::READ.bits()]),
                isize::from(kernel.copy_out(start as usize, b"x").is_err()),
                call(kernel, Syscall::Mprotect, &[start as usize, PAGE_SIZE, 0x100]),
                call(kernel, Syscall::Mmap, &[0, PAGE_SIZE, read_write, MapFlags::PRIVATE.bits(), 3, 0]),
                call(kernel, Syscall::Munmap, &[start as usize, 2 * PAGE_SIZE]),
                call(kernel, Syscall::Munmap, &[start as usize, PAGE_SIZE]),
            ];
            OUTCOME.post(results);
            reap_forever(kernel)
        }

        let kernel = boot(32, 1, init);
        let results = OUTCOME.wait();
        assert_eq!(results[0], VM_MMAP_START as isize);
        assert_eq!(&results[1..], &[1, 0, 1, -22, -9, -22, 0]);
        kernel.shutdown();
    }

    #[test]
    fn killed_caller_never_returns_from_a_call() {
        static OUTCOME: Outcome<i32> = Outcome::new();

        fn victim() -> i32 {
            let kernel = Kernel::current();
            kernel.set_killed();
            call(kernel, Syscall::GetPid, &[]);
            unreachable!()
        }

        fn init() -> i32 {
            let kernel = Kernel::current();
            crate::testing::spawn(kernel, victim).unwrap();
            kernel.wait(-1, Some(0)).unwrap();
            let mut status = [0; 4];
            kernel.copy_in(&mut status, 0).unwrap();
            OUTCOME.post(i32::from_ne_bytes(status) >> 8);
            reap_forever(kernel)
        }

        let kernel = boot(32, 1, init);
        assert_eq!(OUTCOME.wait(), -1);
        kernel.shutdown();
    }
}
