#![cfg_attr(target_os = "none", no_std, no_main)]

/*!
   Copyright 2024 Claire Moore

   Licensed under the Apache License, Version 2.0 (the "License");
   you may not use this file except in compliance with the License.
   You may obtain a copy of the License at

       http://www.apache.org/licenses/LICENSE-2.0

   Unless required by applicable law or agreed to in writing, software
   distributed under the License is distributed on an "AS IS" BASIS,
   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
   See the License for the specific language governing permissions and
   limitations under the License.
*/

#[cfg(target_os = "none")]
mod entry {
    use core::arch::global_asm;

    use rv39_kernel::param::{BOOT_STACK_SIZE, MAX_HART_COUNT};

    #[repr(C, align(16))]
    struct BootStacks([[u8; BOOT_STACK_SIZE]; MAX_HART_COUNT]);

    static mut STACK0: BootStacks = BootStacks([[0; BOOT_STACK_SIZE]; MAX_HART_COUNT]);

    // a0: hart id, a1: device tree. Every hart enters here, the firmware starts the others at the same address.
    global_asm!(
        ".section .text.entry",
        ".globl _start",
        "_start:",
        "   mv tp, a0",
        "   la sp, {stack0}",
        "   li t0, {stack_size}",
        "   addi t1, a0, 1",
        "   mul t0, t0, t1",
        "   add sp, sp, t0",
        "   la a2, _start",
        "   call {rust_start}",
        "1: wfi",
        "   j 1b",
        stack0 = sym STACK0,
        stack_size = const BOOT_STACK_SIZE,
        rust_start = sym rust_start,
    );

    extern "C" fn rust_start(hartid: usize, device_tree_paddr: usize, entry: usize) -> ! {
        unsafe { rv39_kernel::boot::rust_boot(hartid, device_tree_paddr, entry) }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("rv39-kernel only boots on riscv64 bare metal; build it for riscv64gc-unknown-none-elf");
    std::process::exit(1);
}
