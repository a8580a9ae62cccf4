#![cfg_attr(target_os = "none", no_std)]

/*
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

pub mod arch;
pub mod cpu;
pub mod error;
pub mod file;
pub mod kalloc;
pub mod param;
pub mod proc;
pub mod sched;
pub mod sleeplock;
pub mod spinlock;
pub mod syscall;
pub mod trap;
pub mod uvm;
pub mod vm;

#[cfg(target_os = "none")]
pub mod boot;
#[cfg(target_os = "none")]
mod dev {
    pub(crate) mod spec;
}
#[cfg(target_os = "none")]
mod println;

#[cfg(test)]
mod testing;

#[cfg(target_os = "none")]
extern "C" {
    // linker script and entry symbols, only their addresses are meaningful
    pub(crate) fn _start();
    pub(crate) fn etext();
    pub(crate) fn end();
    pub(crate) fn trampoline();
}
