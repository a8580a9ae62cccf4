//! Bringing harts up, from the entry code in the kernel binary to the scheduler.

use core::sync::atomic::{AtomicBool, Ordering};

use log::info;

use crate::dev::spec::{get_cpu_count, get_physical_memory_size, hart_ids, load_fdt};
use crate::kalloc::KMEM;
use crate::println::println;
use crate::proc::KERNEL;
use crate::vm::{kvmmake, KERNEL_PAGE_TABLE};

/// First user program: yield forever
/// ```text
/// loop: li a7, 124    # sched_yield
///       ecall
///       j loop
/// ```
const INITCODE: [u8; 12] = [
    0x93, 0x08, 0xc0, 0x07, // li a7, 124
    0x73, 0x00, 0x00, 0x00, // ecall
    0x6f, 0xf0, 0x9f, 0xff, // j -8
];

static STARTED: AtomicBool = AtomicBool::new(false);

fn install_kernel_page_table() {
    let Some(table) = KERNEL_PAGE_TABLE.get() else {
        panic!("hart {} started before the kernel page table", crate::arch::cpu_id());
    };
    table.set_as_active_table();
}

/// Entry of every hart once it has a stack. The first one sets the machine up and wakes the others.
/// # Safety
/// `device_tree_paddr` must point at the firmware's device tree whenever this is the first hart to get here,
/// and `tp` must hold `hartid`.
pub unsafe fn rust_boot(hartid: usize, device_tree_paddr: usize, entry: usize) -> ! {
    if STARTED.swap(true, Ordering::AcqRel) {
        install_kernel_page_table();
        crate::trap::trap_inithart();
        info!("hart {hartid} starting");
        KERNEL.scheduler()
    }

    crate::println::init_console();
    unsafe { load_fdt(device_tree_paddr) };
    info!(
        "end: {:#x}, etext: {:#x}, memory stop: {:#x}, harts: {}",
        crate::end as *const () as usize,
        crate::etext as *const () as usize,
        get_physical_memory_size(),
        get_cpu_count()
    );

    KMEM.init();
    info!("{} pages free", KMEM.free_count());
    if let Err(error) = kvmmake(&KMEM) {
        panic!("kvmmake: {error:?}");
    }
    install_kernel_page_table();
    info!("kernel page table installed");

    KERNEL.init(crate::trampoline as *const () as usize);
    crate::trap::trap_inithart();
    if let Err(error) = KERNEL.userinit(&INITCODE, 0) {
        panic!("userinit: {error:?}");
    }

    for &other in hart_ids().iter().filter(|&&id| id != hartid) {
        if let Err(error) = sbi_rt::hart_start(other, entry, 0).into_result() {
            println!("hart {other} failed to start: {error:?}");
        }
    }
    info!("hart {hartid} starting");
    KERNEL.scheduler()
}

#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    crate::arch::intr_off();
    println!("hart {} {info}", crate::arch::cpu_id());
    sbi_rt::system_reset(sbi_rt::Shutdown, sbi_rt::SystemFailure);
    loop {
        crate::arch::wait_for_interrupt();
    }
}
