//! Machine description handed over by the firmware as a flattened device tree
use spin::once::Once;

use crate::param::MAX_HART_COUNT;

static PHYSICAL_ADDRESS_STOP: Once<usize> = Once::new();
static HART_IDS: Once<([usize; MAX_HART_COUNT], usize)> = Once::new();

/// Loads data from the FDT pointed to at `fdt_address`
/// # Safety
/// Assumes that the `fdt_address` points to a valid fdt and that the memory is mapped correctly.
/// # Panics
/// Panics if the address or the data at the address is invalid
pub(crate) unsafe fn load_fdt(fdt_address: usize) {
    let fdt = unsafe { fdt::Fdt::from_ptr(fdt_address as *const u8) }
        .unwrap_or_else(|error| panic!("unable to load fdt: {error:?}"));

    // RAM the kernel was loaded into; the image sits at its start
    let kernel_base = crate::_start as *const () as usize;
    let physical_stop = fdt
        .memory()
        .regions()
        .find_map(|region| {
            let start = region.starting_address as usize;
            let stop = start + region.size?;
            (start..stop).contains(&kernel_base).then_some(stop)
        })
        .unwrap_or_else(|| panic!("no memory region holds the kernel at {kernel_base:#x}"));
    // memory above the kernel stacks would collide with them in the direct map
    let mapped_ceiling = crate::param::kstack(crate::param::NPROC - 1);
    PHYSICAL_ADDRESS_STOP.call_once(|| core::cmp::min(physical_stop, mapped_ceiling));

    HART_IDS.call_once(|| {
        let mut ids = [0; MAX_HART_COUNT];
        let mut count = 0;
        for cpu in fdt.cpus().take(MAX_HART_COUNT) {
            ids[count] = cpu.ids().first();
            count += 1;
        }
        (ids, count)
    });
}

/// Hart ids of the machine, at most [`MAX_HART_COUNT`] of them
pub(crate) fn hart_ids() -> &'static [usize] {
    let (ids, count) = HART_IDS.wait();
    &ids[..*count]
}

#[inline]
pub(crate) fn get_cpu_count() -> usize {
    hart_ids().len()
}

/// End of the physical memory the kernel manages
#[inline]
pub(crate) fn get_physical_memory_size() -> usize {
    *PHYSICAL_ADDRESS_STOP.wait()
}
