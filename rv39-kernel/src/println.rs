//! Console output through the SBI firmware, and the `log` backend built on it.

use core::fmt::Write;

static CONSOLE: spin::once::Once<&'static dyn Console> = spin::once::Once::new();
const LEVEL_FILTER: log::LevelFilter = log::LevelFilter::Trace;

// write errors are dropped: the panic handler prints through these too, with nowhere left to report them
#[allow(unused_macros)]
macro_rules! print {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = core::write!($crate::println::DebugWriter, $($arg)*);
    }};
}

macro_rules! println {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = core::writeln!($crate::println::DebugWriter, $($arg)*);
    }};
}

/// Picks the DBCN console when the firmware has it, the legacy putchar otherwise, and installs the logger
/// # Panics
/// Panics if a logger is already installed
pub(crate) fn init_console() {
    if sbi_rt::probe_extension(sbi_rt::Console).is_available() {
        CONSOLE.call_once(|| &DebugConsole);
    } else {
        CONSOLE.call_once(|| &LegacyConsole);
    }
    log::set_logger(&DebugWriter)
        .map(|()| log::set_max_level(LEVEL_FILTER))
        .unwrap_or_else(|_| panic!("logger installed twice"));
}

trait Console: Sync {
    fn put_byte(&self, byte: u8) -> core::fmt::Result;

    fn put_str(&self, string: &str) -> core::fmt::Result {
        string.bytes().try_for_each(|byte| self.put_byte(byte))
    }
}

struct LegacyConsole;

impl Console for LegacyConsole {
    #[allow(deprecated)]
    fn put_byte(&self, byte: u8) -> core::fmt::Result {
        if sbi_rt::legacy::console_putchar(usize::from(byte)) == 0 {
            Ok(())
        } else {
            Err(core::fmt::Error)
        }
    }
}

struct DebugConsole;

impl Console for DebugConsole {
    fn put_byte(&self, byte: u8) -> core::fmt::Result {
        sbi_rt::console_write_byte(byte)
            .into_result()
            .is_ok()
            .then_some(())
            .ok_or(core::fmt::Error)
    }

    fn put_str(&self, string: &str) -> core::fmt::Result {
        let bytes = string.as_bytes();
        // the firmware reads the buffer through physical addresses, which the kernel maps one to one
        sbi_rt::console_write(sbi_rt::Physical::new(bytes.len(), bytes.as_ptr() as usize, 0))
            .into_result()
            .is_ok()
            .then_some(())
            .ok_or(core::fmt::Error)
    }
}

pub(crate) struct DebugWriter;

impl Write for DebugWriter {
    fn write_str(&mut self, string: &str) -> core::fmt::Result {
        // output before the console is chosen is dropped
        CONSOLE.get().map_or(Ok(()), |console| console.put_str(string))
    }
}

impl log::Log for DebugWriter {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            println!(
                "[{}] ({}:{}:{}): {}",
                record.level(),
                record.target(),
                record.file().unwrap_or(""),
                record.line().unwrap_or(0),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

#[allow(unused_imports)]
pub(crate) use print;
pub(crate) use println;
