//! # QEMU Debug Console Logging
//!
//! Routes kernel diagnostics to QEMU's debug console (`-debugcon`), which
//! captures every byte written to I/O port `0x402`:
//!
//! ```text
//! log::info!/debug!/warn!
//!     ↓
//! QemuLogger (log::Log)
//!     ↓
//! QemuSink (fmt::Write)
//!     ↓
//! dbg_putc() → I/O port 0x402 → host terminal
//! ```
//!
//! ```bash
//! qemu-system-x86_64 -kernel kernel.bin -debugcon stdio
//! ```
//!
//! With the `enabled` feature off (or on non-x86 hosts), output is dropped
//! and the logger costs nothing beyond the level check.
//!
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::{LevelFilter, info};
//!
//! static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);
//! LOGGER.init().ok();
//! info!("memory manager up");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use debugcon::QemuSink;
pub use logger::{QemuLogger, write_record};

#[cfg(all(feature = "enabled", target_arch = "x86_64"))]
mod debugcon {
    use core::fmt;

    const QEMU_DEBUG_PORT: u16 = 0x402;

    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn dbg_putc(c: u8) {
        // SAFETY: port 0x402 is QEMU's debug console; writing it has no
        // effect on memory.
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }
    }

    /// Byte-at-a-time writer to the debug console.
    pub struct QemuSink;

    impl fmt::Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            s.bytes().for_each(dbg_putc);
            Ok(())
        }
    }
}

#[cfg(not(all(feature = "enabled", target_arch = "x86_64")))]
mod debugcon {
    use core::fmt;

    /// Drops everything written to it.
    pub struct QemuSink;

    impl fmt::Write for QemuSink {
        #[inline]
        fn write_str(&mut self, _: &str) -> fmt::Result {
            Ok(())
        }
    }
}
