use crate::{ControlRegister, Msr, RegisterAccess};
use core::arch::asm;

/// Executes the real privileged instructions.
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Registers;

impl RegisterAccess for X86Registers {
    #[inline]
    unsafe fn read_cr(&self, cr: ControlRegister) -> u64 {
        let value: u64;
        unsafe {
            match cr {
                ControlRegister::Cr0 => {
                    asm!("mov {}, cr0", out(reg) value, options(nomem, nostack, preserves_flags));
                }
                ControlRegister::Cr2 => {
                    asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
                }
                ControlRegister::Cr3 => {
                    asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
                }
                ControlRegister::Cr4 => {
                    asm!("mov {}, cr4", out(reg) value, options(nomem, nostack, preserves_flags));
                }
            }
        }
        value
    }

    #[inline]
    unsafe fn write_cr(&self, cr: ControlRegister, value: u64) {
        unsafe {
            match cr {
                ControlRegister::Cr0 => {
                    asm!("mov cr0, {}", in(reg) value, options(nostack, preserves_flags));
                }
                ControlRegister::Cr2 => {
                    asm!("mov cr2, {}", in(reg) value, options(nostack, preserves_flags));
                }
                ControlRegister::Cr3 => {
                    asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags));
                }
                ControlRegister::Cr4 => {
                    asm!("mov cr4, {}", in(reg) value, options(nostack, preserves_flags));
                }
            }
        }
    }

    #[inline]
    unsafe fn read_msr(&self, msr: Msr) -> u64 {
        let lo: u32;
        let hi: u32;
        unsafe {
            asm!(
                "rdmsr",
                in("ecx") msr.raw(),
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack, preserves_flags)
            );
        }
        (u64::from(hi) << 32) | u64::from(lo)
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn write_msr(&self, msr: Msr, value: u64) {
        let lo = (value & 0xFFFF_FFFF) as u32;
        let hi = (value >> 32) as u32;
        unsafe {
            asm!(
                "wrmsr",
                in("ecx") msr.raw(),
                in("eax") lo,
                in("edx") hi,
                options(nostack, preserves_flags)
            );
        }
    }
}
