//! # Register Access Provider
//!
//! The page table manager never touches control registers or MSRs directly.
//! It goes through a [`RegisterAccess`] implementation:
//!
//! * [`X86Registers`] executes the privileged instructions (`asm` feature,
//!   x86-64 only).
//! * [`MockRegisters`] keeps register values in memory so address-space
//!   switching can be exercised in host tests (`mock` feature).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(any(test, feature = "mock"))]
extern crate alloc;

mod cr3;
#[cfg(any(test, feature = "mock"))]
mod mock;
mod msr;
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
mod x86;

pub use cr3::Cr3;
#[cfg(any(test, feature = "mock"))]
pub use mock::MockRegisters;
pub use msr::Msr;
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub use x86::X86Registers;

/// Control registers reachable through [`RegisterAccess`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControlRegister {
    Cr0,
    /// Page-fault linear address.
    Cr2,
    /// Page-map level-4 base.
    Cr3,
    Cr4,
}

/// Raw control-register and model-specific-register access.
pub trait RegisterAccess {
    /// # Safety
    /// Privileged; requires CPL 0 on real hardware.
    unsafe fn read_cr(&self, cr: ControlRegister) -> u64;

    /// # Safety
    /// Privileged. The new value must keep the CPU state consistent, e.g. a
    /// CR3 write must name a page table that maps the executing code.
    unsafe fn write_cr(&self, cr: ControlRegister, value: u64);

    /// # Safety
    /// Privileged; the MSR must exist on the current CPU.
    unsafe fn read_msr(&self, msr: Msr) -> u64;

    /// # Safety
    /// Privileged; the MSR must exist and be writable with `value`.
    unsafe fn write_msr(&self, msr: Msr, value: u64);

    /// Typed CR3 read.
    ///
    /// # Safety
    /// See [`read_cr`](Self::read_cr).
    #[inline]
    unsafe fn read_cr3(&self) -> Cr3 {
        Cr3::from_bits(unsafe { self.read_cr(ControlRegister::Cr3) })
    }

    /// Typed CR3 write; switches the active address space.
    ///
    /// # Safety
    /// See [`write_cr`](Self::write_cr).
    #[inline]
    unsafe fn write_cr3(&self, cr3: Cr3) {
        unsafe { self.write_cr(ControlRegister::Cr3, cr3.into_bits()) }
    }
}
