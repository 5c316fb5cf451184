use crate::{ControlRegister, Msr, RegisterAccess};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::RefCell;

/// In-memory register file for host tests.
///
/// Unset registers read as zero. Every CR3 write is recorded so tests can
/// assert on address-space switches.
#[derive(Debug, Default)]
pub struct MockRegisters {
    control: RefCell<BTreeMap<ControlRegister, u64>>,
    msrs: RefCell<BTreeMap<Msr, u64>>,
    cr3_writes: RefCell<Vec<u64>>,
}

impl MockRegisters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload a control register, e.g. CR3 for `from_current` tests.
    #[must_use]
    pub fn with_cr(self, cr: ControlRegister, value: u64) -> Self {
        self.control.borrow_mut().insert(cr, value);
        self
    }

    /// Raw CR3 values written so far, oldest first.
    #[must_use]
    pub fn cr3_writes(&self) -> Vec<u64> {
        self.cr3_writes.borrow().clone()
    }
}

impl RegisterAccess for MockRegisters {
    unsafe fn read_cr(&self, cr: ControlRegister) -> u64 {
        self.control.borrow().get(&cr).copied().unwrap_or(0)
    }

    unsafe fn write_cr(&self, cr: ControlRegister, value: u64) {
        if cr == ControlRegister::Cr3 {
            self.cr3_writes.borrow_mut().push(value);
        }
        self.control.borrow_mut().insert(cr, value);
    }

    unsafe fn read_msr(&self, msr: Msr) -> u64 {
        self.msrs.borrow().get(&msr).copied().unwrap_or(0)
    }

    unsafe fn write_msr(&self, msr: Msr, value: u64) {
        self.msrs.borrow_mut().insert(msr, value);
    }
}
