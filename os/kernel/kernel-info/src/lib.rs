//! # Kernel Memory Configuration and Boot Interface
//!
//! Single source of truth for the memory-management layout shared by the
//! heap, the frame pool and the page table manager.
//!
//! ### Memory Layout ([`memory`])
//! Compile-time constants and the runtime [`MemoryLayout`](memory::MemoryLayout)
//! derived from them:
//! * **Frames**: frame size and the order of each user frame pool instance
//! * **Heap**: the kernel heap window and its free-list bucket count
//! * **Physical Memory Mapping**: HHDM (Higher Half Direct Mapping) offset
//!
//! ### Boot Information ([`boot`])
//! The bootloader-to-kernel description of usable physical memory
//! ([`BootMemoryRegion`](boot::BootMemoryRegion)), used to seed the frame pool.
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User Space              │
//! USERSPACE_END         ├─────────────────────────────────┤ 0xffff_0000_0000_0000
//!                       │        Guard Region             │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_HEAP_BASE      │ ┌─────────────────────────────┐ │ HHDM_BASE + 64 MiB
//!                       │ │  Kernel Heap (up to 1 GiB)  │ │
//!                       │ └─────────────────────────────┘ │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
