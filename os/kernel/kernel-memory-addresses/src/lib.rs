//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses used by the heap, the
//! buddy frame allocator and the page table manager.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`MemoryAddress`] | A raw 64-bit address, either physical or virtual. |
//! | [`PhysicalAddress`] | Physical memory (RAM frames, page table bases). |
//! | [`VirtualAddress`] | Virtual, page-table translated memory. |
//!
//! ## Page Sizes
//!
//! The three x86-64 page sizes are available as marker types implementing
//! [`PageSize`]:
//!
//! - [`Size4K`]: 4 KiB pages (base granularity, one buddy frame)
//! - [`Size2M`]: 2 MiB huge pages
//! - [`Size1G`]: 1 GiB giant pages
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
//! assert!(!va.is_aligned::<Size4K>());
//! assert_eq!(va.align_down::<Size4K>().as_u64(), 0xFFFF_FFFF_8000_1000);
//! assert_eq!(va.offset_in::<Size4K>(), 0x234);
//!
//! let pa = PhysicalAddress::new(0x0000_0010_2000_0000);
//! assert!(pa.is_aligned::<Size2M>());
//! ```
//!
//! All wrappers are `#[repr(transparent)]`, `Copy` and `Ord`, and every
//! alignment helper is a `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod memory_address;
mod page_size;
mod physical_address;
mod virtual_address;

pub use memory_address::MemoryAddress;
pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;
