//! # Kernel Memory Allocation
//!
//! The allocators underneath the kernel's memory manager:
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │      Kernel heap (heap)      │   │  Frame pool (frame_pool)     │
//! │  boundary tags, 16 buckets   │   │  Vec of 32 MiB buddies       │
//! │  grows/shrinks at the tail   │   │  grows on exhaustion         │
//! └──────────────┬───────────────┘   └──────────────┬───────────────┘
//!                │ page-aligned bodies              │ blocks of 2^k frames
//! ┌──────────────▼───────────────┐   ┌──────────────▼───────────────┐
//! │ Page tables (table_alloc)    │   │  Buddy allocator (buddy)     │
//! │ HeapTableAlloc for kernel-vmem│  │  need-merge / is-split trees │
//! └──────────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! ### Kernel heap ([`heap`])
//! First-fit allocation of small kernel objects out of one virtual window.
//! Chunks carry boundary tags on both ends so neighbors coalesce in O(1);
//! free chunks sit in power-of-two size buckets. [`LockedHeap`] wraps it in
//! the mode-switching heap lock and implements [`GlobalAlloc`](core::alloc::GlobalAlloc).
//!
//! ### Buddy allocator ([`buddy`])
//! Power-of-two blocks of 4 KiB frames. Coalescing decisions come from a
//! need-merge bitmap and block orders from an is-split bitmap, so freeing
//! needs only the address.
//!
//! ### Frame pool ([`frame_pool`])
//! Physical frames for user mappings. Adds a 32 MiB buddy instance whenever
//! all existing instances are exhausted.
//!
//! ### Physical mapper ([`phys_mapper`]) and table storage ([`table_alloc`])
//! Glue for `kernel-vmem`: reaching physical memory through the direct map,
//! and backing new page tables with heap memory.
//!
//! ## Example
//! ```rust
//! use core::ptr::NonNull;
//! use kernel_alloc::heap::Heap;
//!
//! let mut backing = vec![0u64; 512];
//! let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
//! let mut heap = unsafe { Heap::new(base, backing.len() * 8) }.unwrap();
//!
//! let before = heap.current_size();
//! let a = heap.allocate(8).unwrap();
//! let b = heap.allocate(8).unwrap();
//! unsafe {
//!     heap.free(a).unwrap();
//!     heap.free(b).unwrap();
//! }
//! heap.sanity_check().unwrap();
//! assert_eq!(heap.current_size(), before);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod bitmap;
pub mod buddy;
pub mod frame_pool;
pub mod heap;
pub mod phys_mapper;
pub mod table_alloc;

pub use buddy::{BuddyAllocator, BuddyError};
pub use frame_pool::{FramePool, LockedFramePool};
pub use heap::{Heap, HeapError, LockedHeap};
pub use phys_mapper::OffsetPhysMapper;
pub use table_alloc::HeapTableAlloc;
