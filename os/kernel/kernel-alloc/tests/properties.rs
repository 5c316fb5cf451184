//! Randomized operation sequences against the heap and the buddy allocator.

mod common;

use common::Arena;
use core::ptr::NonNull;
use kernel_alloc::buddy::BuddyAllocator;
use kernel_alloc::heap::{Heap, HeapError};
use kernel_memory_addresses::PhysicalAddress;
use quickcheck::{Arbitrary, Gen, QuickCheck};

const MAX_TESTS: u64 = 200;

/// Limit on heap request sizes, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 12;

#[derive(Clone, Debug)]
enum HeapOp {
    Allocate { size: usize },
    AlignedAllocate { align_shift: u8, size: usize },
    /// Given `n` outstanding allocations, frees the one at `index % n`.
    Free { index: usize },
}

fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl Arbitrary for HeapOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match u8::arbitrary(g) % 5 {
            0 | 1 => Self::Allocate { size: limited_size(g) },
            2 => Self::AlignedAllocate {
                align_shift: 4 + u8::arbitrary(g) % 9,
                size: limited_size(g),
            },
            _ => Self::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

struct Allocation {
    ptr: NonNull<u8>,
    len: usize,
    fill: u8,
}

/// Runs `ops`, checking after every step that the heap is consistent and
/// that live allocations have not been overwritten. Frees everything at the
/// end and expects the heap to be empty again.
fn heap_ops_preserve_structure(ops: Vec<HeapOp>) -> bool {
    let mut arena = Arena::new(4 << 20);
    let mut heap = arena.heap();
    let empty = heap.current_size();
    let mut live: Vec<Allocation> = Vec::new();

    for (n, op) in ops.into_iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let fill = n as u8;
        let res = match op {
            HeapOp::Allocate { size } => heap.allocate(size).map(|p| (p, size)),
            HeapOp::AlignedAllocate { align_shift, size } => {
                let align = 1usize << align_shift;
                let res = heap.aligned_allocate(align, size);
                if let Ok(p) = res
                    && !p.as_ptr().addr().is_multiple_of(align)
                {
                    return false;
                }
                res.map(|p| (p, size))
            }
            HeapOp::Free { index } => {
                if !live.is_empty() {
                    let a = live.swap_remove(index % live.len());
                    let body = unsafe { core::slice::from_raw_parts(a.ptr.as_ptr(), a.len) };
                    if body.iter().any(|&b| b != a.fill) {
                        return false;
                    }
                    unsafe { heap.free(a.ptr) }.unwrap();
                }
                if heap.sanity_check().is_err() {
                    return false;
                }
                continue;
            }
        };

        match res {
            Ok((ptr, len)) => {
                if heap.body_size(ptr).unwrap() < len {
                    return false;
                }
                unsafe { ptr.as_ptr().write_bytes(fill, len) };
                live.push(Allocation { ptr, len, fill });
            }
            Err(HeapError::OutOfMemory { .. }) => {}
            Err(_) => return false,
        }
        if heap.sanity_check().is_err() {
            return false;
        }
    }

    for a in live.drain(..) {
        unsafe { heap.free(a.ptr) }.unwrap();
    }
    heap.sanity_check().is_ok() && heap.current_size() == empty && heap.free_chunk_count() == 0
}

#[test]
fn heap_operations_preserve_structure() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(heap_ops_preserve_structure as fn(_) -> bool);
}

/// A plain allocation gets at least what it asked for and at most twice its
/// power-of-two size class.
fn allocation_lands_in_its_size_class(sizes: Vec<u16>) -> bool {
    let mut arena = Arena::new(4 << 20);
    let mut heap = arena.heap();
    let mut ptrs = Vec::new();
    for (i, size) in sizes.into_iter().enumerate() {
        let size = usize::from(size) % 8192;
        let Ok(p) = heap.allocate(size) else {
            return false;
        };
        let body = heap.body_size(p).unwrap();
        let class = size.max(8).next_power_of_two();
        if body < size || body > 2 * class {
            return false;
        }
        ptrs.push(p);
        // Punch holes so later requests are served from the free lists.
        if i % 3 == 2 {
            let victim = ptrs.swap_remove(i % ptrs.len());
            unsafe { heap.free(victim) }.unwrap();
        }
    }
    heap.sanity_check().is_ok()
}

#[test]
fn allocations_land_in_their_size_class() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(allocation_lands_in_its_size_class as fn(_) -> bool);
}

#[derive(Clone, Debug)]
enum BuddyOp {
    Allocate { order: u8 },
    Free { index: usize },
}

const BUDDY_ORDER: u8 = 6;

impl Arbitrary for BuddyOp {
    fn arbitrary(g: &mut Gen) -> Self {
        if bool::arbitrary(g) {
            Self::Allocate {
                order: u8::arbitrary(g) % (BUDDY_ORDER + 2),
            }
        } else {
            Self::Free {
                index: usize::arbitrary(g),
            }
        }
    }
}

/// Free and allocated bytes always add up to the span, live blocks are
/// aligned to their size and never overlap, and freeing everything merges
/// the allocator back into one block.
fn buddy_ops_conserve_frames(ops: Vec<BuddyOp>) -> bool {
    let base = PhysicalAddress::new(0x0800_0000);
    let mut buddy = BuddyAllocator::new(base, BUDDY_ORDER).unwrap();
    let mut live: Vec<(PhysicalAddress, u8)> = Vec::new();

    for op in ops {
        match op {
            BuddyOp::Allocate { order } => match buddy.allocate_frame(order) {
                Ok(pa) => {
                    let size = 4096u64 << order;
                    if order > BUDDY_ORDER || !(pa - base).is_multiple_of(size) {
                        return false;
                    }
                    let overlaps = live.iter().any(|&(other, o)| {
                        let other_size = 4096u64 << o;
                        pa < other + other_size && other < pa + size
                    });
                    if overlaps {
                        return false;
                    }
                    live.push((pa, order));
                }
                Err(_) if order > BUDDY_ORDER => {}
                Err(_) => {
                    let free_big_enough = (order..=BUDDY_ORDER).any(|k| buddy.free_blocks(k) > 0);
                    if free_big_enough {
                        return false;
                    }
                }
            },
            BuddyOp::Free { index } => {
                if !live.is_empty() {
                    let (pa, _) = live.swap_remove(index % live.len());
                    buddy.free_frame(pa).unwrap();
                }
            }
        }

        let allocated: u64 = live.iter().map(|&(_, o)| 4096u64 << o).sum();
        if buddy.free_bytes() + allocated != buddy.span() || buddy.allocated_bytes() != allocated {
            return false;
        }
        let listed: u64 = (0..=BUDDY_ORDER)
            .map(|k| (buddy.free_blocks(k) as u64) << (12 + u32::from(k)))
            .sum();
        if listed + allocated != buddy.span() {
            return false;
        }
    }

    for (pa, _) in live {
        buddy.free_frame(pa).unwrap();
    }
    buddy.is_fully_merged() && buddy.free_bytes() == buddy.span()
}

#[test]
fn buddy_operations_conserve_frames() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(buddy_ops_conserve_frames as fn(_) -> bool);
}

#[test]
fn heap_matches_a_fresh_heap_after_round_trip() {
    fn prop(sizes: Vec<u16>) -> bool {
        let mut arena = Arena::new(4 << 20);
        let mut heap: Heap = arena.heap();
        let before = heap.current_size();
        let ptrs: Vec<_> = sizes
            .iter()
            .filter_map(|&s| heap.allocate(usize::from(s)).ok())
            .collect();
        for p in ptrs.into_iter().rev() {
            unsafe { heap.free(p) }.unwrap();
        }
        heap.current_size() == before
    }
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(prop as fn(_) -> bool);
}
