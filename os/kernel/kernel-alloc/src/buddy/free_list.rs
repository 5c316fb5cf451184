//! Per-order circular doubly linked lists of free blocks.
//!
//! Descriptors live in one arena and link to each other by slot index, so
//! the lists never touch the frames they describe.

use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::PhysicalAddress;

#[derive(Debug, Copy, Clone)]
struct FrameDescriptor {
    address: PhysicalAddress,
    prev: usize,
    next: usize,
}

#[derive(Debug, Clone)]
pub struct FreeLists {
    slots: Vec<FrameDescriptor>,
    /// Slots released by `pop`/`remove`, reused before the arena grows.
    vacant: Vec<usize>,
    heads: Vec<Option<usize>>,
    lens: Vec<usize>,
}

impl FreeLists {
    /// Empty lists for orders `0..=max_order`.
    pub fn new(max_order: u8) -> Self {
        let orders = usize::from(max_order) + 1;
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            heads: vec![None; orders],
            lens: vec![0; orders],
        }
    }

    #[inline]
    pub fn len(&self, order: u8) -> usize {
        self.lens[usize::from(order)]
    }

    #[inline]
    pub fn is_empty(&self, order: u8) -> bool {
        self.heads[usize::from(order)].is_none()
    }

    /// Insert `address` at the head of the `order` list.
    pub fn push(&mut self, order: u8, address: PhysicalAddress) {
        let slot = self.vacant.pop().unwrap_or(self.slots.len());
        let desc = FrameDescriptor {
            address,
            prev: slot,
            next: slot,
        };
        if slot == self.slots.len() {
            self.slots.push(desc);
        } else {
            self.slots[slot] = desc;
        }

        let o = usize::from(order);
        if let Some(head) = self.heads[o] {
            let tail = self.slots[head].prev;
            self.slots[slot].prev = tail;
            self.slots[slot].next = head;
            self.slots[tail].next = slot;
            self.slots[head].prev = slot;
        }
        self.heads[o] = Some(slot);
        self.lens[o] += 1;
    }

    /// Take the head of the `order` list.
    pub fn pop(&mut self, order: u8) -> Option<PhysicalAddress> {
        let head = self.heads[usize::from(order)]?;
        let address = self.slots[head].address;
        self.unlink(order, head);
        Some(address)
    }

    /// Take `address` out of the `order` list. Returns whether it was there.
    pub fn remove(&mut self, order: u8, address: PhysicalAddress) -> bool {
        match self.find(order, address) {
            Some(slot) => {
                self.unlink(order, slot);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, order: u8, address: PhysicalAddress) -> bool {
        self.find(order, address).is_some()
    }

    /// Addresses on the `order` list, head first.
    #[cfg(test)]
    pub fn iter(&self, order: u8) -> impl Iterator<Item = PhysicalAddress> + '_ {
        let head = self.heads[usize::from(order)];
        let mut cursor = head;
        core::iter::from_fn(move || {
            let slot = cursor?;
            let desc = self.slots[slot];
            cursor = Some(desc.next).filter(|&next| Some(next) != head);
            Some(desc.address)
        })
    }

    fn find(&self, order: u8, address: PhysicalAddress) -> Option<usize> {
        let head = self.heads[usize::from(order)]?;
        let mut slot = head;
        loop {
            if self.slots[slot].address == address {
                return Some(slot);
            }
            slot = self.slots[slot].next;
            if slot == head {
                return None;
            }
        }
    }

    fn unlink(&mut self, order: u8, slot: usize) {
        let o = usize::from(order);
        let FrameDescriptor { prev, next, .. } = self.slots[slot];
        if next == slot {
            self.heads[o] = None;
        } else {
            self.slots[prev].next = next;
            self.slots[next].prev = prev;
            if self.heads[o] == Some(slot) {
                self.heads[o] = Some(next);
            }
        }
        self.lens[o] -= 1;
        self.vacant.push(slot);
    }
}
