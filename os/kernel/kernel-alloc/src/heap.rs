//! # Boundary-tag kernel heap
//!
//! A first-fit allocator over one contiguous virtual window. Every chunk is
//! framed by two 4-byte [`BoundaryTag`]s carrying its body size and an
//! occupied flag:
//!
//! ```text
//!  offset 0   4         8                     8+N      12+N
//!  +--------+--------+---------------------+--------+--------+--
//!  |sentinel| prefix |        body         | suffix | prefix | ...
//!  +--------+--------+---------------------+--------+--------+--
//!                     ^ 8-byte aligned      ^ same value as prefix
//! ```
//!
//! Free chunks are threaded into [`HEAP_NUM_BUCKETS`] segregated lists; bucket
//! `i` holds bodies in `[2^(i+3), 2^(i+4))`, the last bucket everything
//! larger. The list links live in the first 8 bytes of the free body and are
//! stored as offsets from the heap base, with `0` as the null link (offset 0
//! is the sentinel tag and never a chunk).
//!
//! The heap only grows at its tail. When no free chunk fits, a new chunk with
//! a power-of-two body is appended; when a freed chunk ends at the tail, the
//! heap shrinks instead of filing it.
//!
//! [`Heap`] itself is not synchronized; see [`LockedHeap`].

mod boundary_tag;
mod locked;

pub use boundary_tag::BoundaryTag;
pub use locked::LockedHeap;

use core::fmt;
use core::ptr::NonNull;
use kernel_info::memory::HEAP_NUM_BUCKETS;
use log::trace;

/// Size of one boundary tag.
pub const TAG_SIZE: u32 = 4;

/// Prefix plus suffix.
pub const CHUNK_OVERHEAD: u32 = 2 * TAG_SIZE;

/// Smallest body handed out; fits the two free-list links.
pub const MIN_BODY: u32 = 8;

/// Smallest chunk that can stand on its own, tags included.
pub const MIN_CHUNK: u32 = MIN_BODY + CHUNK_OVERHEAD;

/// Alignment of every body.
pub const HEAP_ALIGN: usize = 8;

/// Largest heap window; chunk sizes are 31-bit values.
pub const MAX_HEAP_SIZE: usize = 1 << 30;

/// Offset of the first chunk's prefix.
const FIRST_CHUNK: u32 = TAG_SIZE;

/// Null free-list link.
const NIL: u32 = 0;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("heap exhausted while allocating {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("pointer {0:#x} was not handed out by this heap")]
    ForeignPointer(usize),
    #[error("heap base must be 8-byte aligned")]
    MisalignedRegion,
    #[error("heap window of {0} bytes exceeds the 1 GiB maximum")]
    RegionTooLarge(usize),
    #[error("heap used before it was initialized")]
    Uninitialized,
    #[error("heap corrupted at offset {offset:#x}")]
    Corrupted { offset: u32 },
}

/// One chunk as seen by [`Heap::chunks`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Offset of the prefix tag from the heap base.
    pub offset: u32,
    /// Body size in bytes.
    pub size: u32,
    pub occupied: bool,
}

impl ChunkInfo {
    /// Offset of the body from the heap base.
    #[must_use]
    pub const fn body_offset(&self) -> u32 {
        self.offset + TAG_SIZE
    }
}

pub struct Heap {
    base: NonNull<u8>,
    limit: u32,
    /// Bytes in use from `base`, sentinel included. Always a chunk boundary.
    current_size: u32,
    buckets: [u32; HEAP_NUM_BUCKETS],
}

// The heap exclusively owns its window.
unsafe impl Send for Heap {}

impl Heap {
    /// Set up an empty heap over `[base, base + limit)`.
    ///
    /// Only the sentinel tag is written; the rest of the window is touched as
    /// the heap grows into it.
    ///
    /// # Errors
    /// [`HeapError::MisalignedRegion`] if `base` is not 8-byte aligned,
    /// [`HeapError::RegionTooLarge`] if `limit` exceeds [`MAX_HEAP_SIZE`] and
    /// [`HeapError::OutOfMemory`] if the window cannot hold the sentinel.
    ///
    /// # Safety
    /// The window must be valid for reads and writes, not used by anyone else
    /// for the lifetime of the heap.
    pub unsafe fn new(base: NonNull<u8>, limit: usize) -> Result<Self, HeapError> {
        if !base.as_ptr().addr().is_multiple_of(HEAP_ALIGN) {
            return Err(HeapError::MisalignedRegion);
        }
        if limit > MAX_HEAP_SIZE {
            return Err(HeapError::RegionTooLarge(limit));
        }
        if limit < TAG_SIZE as usize {
            return Err(HeapError::OutOfMemory { requested: TAG_SIZE as usize });
        }

        #[allow(clippy::cast_possible_truncation)]
        let mut heap = Self {
            base,
            limit: limit as u32,
            current_size: FIRST_CHUNK,
            buckets: [NIL; HEAP_NUM_BUCKETS],
        };
        heap.write_tag(0, BoundaryTag::SENTINEL);
        Ok(heap)
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit as usize
    }

    /// High-water mark in bytes, sentinel included.
    #[inline]
    #[must_use]
    pub const fn current_size(&self) -> usize {
        self.current_size as usize
    }

    /// Allocate at least `bytes` bytes, 8-byte aligned.
    ///
    /// Requests are rounded up to a multiple of 8 and to at least 8 bytes.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] when no free chunk fits and growing the
    /// heap would pass its limit.
    pub fn allocate(&mut self, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        let size = Self::round_request(bytes)?;
        let chunk = match self.find_fit(size) {
            Some(chunk) => {
                self.detach(chunk);
                self.carve(chunk, size);
                chunk
            }
            None => self.grow(size).ok_or(HeapError::OutOfMemory { requested: bytes })?,
        };
        trace!("heap: {bytes} bytes at chunk {chunk:#x}");
        Ok(self.body_ptr(chunk))
    }

    /// Like [`allocate`](Self::allocate), with the whole body zeroed.
    ///
    /// # Errors
    /// As [`allocate`](Self::allocate).
    pub fn zeroed_allocate(&mut self, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        let ptr = self.allocate(bytes)?;
        let size = self.body_size(ptr)?;
        // SAFETY: the body was just handed out and spans `size` bytes.
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    /// Allocate `bytes` bytes whose address is a multiple of `alignment`.
    ///
    /// Over-allocates `bytes + alignment + 8`, then gives the unaligned lead
    /// back to the chunk in front and the unused tail back to the heap.
    ///
    /// # Errors
    /// [`HeapError::InvalidAlignment`] if `alignment` is not a power of two,
    /// otherwise as [`allocate`](Self::allocate).
    pub fn aligned_allocate(&mut self, alignment: usize, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        if !alignment.is_power_of_two() {
            return Err(HeapError::InvalidAlignment(alignment));
        }
        if alignment <= HEAP_ALIGN {
            return self.allocate(bytes);
        }

        let size = Self::round_request(bytes)?;
        let align = u32::try_from(alignment).map_err(|_| HeapError::OutOfMemory { requested: bytes })?;
        let over = (size as usize)
            .checked_add(alignment + CHUNK_OVERHEAD as usize)
            .ok_or(HeapError::OutOfMemory { requested: bytes })?;

        let ptr = self.allocate(over)?;
        let chunk = self.chunk_of(ptr)?;
        let total = self.read_tag(chunk).size();

        let body = ptr.as_ptr().addr();
        #[allow(clippy::cast_possible_truncation)]
        let mut lead = (body.next_multiple_of(alignment) - body) as u32;
        if lead == 0 {
            self.trim_tail(chunk, size);
            return Ok(ptr);
        }

        if chunk == FIRST_CHUNK {
            // Nothing in front to absorb the lead; it has to stand on its own.
            if lead < MIN_CHUNK {
                lead += align;
            }
            self.write_tags(chunk, BoundaryTag::free_with(lead - CHUNK_OVERHEAD));
            self.push_free(chunk);
        } else {
            let left_tag = self.read_tag(chunk - TAG_SIZE);
            let left = chunk - CHUNK_OVERHEAD - left_tag.size();
            if !left_tag.occupied() {
                self.detach(left);
            }
            let grown = left_tag.with_size(left_tag.size() + lead);
            self.write_tags(left, grown);
            if !grown.occupied() {
                self.push_free(left);
            }
        }

        let aligned = chunk + lead;
        self.write_tags(aligned, BoundaryTag::occupied_with(total - lead));
        self.trim_tail(aligned, size);
        trace!("heap: {bytes} bytes aligned to {alignment} at chunk {aligned:#x}");
        Ok(self.body_ptr(aligned))
    }

    /// Return a body to the heap.
    ///
    /// Coalesces with free neighbors on both sides. A chunk that ends at the
    /// tail shrinks the heap instead of being filed.
    ///
    /// # Errors
    /// [`HeapError::ForeignPointer`] if `ptr` is not a body of this heap.
    ///
    /// # Panics
    /// If the chunk is not occupied or its tags disagree.
    ///
    /// # Safety
    /// `ptr` must come from this heap and must not be used afterwards.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let chunk = self.chunk_of(ptr)?;
        let tag = self.read_tag(chunk);
        assert!(tag.occupied(), "heap: free of unoccupied chunk at {chunk:#x}");
        let end = self.chunk_end(chunk, tag.size());
        assert!(
            end <= self.current_size && self.read_tag(end - TAG_SIZE) == tag,
            "heap: boundary tags of chunk at {chunk:#x} disagree"
        );

        let mut start = chunk;
        let mut size = tag.size();

        let left_tag = self.read_tag(chunk - TAG_SIZE);
        if !left_tag.occupied() {
            let left = chunk - CHUNK_OVERHEAD - left_tag.size();
            self.detach(left);
            start = left;
            size += left_tag.size() + CHUNK_OVERHEAD;
        }

        if end < self.current_size {
            let right_tag = self.read_tag(end);
            if !right_tag.occupied() {
                self.detach(end);
                size += right_tag.size() + CHUNK_OVERHEAD;
            }
        }

        if self.chunk_end(start, size) == self.current_size {
            trace!("heap: shrinking from {:#x} to {start:#x}", self.current_size);
            self.current_size = start;
        } else {
            self.write_tags(start, BoundaryTag::free_with(size));
            self.push_free(start);
        }
        Ok(())
    }

    /// Usable size of the body at `ptr`.
    ///
    /// # Errors
    /// [`HeapError::ForeignPointer`] if `ptr` is not a body of this heap.
    pub fn body_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        let chunk = self.chunk_of(ptr)?;
        Ok(self.read_tag(chunk).size() as usize)
    }

    /// Walk all chunks from the first to the tail.
    ///
    /// Stops early at a tag that would lead outside the heap; use
    /// [`sanity_check`](Self::sanity_check) to tell that apart from a clean end.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkInfo> + '_ {
        let mut offset = FIRST_CHUNK;
        core::iter::from_fn(move || {
            if offset >= self.current_size {
                return None;
            }
            let tag = self.read_tag(offset);
            let end = self.chunk_end(offset, tag.size());
            if end > self.current_size {
                return None;
            }
            let info = ChunkInfo {
                offset,
                size: tag.size(),
                occupied: tag.occupied(),
            };
            offset = end;
            Some(info)
        })
    }

    /// Number of chunks currently on the free lists.
    #[must_use]
    pub fn free_chunk_count(&self) -> usize {
        (0..HEAP_NUM_BUCKETS).map(|b| self.bucket_iter(b).count()).sum()
    }

    /// Verify the heap's structure.
    ///
    /// Checks the sentinel, that chunks tile `[4, current_size)` exactly with
    /// matching tags, and that every free chunk sits in the right bucket with
    /// consistent back links and nothing else does.
    ///
    /// # Errors
    /// [`HeapError::Corrupted`] naming the first bad offset.
    pub fn sanity_check(&self) -> Result<(), HeapError> {
        if self.read_tag(0) != BoundaryTag::SENTINEL {
            return Err(HeapError::Corrupted { offset: 0 });
        }

        let mut offset = FIRST_CHUNK;
        let mut free_in_walk = 0usize;
        while offset < self.current_size {
            let tag = self.read_tag(offset);
            if tag.size() < MIN_BODY || !tag.size().is_multiple_of(HEAP_ALIGN as u32) {
                return Err(HeapError::Corrupted { offset });
            }
            let end = self.chunk_end(offset, tag.size());
            if end > self.current_size || self.read_tag(end - TAG_SIZE) != tag {
                return Err(HeapError::Corrupted { offset });
            }
            if !tag.occupied() {
                free_in_walk += 1;
            }
            offset = end;
        }
        if offset != self.current_size {
            return Err(HeapError::Corrupted { offset });
        }

        let mut free_in_lists = 0usize;
        for (bucket, &head) in self.buckets.iter().enumerate() {
            let mut prev = NIL;
            let mut chunk = head;
            while chunk != NIL {
                free_in_lists += 1;
                if free_in_lists > free_in_walk
                    || chunk >= self.current_size
                    || chunk % 8 != FIRST_CHUNK
                    || self.prev_link(chunk) != prev
                {
                    return Err(HeapError::Corrupted { offset: chunk });
                }
                let tag = self.read_tag(chunk);
                if tag.occupied() || Self::bucket_of(tag.size()) != bucket {
                    return Err(HeapError::Corrupted { offset: chunk });
                }
                prev = chunk;
                chunk = self.next_link(chunk);
            }
        }
        if free_in_lists == free_in_walk {
            Ok(())
        } else {
            Err(HeapError::Corrupted { offset: self.current_size })
        }
    }

    /// Write a human-readable chunk listing to `out`.
    ///
    /// # Errors
    /// Whatever `out` returns.
    pub fn dump(&self, out: &mut impl fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "heap @ {:p}: {:#x} of {:#x} bytes used",
            self.base, self.current_size, self.limit
        )?;
        for chunk in self.chunks() {
            if chunk.occupied {
                writeln!(out, "  {:#010x} {:>10} used", chunk.offset, chunk.size)?;
            } else {
                writeln!(
                    out,
                    "  {:#010x} {:>10} free  prev={:#x} next={:#x}",
                    chunk.offset,
                    chunk.size,
                    self.prev_link(chunk.offset),
                    self.next_link(chunk.offset)
                )?;
            }
        }
        for (bucket, &head) in self.buckets.iter().enumerate() {
            if head != NIL {
                writeln!(out, "  bucket {bucket:>2}: {} chunks", self.bucket_iter(bucket).count())?;
            }
        }
        Ok(())
    }

    /// Move the heap to a new base after its window was remapped there.
    ///
    /// All bookkeeping is base-relative, so only the base changes.
    ///
    /// # Errors
    /// [`HeapError::MisalignedRegion`] if `new_base` is not 8-byte aligned.
    ///
    /// # Safety
    /// `[new_base, new_base + limit)` must hold the same bytes as the old
    /// window and must not be used by anyone else. Bodies handed out before
    /// the move are only valid at their new addresses.
    pub unsafe fn relocate(&mut self, new_base: NonNull<u8>) -> Result<(), HeapError> {
        if !new_base.as_ptr().addr().is_multiple_of(HEAP_ALIGN) {
            return Err(HeapError::MisalignedRegion);
        }
        self.base = new_base;
        Ok(())
    }

    /// Free-list bucket of a free chunk with body `size`: `floor(log2) - 3`.
    #[must_use]
    pub const fn bucket_of(size: u32) -> usize {
        let size = if size < MIN_BODY { MIN_BODY } else { size };
        let log = (u32::BITS - 1 - size.leading_zeros()) as usize;
        let bucket = log - 3;
        if bucket < HEAP_NUM_BUCKETS {
            bucket
        } else {
            HEAP_NUM_BUCKETS - 1
        }
    }

    /// First bucket searched for a request of `size`: `ceil(log2) - 3`.
    /// Every chunk filed there or higher is at least `size` bytes, except in
    /// the open-ended last bucket.
    const fn first_bucket_for(size: u32) -> usize {
        let size = if size < MIN_BODY { MIN_BODY } else { size };
        let log = (u32::BITS - (size - 1).leading_zeros()) as usize;
        let bucket = log - 3;
        if bucket < HEAP_NUM_BUCKETS {
            bucket
        } else {
            HEAP_NUM_BUCKETS - 1
        }
    }

    fn round_request(bytes: usize) -> Result<u32, HeapError> {
        if bytes > MAX_HEAP_SIZE {
            return Err(HeapError::OutOfMemory { requested: bytes });
        }
        #[allow(clippy::cast_possible_truncation)]
        let size = bytes.next_multiple_of(HEAP_ALIGN) as u32;
        Ok(size.max(MIN_BODY))
    }

    fn find_fit(&self, size: u32) -> Option<u32> {
        (Self::first_bucket_for(size)..HEAP_NUM_BUCKETS)
            .flat_map(|bucket| self.bucket_iter(bucket))
            .find(|&chunk| self.read_tag(chunk).size() >= size)
    }

    /// Mark the detached free `chunk` occupied with a body of at least
    /// `size`, splitting off the rest when it can stand on its own.
    fn carve(&mut self, chunk: u32, size: u32) {
        let total = self.read_tag(chunk).size();
        if total - size >= MIN_CHUNK {
            self.write_tags(chunk, BoundaryTag::occupied_with(size));
            let rest = self.chunk_end(chunk, size);
            self.write_tags(rest, BoundaryTag::free_with(total - size - CHUNK_OVERHEAD));
            self.push_free(rest);
        } else {
            self.write_tags(chunk, BoundaryTag::occupied_with(total));
        }
    }

    /// Shrink the occupied `chunk` to `size` if the excess can stand on its
    /// own, returning the excess to the heap.
    fn trim_tail(&mut self, chunk: u32, size: u32) {
        let total = self.read_tag(chunk).size();
        if total - size < MIN_CHUNK {
            return;
        }
        self.write_tags(chunk, BoundaryTag::occupied_with(size));
        let rest = self.chunk_end(chunk, size);
        let mut rest_size = total - size - CHUNK_OVERHEAD;

        let end = self.chunk_end(rest, rest_size);
        if end == self.current_size {
            self.current_size = rest;
            return;
        }
        let right_tag = self.read_tag(end);
        if !right_tag.occupied() {
            self.detach(end);
            rest_size += right_tag.size() + CHUNK_OVERHEAD;
        }
        self.write_tags(rest, BoundaryTag::free_with(rest_size));
        self.push_free(rest);
    }

    /// Append a chunk with a power-of-two body of at least `size` bytes.
    /// Falls back to exactly `size` when the power of two does not fit.
    fn grow(&mut self, size: u32) -> Option<u32> {
        let chunk = self.current_size;
        let room = self.limit.checked_sub(chunk + CHUNK_OVERHEAD)?;
        let body = match size.checked_next_power_of_two() {
            Some(pow) if pow <= room => pow,
            _ if size <= room => size,
            _ => return None,
        };
        self.write_tags(chunk, BoundaryTag::occupied_with(body));
        self.current_size = self.chunk_end(chunk, body);
        trace!("heap: grew to {:#x}", self.current_size);
        Some(chunk)
    }

    fn push_free(&mut self, chunk: u32) {
        let bucket = Self::bucket_of(self.read_tag(chunk).size());
        let head = self.buckets[bucket];
        self.set_prev_link(chunk, NIL);
        self.set_next_link(chunk, head);
        if head != NIL {
            self.set_prev_link(head, chunk);
        }
        self.buckets[bucket] = chunk;
    }

    /// Unlink a free chunk. Its tags must still hold the size it was filed with.
    fn detach(&mut self, chunk: u32) {
        let bucket = Self::bucket_of(self.read_tag(chunk).size());
        let prev = self.prev_link(chunk);
        let next = self.next_link(chunk);
        if prev == NIL {
            debug_assert_eq!(self.buckets[bucket], chunk, "free list head mismatch");
            self.buckets[bucket] = next;
        } else {
            self.set_next_link(prev, next);
        }
        if next != NIL {
            self.set_prev_link(next, prev);
        }
    }

    fn bucket_iter(&self, bucket: usize) -> impl Iterator<Item = u32> + '_ {
        let mut chunk = self.buckets[bucket];
        core::iter::from_fn(move || {
            if chunk == NIL {
                return None;
            }
            let current = chunk;
            chunk = self.next_link(current);
            Some(current)
        })
    }

    /// Chunk whose body starts at `ptr`.
    fn chunk_of(&self, ptr: NonNull<u8>) -> Result<u32, HeapError> {
        let addr = ptr.as_ptr().addr();
        let offset = addr
            .checked_sub(self.base.as_ptr().addr())
            .filter(|&off| off >= (FIRST_CHUNK + TAG_SIZE) as usize)
            .filter(|&off| off < self.current_size as usize)
            .filter(|off| off.is_multiple_of(HEAP_ALIGN))
            .ok_or(HeapError::ForeignPointer(addr))?;
        #[allow(clippy::cast_possible_truncation)]
        Ok(offset as u32 - TAG_SIZE)
    }

    #[inline]
    const fn chunk_end(&self, chunk: u32, size: u32) -> u32 {
        chunk + size + CHUNK_OVERHEAD
    }

    #[inline]
    fn body_ptr(&self, chunk: u32) -> NonNull<u8> {
        // SAFETY: chunks lie inside the window.
        unsafe { self.base.add((chunk + TAG_SIZE) as usize) }
    }

    #[inline]
    fn read_word(&self, offset: u32) -> u32 {
        debug_assert!(offset.is_multiple_of(TAG_SIZE) && offset < self.limit);
        // SAFETY: offsets are 4-aligned and inside the window.
        unsafe { self.base.add(offset as usize).cast::<u32>().read() }
    }

    #[inline]
    fn write_word(&mut self, offset: u32, value: u32) {
        debug_assert!(offset.is_multiple_of(TAG_SIZE) && offset < self.limit);
        // SAFETY: offsets are 4-aligned and inside the window.
        unsafe { self.base.add(offset as usize).cast::<u32>().write(value) }
    }

    #[inline]
    fn read_tag(&self, offset: u32) -> BoundaryTag {
        BoundaryTag::from_bits(self.read_word(offset))
    }

    #[inline]
    fn write_tag(&mut self, offset: u32, tag: BoundaryTag) {
        self.write_word(offset, tag.into_bits());
    }

    /// Write both tags of the chunk at `chunk`.
    fn write_tags(&mut self, chunk: u32, tag: BoundaryTag) {
        self.write_tag(chunk, tag);
        self.write_tag(chunk + TAG_SIZE + tag.size(), tag);
    }

    #[inline]
    fn prev_link(&self, chunk: u32) -> u32 {
        self.read_word(chunk + TAG_SIZE)
    }

    #[inline]
    fn next_link(&self, chunk: u32) -> u32 {
        self.read_word(chunk + 2 * TAG_SIZE)
    }

    #[inline]
    fn set_prev_link(&mut self, chunk: u32, prev: u32) {
        self.write_word(chunk + TAG_SIZE, prev);
    }

    #[inline]
    fn set_next_link(&mut self, chunk: u32, next: u32) {
        self.write_word(chunk + 2 * TAG_SIZE, next);
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("base", &self.base)
            .field("limit", &self.limit)
            .field("current_size", &self.current_size)
            .finish_non_exhaustive()
    }
}
