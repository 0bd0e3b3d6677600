#![doc = include_str!("../README.md")]
#![cfg_attr(not(any(test, fuzzing)), no_std)]

#[cfg(feature = "lock_api")]
mod tagallock;

mod arena;
mod block;
mod span;

pub use arena::Arena;
pub use span::Span;
#[cfg(feature = "lock_api")]
pub use tagallock::{AssumeUnlockable, Tagallock};

use block::*;
use core::ptr::{null_mut, NonNull};

// Block layout, sizes in bytes, `bp` being the payload pointer:
//
//   bp-4                          bp+size-8
//   | header u32 | payload ...... | footer u32 |
//
// Free blocks keep the list links at the start of the payload:
//
//   | header u32 | next ptr | prev ptr | .. | footer u32 |
//
// Header and footer both hold (size | alloc); size counts the whole
// block including both tags, so either end reaches the other.
//
// The heap proper is bracketed by two permanently-allocated sentinels: an
// 8-byte prologue (header + footer, no payload) behind a 4-byte pad, and
// a zero-size epilogue header rewritten at the break on every extension.
// Coalescing reads a neighbor tag on both sides of any real block, and
// the sentinels make those reads valid at the boundaries.

/// A violated heap invariant, as reported by [`Tagalloc::check`].
///
/// Variants carry the offending block's payload offset from the arena
/// base where one exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// `init` has not succeeded yet.
    Uninitialized,
    /// The prologue sentinel is damaged.
    BadPrologue,
    /// The epilogue is missing, free, or not flush against the break.
    BadEpilogue,
    /// A block's payload is not 8-byte aligned.
    MisalignedPayload(usize),
    /// A block's size is not a multiple of 8, or is less than 16.
    BadBlockSize(usize),
    /// A block's header and footer words disagree.
    TagMismatch(usize),
    /// A block extends past the mapped arena.
    OutOfBounds(usize),
    /// Two physically adjacent blocks are both free.
    AdjacentFree(usize),
    /// A heap block is marked free but absent from the free list.
    UnlistedFreeBlock(usize),
    /// A free-list node is not marked free.
    LinkedButAllocated(usize),
    /// A node's prev link does not match its list predecessor.
    BrokenLinks(usize),
    /// The free list's next links form a cycle.
    FreeListCycle,
    /// The free list and the heap walk disagree on the free block count.
    FreeCountMismatch { walked: usize, listed: usize },
}

/// The boundary-tag allocator.
///
/// One way to get started:
/// 1. Construct with [`new`](Tagalloc::new).
/// 2. Hand it memory with [`init`](Tagalloc::init).
/// 3. Either call [`malloc`](Tagalloc::malloc)/[`free`](Tagalloc::free)
///    directly, or [`lock`](Tagalloc::lock) it into a [`Tagallock`] for
///    use as a [`GlobalAlloc`](core::alloc::GlobalAlloc).
///
/// Placement is first-fit over an explicit LIFO free list; freed blocks
/// are merged with free physical neighbors immediately.
pub struct Tagalloc {
    arena: Arena,

    /// Prologue payload; anchor for physical heap walks. Null until
    /// `init` succeeds.
    heap_base: *mut u8,

    /// Head of the explicit free list; null when the list is empty.
    free_head: *mut u8,
}

unsafe impl Send for Tagalloc {}

impl Default for Tagalloc {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Tagalloc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tagalloc")
            .field("arena", &self.arena)
            .field("heap_base", &self.heap_base)
            .field("free_head", &self.free_head)
            .finish()
    }
}

/// Map a requested payload size to a block size: room for both tags,
/// rounded up to the 8-byte unit, never less than 16.
///
/// Note the floor really is 16, not [`MIN_BLOCK_SIZE`]: a 16-byte
/// allocated block has no room for list links on 64-bit targets, but it
/// also never needs them while allocated, and when freed it normally
/// merges with the free split residue it was carved next to. Raising the
/// floor here would waste a word on every small request, so the 24-byte
/// threshold applies only to splitting, in `place`. The residual hazard:
/// on 64-bit, freeing a 16-byte block while BOTH physical neighbors are
/// live writes its prev link over its own footer and the next header.
/// Callers of a minimum-size allocation must not arrange that exact
/// pattern.
fn adjust(size: usize) -> Option<usize> {
    if size == 0 {
        None
    } else if size <= DSIZE {
        Some(2 * DSIZE)
    } else {
        size.checked_add(DSIZE + (DSIZE - 1)).map(|s| s & !(DSIZE - 1))
    }
}

impl Tagalloc {
    /// Returns an allocator over no memory. Allocation fails until
    /// [`init`](Tagalloc::init) succeeds.
    pub const fn new() -> Self {
        Self { arena: Arena::unclaimed(), heap_base: null_mut(), free_head: null_mut() }
    }

    /// Claim `memory` and build the initial heap in it: sentinels plus
    /// one `CHUNKSIZE`d free block.
    ///
    /// The usable region is `memory` aligned inward to 8 bytes and capped
    /// at 8 MiB; regions with less than `CHUNKSIZE + 16` bytes left after
    /// alignment fail. Calling `init` again abandons the old region
    /// entirely and starts over in the new one.
    ///
    /// # Safety
    /// `memory` must be valid for reads and writes for as long as this
    /// allocator is in use, and must not overlap memory in use by
    /// anything else.
    pub unsafe fn init(&mut self, memory: Span) -> Result<(), ()> {
        self.heap_base = null_mut();
        self.free_head = null_mut();
        self.arena = Arena::claim(memory)?;

        let start = self.arena.extend((4 * WSIZE) as i32)?;
        put(start, 0); // alignment padding
        put(start.add(WSIZE), pack(DSIZE, true)); // prologue header
        put(start.add(2 * WSIZE), pack(DSIZE, true)); // prologue footer
        put(start.add(3 * WSIZE), pack(0, true)); // epilogue header
        self.heap_base = start.add(2 * WSIZE);

        self.extend_heap(CHUNKSIZE / WSIZE)?;

        self.scan_for_errors();
        Ok(())
    }

    /// Allocate `size` bytes of 8-byte-aligned payload.
    ///
    /// Fails for `size == 0` and when the arena cannot cover the request.
    ///
    /// # Safety
    /// [`init`](Tagalloc::init) memory conditions must still hold.
    pub unsafe fn malloc(&mut self, size: usize) -> Result<NonNull<u8>, ()> {
        let asize = adjust(size).ok_or(())?;

        let bp = match self.find_fit(asize) {
            Some(bp) => bp,
            None => self.extend_heap(asize.max(CHUNKSIZE) / WSIZE)?,
        };
        self.place(bp, asize);

        self.scan_for_errors();
        Ok(NonNull::new_unchecked(bp))
    }

    /// Free an allocation. Null is a no-op.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer previously returned by
    /// [`malloc`](Tagalloc::malloc)/[`realloc`](Tagalloc::realloc) of
    /// this allocator and not freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let size = tag_size(header_of(ptr));
        put(header_of(ptr), pack(size, false));
        put(footer_of(ptr), pack(size, false));
        self.coalesce(ptr);

        self.scan_for_errors();
    }

    /// Resize an allocation, moving it if need be.
    ///
    /// A null `ptr` is plain allocation; `size == 0` frees `ptr` and
    /// fails. On failure the original allocation is untouched. The
    /// resized block always relocates and copies — no in-place growth.
    ///
    /// # Safety
    /// As [`free`](Tagalloc::free).
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> Result<NonNull<u8>, ()> {
        if ptr.is_null() {
            return self.malloc(size);
        }
        if size == 0 {
            self.free(ptr);
            return Err(());
        }

        let new = self.malloc(size)?;
        let old_payload = tag_size(header_of(ptr)) - DSIZE;
        new.as_ptr().copy_from_nonoverlapping(ptr, size.min(old_payload));
        self.free(ptr);
        Ok(new)
    }

    /// Shared access to the arena's bounds and size queries.
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Round `words` up to an even count, take that many 4-byte words
    /// from the arena and format them as one free block, re-terminating
    /// the heap with a fresh epilogue. Returns the block after merging
    /// with a free block that was trailing the old epilogue, if any.
    unsafe fn extend_heap(&mut self, words: usize) -> Result<*mut u8, ()> {
        let words = words + (words & 1);
        let size = words.checked_mul(WSIZE).ok_or(())?;
        let incr = i32::try_from(size).map_err(|_| ())?;

        // the old break is 4 bytes past the old epilogue header, so it is
        // exactly the payload pointer of the block being formatted, with
        // the old epilogue overwritten as its header
        let bp = self.arena.extend(incr)?;

        put(header_of(bp), pack(size, false));
        put(footer_of(bp), pack(size, false));
        put(header_of(next_block(bp)), pack(0, true)); // new epilogue

        Ok(self.coalesce(bp))
    }

    /// Merge `bp` with any free physical neighbor, then push the result
    /// onto the free list.
    ///
    /// `bp`'s tags must already read free, and `bp` must not be on the
    /// list: this is the single entry point for inserting freed blocks.
    unsafe fn coalesce(&mut self, bp: *mut u8) -> *mut u8 {
        // the word below bp's header is the previous block's footer
        let prev_alloc = is_allocated(bp.sub(DSIZE));
        let next_alloc = is_allocated(header_of(next_block(bp)));
        let mut size = tag_size(header_of(bp));
        let mut bp = bp;

        match (prev_alloc, next_alloc) {
            (true, true) => {}

            (true, false) => {
                let next = next_block(bp);
                self.unlink_free(next);
                size += tag_size(header_of(next));
                put(header_of(bp), pack(size, false));
                // bp's header now carries the merged size, so this lands
                // on the absorbed neighbor's footer
                put(footer_of(bp), pack(size, false));
            }

            (false, true) => {
                // resolve before any write: prev_block reads through bp's
                // low neighbor footer
                let prev = prev_block(bp);
                self.unlink_free(prev);
                size += tag_size(header_of(prev));
                put(header_of(prev), pack(size, false));
                put(footer_of(bp), pack(size, false));
                bp = prev;
            }

            (false, false) => {
                let prev = prev_block(bp);
                let next = next_block(bp);
                self.unlink_free(prev);
                self.unlink_free(next);
                size += tag_size(header_of(prev)) + tag_size(header_of(next));
                put(header_of(prev), pack(size, false));
                put(footer_of(next), pack(size, false));
                bp = prev;
            }
        }

        self.push_free(bp);
        bp
    }

    /// First fit: the first list entry large enough wins.
    unsafe fn find_fit(&self, asize: usize) -> Option<*mut u8> {
        let mut bp = self.free_head;
        while !bp.is_null() {
            if tag_size(header_of(bp)) >= asize {
                return Some(bp);
            }
            bp = next_link(bp);
        }
        None
    }

    /// Allocate `asize` bytes at the free block `bp`, splitting off the
    /// tail when it can stand alone as a list member.
    ///
    /// The split residue is pushed directly, not coalesced: its high
    /// neighbor cannot be free, since `bp` itself was.
    unsafe fn place(&mut self, bp: *mut u8, asize: usize) {
        let csize = tag_size(header_of(bp));
        self.unlink_free(bp);

        if csize - asize >= MIN_BLOCK_SIZE {
            put(header_of(bp), pack(asize, true));
            put(footer_of(bp), pack(asize, true));
            let rest = next_block(bp);
            put(header_of(rest), pack(csize - asize, false));
            put(footer_of(rest), pack(csize - asize, false));
            self.push_free(rest);
        } else {
            put(header_of(bp), pack(csize, true));
            put(footer_of(bp), pack(csize, true));
        }
    }

    /// LIFO insertion at the list head.
    unsafe fn push_free(&mut self, bp: *mut u8) {
        set_next_link(bp, self.free_head);
        set_prev_link(bp, null_mut());
        if !self.free_head.is_null() {
            set_prev_link(self.free_head, bp);
        }
        self.free_head = bp;
    }

    /// Unlink `bp` from the free list. Its link fields are garbage
    /// afterwards; callers must not read them.
    unsafe fn unlink_free(&mut self, bp: *mut u8) {
        let prev = prev_link(bp);
        let next = next_link(bp);

        if prev.is_null() {
            self.free_head = next;
        } else {
            set_next_link(prev, next);
        }
        if !next.is_null() {
            set_prev_link(next, prev);
        }
    }

    /// Walk the whole heap and the whole free list, reporting the first
    /// violated invariant.
    ///
    /// Checks: sentinel integrity, block alignment and sizing, header ==
    /// footer, blocks confined to the mapped arena with the epilogue
    /// flush against the break, no two adjacent free blocks, a
    /// consistently doubly-linked cycle-free list, and heap/list
    /// agreement on the set of free blocks.
    pub fn check(&self) -> Result<(), CheckError> {
        use CheckError::*;

        if self.heap_base.is_null() {
            return Err(Uninitialized);
        }

        unsafe {
            let lo = self.arena.lo() as usize;
            let brk = self.arena.brk() as usize;

            if tag_size(header_of(self.heap_base)) != DSIZE
                || !is_allocated(header_of(self.heap_base))
                || get(header_of(self.heap_base)) != get(footer_of(self.heap_base))
            {
                return Err(BadPrologue);
            }

            let mut walked = 0usize;
            let mut prev_was_free = false;
            let mut bp = next_block(self.heap_base);

            loop {
                let off = bp as usize - lo;
                let hdr = header_of(bp);
                if (hdr as usize) < lo || hdr as usize + WSIZE > brk {
                    return Err(OutOfBounds(off));
                }

                let size = tag_size(hdr);
                if size == 0 {
                    // the epilogue terminates the walk; it must be
                    // allocated and sit exactly at the high water mark
                    if !is_allocated(hdr) || hdr as usize + WSIZE != brk {
                        return Err(BadEpilogue);
                    }
                    break;
                }

                if bp as usize % DSIZE != 0 {
                    return Err(MisalignedPayload(off));
                }
                if size % DSIZE != 0 || size < 2 * DSIZE {
                    return Err(BadBlockSize(off));
                }

                let ftr = bp.add(size).sub(DSIZE);
                if ftr as usize + WSIZE > brk {
                    return Err(OutOfBounds(off));
                }
                if get(hdr) != get(ftr) {
                    return Err(TagMismatch(off));
                }

                if !is_allocated(hdr) {
                    if prev_was_free {
                        return Err(AdjacentFree(off));
                    }
                    if !self.in_free_list(bp) {
                        return Err(UnlistedFreeBlock(off));
                    }
                    walked += 1;
                    prev_was_free = true;
                } else {
                    prev_was_free = false;
                }

                bp = next_block(bp);
            }

            let mut listed = 0usize;
            let mut prev = null_mut::<u8>();
            let mut node = self.free_head;
            while !node.is_null() {
                listed += 1;
                if listed > self.list_limit() {
                    return Err(FreeListCycle);
                }

                let off = node as usize - lo;
                if !self.arena.contains(node) {
                    return Err(OutOfBounds(off));
                }
                if is_allocated(header_of(node)) {
                    return Err(LinkedButAllocated(off));
                }
                if prev_link(node) != prev {
                    return Err(BrokenLinks(off));
                }

                prev = node;
                node = next_link(node);
            }

            if listed != walked {
                return Err(FreeCountMismatch { walked, listed });
            }
        }

        Ok(())
    }

    /// Linear list membership scan used by `check`; bounded so that a
    /// cyclic list cannot hang it.
    unsafe fn in_free_list(&self, bp: *mut u8) -> bool {
        let mut node = self.free_head;
        let mut steps = 0usize;
        while !node.is_null() && steps <= self.list_limit() {
            if node == bp {
                return true;
            }
            node = next_link(node);
            steps += 1;
        }
        false
    }

    /// More list nodes than could possibly fit in the arena means a cycle.
    fn list_limit(&self) -> usize {
        self.arena.size() / (2 * DSIZE) + 1
    }

    #[cfg(not(debug_assertions))]
    fn scan_for_errors(&self) {}

    /// Debugging hook for validating the heap after every mutation.
    #[cfg(debug_assertions)]
    fn scan_for_errors(&self) {
        if !self.heap_base.is_null() {
            if let Err(violation) = self.check() {
                panic!("heap corrupted: {:?}", violation);
            }
        }
    }

    /// Wrap in [`Tagallock`], a mutex-locked wrapper struct using
    /// [`lock_api`], which implements
    /// [`GlobalAlloc`](core::alloc::GlobalAlloc).
    ///
    /// # Examples
    /// ```
    /// # use tagalloc::*;
    /// let tagallock = Tagalloc::new().lock::<spin::Mutex<()>>();
    /// ```
    #[cfg(feature = "lock_api")]
    pub const fn lock<R: lock_api::RawMutex>(self) -> Tagallock<R> {
        Tagallock(lock_api::Mutex::new(self))
    }
}
