//! The explicit-list allocator: first fit over an intrusive free list.
//!
//! Free blocks double as list nodes: the first two payload words of a free
//! block hold the region offsets of the next and the previous free block.
//! Handing a block out returns those words to the caller as ordinary payload
//! bytes; the link view is only meaningful while the block is free.

use core::fmt;
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};

use crate::header::{effective_size, BlockState, Header, ALIGNMENT, MIN_PAYLOAD};
use crate::region::{BlockInfo, BlockOffset, Corruption, Region};

/// List terminator for the intrusive links and the list head.
const NIL: usize = usize::MAX;

/// Smallest block worth splitting off: a header plus the two link words the
/// block must be able to host once it is free.
const MIN_BLOCK: usize = Header::SIZE + MIN_PAYLOAD;

/// The `{next, prev}` words threaded through a free block's payload.
#[derive(Debug, Clone, Copy)]
struct FreeLink {
    next: usize,
    prev: usize,
}

/// A first-fit heap over a doubly linked list of free blocks.
///
/// The list is threaded through the payloads of the free blocks themselves
/// and kept in LIFO order: freed blocks and the tails split off during
/// allocation are pushed at the head, regardless of their address. Search
/// cost is therefore proportional to the number of free blocks, not the
/// number of blocks overall.
///
/// [`free`](Self::free) merges the freed block with its immediate right-hand
/// neighbor when that neighbor is free. The left-hand neighbor is never
/// merged (finding it would require a scan from the region start), so a
/// hole whose right side is freed later stays separate.
pub struct ExplicitHeap<'heap> {
    region: Region<'heap>,
    /// Offset of the most recently inserted free block, or [`NIL`].
    free_head: usize,
    /// Number of currently allocated blocks.
    blocks_allocated: usize,
}

// SAFETY: the heap holds the only access path to its region for 'heap;
// moving it to another thread moves that exclusive access along with it.
unsafe impl Send for ExplicitHeap<'_> {}

impl<'heap> ExplicitHeap<'heap> {
    /// Take over `memory` as the heap region, formatted as a single free
    /// block that becomes the sole free-list node.
    ///
    /// Returns `None` if the slice is smaller than 24 bytes (one header plus
    /// the two link words the initial free block must host), not 8-aligned,
    /// or not a multiple of 8 bytes long.
    pub fn new(memory: &'heap mut [MaybeUninit<u8>]) -> Option<Self> {
        let region = Region::new(memory)?;
        if region.len() < MIN_BLOCK {
            return None;
        }
        let mut heap = Self {
            region,
            free_head: NIL,
            blocks_allocated: 0,
        };
        heap.push_free(BlockOffset(0));
        Some(heap)
    }

    /// Forget all allocations and return to the just-initialized state.
    ///
    /// Payload pointers handed out earlier must not be freed afterwards.
    pub fn reset(&mut self) {
        self.region.reset();
        self.free_head = NIL;
        self.blocks_allocated = 0;
        self.push_free(BlockOffset(0));
    }

    /// Total size of the region in bytes.
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Number of currently allocated blocks.
    pub fn allocated_blocks(&self) -> usize {
        self.blocks_allocated
    }

    /// Allocate a payload of at least `requested` bytes.
    ///
    /// The effective size is `requested` rounded up to a multiple of 8 with
    /// a floor of 16 (so the block can rejoin the free list later). The
    /// free list is searched from its head and the first block large enough
    /// is taken; a block with at least 24 spare bytes is split, with the
    /// tail pushed onto the list as a new free block. Returns `None` (with
    /// the heap untouched) for requests of 0 or more than
    /// [`MAX_REQUEST`](crate::MAX_REQUEST) bytes and when no listed block
    /// fits.
    pub fn allocate(&mut self, requested: usize) -> Option<NonNull<u8>> {
        let size = effective_size(requested)?;
        let mut cursor = self.free_head;
        while cursor != NIL {
            let block = BlockOffset(cursor);
            let found = self.region.header(block).size();
            if found < size {
                cursor = self.link(block).next;
                continue;
            }
            if found >= size + MIN_BLOCK {
                self.split(block, size, found);
            } else {
                // close fit: up to 16 spare bytes, too few to split off a
                // block that could host its own links
                self.unlink(block);
                self.region.set_header(block, Header::used(found));
            }
            self.blocks_allocated += 1;
            return Some(self.region.payload(block));
        }
        None
    }

    /// Split `block` into an allocated prefix of `size` bytes and a free
    /// tail that takes the prefix's place on the list.
    fn split(&mut self, block: BlockOffset, size: usize, found: usize) {
        self.region.set_header(block, Header::used(size));
        let tail = BlockOffset(block.0 + Header::SIZE + size);
        self.region
            .set_header(tail, Header::free(found - size - Header::SIZE));
        self.push_free(tail);
        self.unlink(block);
    }

    /// Release the allocation at `ptr`. A null `ptr` is a no-op.
    ///
    /// The block rejoins the free list at the head; if the block right after
    /// it is free as well, that neighbor is unlinked and absorbed, so the
    /// freed block's successor is always allocated or the region end.
    ///
    /// # Safety
    /// `ptr` must be null or a payload pointer obtained from this heap's
    /// [`allocate`](Self::allocate)/[`reallocate`](Self::reallocate) and not
    /// freed (or invalidated by [`reset`](Self::reset)) since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: a non-null `ptr` is a live payload of this heap, per the
        // contract above.
        let block = unsafe { self.region.block_of(ptr) };
        let size = self.region.header(block).size();
        // status first, then list membership: every block on the list must
        // read as free
        self.region.set_header(block, Header::free(size));
        self.push_free(block);
        self.coalesce_forward(block);
        self.blocks_allocated -= 1;
    }

    /// Absorb the block after `block` into it, if one exists and is free.
    fn coalesce_forward(&mut self, block: BlockOffset) {
        let next = match self.region.following(block) {
            Some(next) => next,
            None => return, // last block of the region
        };
        let neighbor = self.region.header(next);
        if neighbor.state() == BlockState::Used {
            return;
        }
        self.unlink(next);
        let merged = self.region.header(block).size() + Header::SIZE + neighbor.size();
        self.region.set_header(block, Header::free(merged));
    }

    /// Resize the allocation at `old`, relocating it if it has to grow.
    ///
    /// A null `old` is plain [`allocate`](Self::allocate). Shrinking (and
    /// resizing to the current size) returns `old` untouched. Growing
    /// allocates a new block, copies the old payload over and frees `old`;
    /// if no block fits, `None` is returned and the heap, including `old`,
    /// is unchanged.
    ///
    /// # Safety
    /// `old` must be null or a live payload pointer of this heap.
    pub unsafe fn reallocate(&mut self, old: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        if old.is_null() {
            return self.allocate(new_size);
        }
        // SAFETY: a non-null `old` is a live payload per the contract above.
        let block = unsafe { self.region.block_of(old) };
        let old_size = self.region.header(block).size();
        if new_size <= old_size {
            // SAFETY: `old` is a payload pointer, hence non-null.
            return Some(unsafe { NonNull::new_unchecked(old) });
        }
        let new = self.allocate(new_size)?;
        // SAFETY: the new payload holds at least `old_size` bytes and is a
        // different block than `old` (which is still allocated here), so the
        // ranges cannot overlap.
        unsafe {
            ptr::copy_nonoverlapping(old, new.as_ptr(), old_size);
            self.free(old);
        }
        Some(new)
    }

    /// Check the heap's invariants.
    ///
    /// Walks every block, confirming the walk lands exactly on the region
    /// end and that the allocated-block count matches the running counter.
    /// Then traverses the free list: every node must lie on a plausible
    /// block boundary, read as free and be back-linked to its predecessor,
    /// and the list must account for exactly the free blocks the walk saw.
    /// An empty list is valid whenever the walk found no free block. The
    /// returned [`Corruption`] describes the first violation; its `Display`
    /// text is the diagnostic.
    pub fn validate(&self) -> Result<(), Corruption> {
        let stats = self.region.walk()?;
        if stats.allocated != self.blocks_allocated {
            return Err(Corruption::AllocatedCountMismatch {
                recorded: self.blocks_allocated,
                measured: stats.allocated,
            });
        }

        let mut listed = 0;
        let mut prev = NIL;
        let mut cursor = self.free_head;
        while cursor != NIL {
            if cursor % ALIGNMENT != 0 || cursor + MIN_BLOCK > self.region.len() {
                return Err(Corruption::BadFreeListNode { offset: cursor });
            }
            let block = BlockOffset(cursor);
            if self.region.header(block).state() == BlockState::Used {
                return Err(Corruption::AllocatedFreeListNode { offset: cursor });
            }
            let link = self.link(block);
            if link.prev != prev {
                return Err(Corruption::AsymmetricFreeListLinks { offset: cursor });
            }
            listed += 1;
            if listed > stats.free {
                return Err(Corruption::FreeListLoop);
            }
            prev = cursor;
            cursor = link.next;
        }
        if listed != stats.free {
            return Err(Corruption::FreeListCountMismatch {
                listed,
                walked: stats.free,
            });
        }
        Ok(())
    }

    /// The blocks of the heap in layout order. A debugging aid.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.region.blocks().map(move |block| self.region.info(block))
    }

    /// Payload pointers of the free blocks in list order, most recently
    /// inserted first. A debugging aid.
    pub fn free_list(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        FreeListIter {
            heap: self,
            cursor: self.free_head,
        }
    }

    /// Write one line per block into `out`. A debugging aid; the format is
    /// not a stable contract.
    pub fn dump<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        self.region.dump(out)
    }

    /// The links of the free block at `block`.
    fn link(&self, block: BlockOffset) -> FreeLink {
        FreeLink {
            next: self.region.read_word(block.0 + Header::SIZE),
            prev: self.region.read_word(block.0 + 2 * Header::SIZE),
        }
    }

    fn set_link(&mut self, block: BlockOffset, link: FreeLink) {
        self.region.write_word(block.0 + Header::SIZE, link.next);
        self.region.write_word(block.0 + 2 * Header::SIZE, link.prev);
    }

    fn set_next(&mut self, block: BlockOffset, next: usize) {
        self.region.write_word(block.0 + Header::SIZE, next);
    }

    fn set_prev(&mut self, block: BlockOffset, prev: usize) {
        self.region.write_word(block.0 + 2 * Header::SIZE, prev);
    }

    /// Push `block` at the head of the free list.
    fn push_free(&mut self, block: BlockOffset) {
        let old_head = self.free_head;
        self.set_link(
            block,
            FreeLink {
                next: old_head,
                prev: NIL,
            },
        );
        if old_head != NIL {
            self.set_prev(BlockOffset(old_head), block.0);
        }
        self.free_head = block.0;
    }

    /// Take `block` out of the free list, rewiring its neighbors.
    fn unlink(&mut self, block: BlockOffset) {
        let FreeLink { next, prev } = self.link(block);
        if prev == NIL {
            self.free_head = next;
        } else {
            self.set_next(BlockOffset(prev), next);
        }
        if next != NIL {
            self.set_prev(BlockOffset(next), prev);
        }
    }
}

/// Iterator behind [`ExplicitHeap::free_list`].
struct FreeListIter<'a, 'heap> {
    heap: &'a ExplicitHeap<'heap>,
    cursor: usize,
}

impl Iterator for FreeListIter<'_, '_> {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let block = BlockOffset(self.cursor);
        self.cursor = self.heap.link(block).next;
        Some(self.heap.region.payload(block))
    }
}
