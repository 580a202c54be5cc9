//! The implicit-list allocator: first fit over the in-band headers.

use core::fmt;
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};

use crate::header::{effective_size, BlockState, Header, ALIGNMENT};
use crate::region::{BlockInfo, BlockOffset, Corruption, Region};

/// A first-fit heap that tracks blocks only through their headers.
///
/// Allocation is a linear scan over the block sequence: each header's size
/// tells the scan where the next header lies, so no side structure is
/// needed. There is no coalescing: [`free`](Self::free) clears the status
/// bit and nothing else, so neighboring holes never merge and an
/// allocation can fail even when the total free space would suffice.
///
/// The heap maintains a running count of used bytes (every header plus every
/// allocated payload); [`validate`](Self::validate) re-derives the count
/// from the block sequence and cross-checks it.
pub struct ImplicitHeap<'heap> {
    region: Region<'heap>,
    /// Bytes in use: one header per block plus all allocated payloads.
    nused: usize,
}

// SAFETY: the heap holds the only access path to its region for 'heap;
// moving it to another thread moves that exclusive access along with it.
unsafe impl Send for ImplicitHeap<'_> {}

impl<'heap> ImplicitHeap<'heap> {
    /// Take over `memory` as the heap region, formatted as a single free
    /// block spanning everything after the first header.
    ///
    /// Returns `None` if the slice is smaller than one header (8 bytes), not
    /// 8-aligned, or not a multiple of 8 bytes long.
    pub fn new(memory: &'heap mut [MaybeUninit<u8>]) -> Option<Self> {
        let region = Region::new(memory)?;
        Some(Self {
            region,
            nused: Header::SIZE,
        })
    }

    /// Forget all allocations and return to the just-initialized state.
    ///
    /// Payload pointers handed out earlier must not be freed afterwards.
    pub fn reset(&mut self) {
        self.region.reset();
        self.nused = Header::SIZE;
    }

    /// Total size of the region in bytes.
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Bytes currently in use: one header per block plus every allocated
    /// payload.
    pub fn used_bytes(&self) -> usize {
        self.nused
    }

    /// Allocate a payload of at least `requested` bytes.
    ///
    /// The effective size is `requested` rounded up to a multiple of 8 with
    /// a floor of 16. The first free block large enough is taken; oversized
    /// blocks are split, leaving the tail as a new free block. Returns
    /// `None` (with the heap untouched) for requests of 0 or more than
    /// [`MAX_REQUEST`](crate::MAX_REQUEST) bytes and when no single free
    /// block fits.
    pub fn allocate(&mut self, requested: usize) -> Option<NonNull<u8>> {
        let size = effective_size(requested)?;
        let block = self.region.blocks().find(|&block| {
            let header = self.region.header(block);
            header.state() == BlockState::Free && header.size() >= size
        })?;

        let found = self.region.header(block).size();
        if found >= size + Header::SIZE + ALIGNMENT {
            // Split: the surplus becomes a free block after the payload.
            self.region.set_header(block, Header::used(size));
            let tail = BlockOffset(block.0 + Header::SIZE + size);
            self.region
                .set_header(tail, Header::free(found - size - Header::SIZE));
            self.nused += size + Header::SIZE;
        } else {
            // Exact fit, or 8 spare bytes that cannot form a block of their
            // own: hand the block out as is.
            self.region.set_header(block, Header::used(found));
            self.nused += found;
        }
        Some(self.region.payload(block))
    }

    /// Release the allocation at `ptr`. A null `ptr` is a no-op.
    ///
    /// The block's status bit is cleared; the block is not merged with its
    /// neighbors.
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
        self.nused -= size;
        self.region.set_header(block, Header::free(size));
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
    /// end and that the re-derived used-byte count matches the running
    /// counter. The returned [`Corruption`] describes the first violation;
    /// its `Display` text is the diagnostic.
    pub fn validate(&self) -> Result<(), Corruption> {
        if self.nused > self.region.len() {
            return Err(Corruption::UsedBytesTooLarge {
                used: self.nused,
                capacity: self.region.len(),
            });
        }
        let stats = self.region.walk()?;
        if stats.used_bytes != self.nused {
            return Err(Corruption::UsedBytesMismatch {
                recorded: self.nused,
                measured: stats.used_bytes,
            });
        }
        Ok(())
    }

    /// The blocks of the heap in layout order. A debugging aid.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.region.blocks().map(move |block| self.region.info(block))
    }

    /// Write one line per block into `out`. A debugging aid; the format is
    /// not a stable contract.
    pub fn dump<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        self.region.dump(out)
    }
}
