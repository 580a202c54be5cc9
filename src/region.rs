//! The heap region: a caller-supplied byte range subdivided into blocks.
//!
//! All pointer arithmetic in this crate is confined to this module. A
//! [`Region`] wraps the borrowed bytes and hands out typed views by offset:
//! header loads and stores, payload pointers and the forward block traversal.
//! An offset wrapped in [`BlockOffset`] is known to lie on a block boundary,
//! so accesses through it stay inside the region.

use core::fmt;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

use crate::header::{BlockState, Header, ALIGNMENT};

/// Backing storage for a heap region, with the alignment initialization
/// requires.
///
/// A heap can be built over any word-aligned `MaybeUninit<u8>` slice whose
/// length is a multiple of 8; this type exists so callers don't have to fight
/// for that alignment themselves. It is a `const fn` construction, so it can
/// back a `static`.
///
/// ```
/// use segalloc::{ExplicitHeap, Storage};
///
/// let mut storage = Storage::<1024>::new();
/// let mut heap = ExplicitHeap::new(storage.bytes_mut()).unwrap();
/// assert!(heap.allocate(64).is_some());
/// ```
#[repr(align(8))]
pub struct Storage<const N: usize>([MaybeUninit<u8>; N]);

impl<const N: usize> Storage<N> {
    /// Create uninitialized storage for an `N`-byte heap region.
    pub const fn new() -> Self {
        Self([MaybeUninit::uninit(); N])
    }

    /// The raw bytes, ready to hand to a heap's `new`.
    pub fn bytes_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        &mut self.0
    }
}

/// Byte offset of a block header within its region.
///
/// Instances are only ever produced for offsets on a block boundary; this is
/// what makes the unchecked header accesses of [`Region`] sound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockOffset(pub(crate) usize);

/// Size and status of one block, as reported by the block iterators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Payload size in bytes (the header word not included).
    pub size: usize,
    pub state: BlockState,
}

/// A consistency violation found by `validate`.
///
/// The `Display` text is the human-readable diagnostic. Offsets are relative
/// to the region base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// A header's size would run its block past the end of the region.
    BlockOutOfBounds { offset: usize },
    /// A header word has one of its reserved metadata bits set.
    ReservedBits { offset: usize },
    /// The running used-byte counter exceeds the region size.
    UsedBytesTooLarge { used: usize, capacity: usize },
    /// The running used-byte counter disagrees with the heap contents.
    UsedBytesMismatch { recorded: usize, measured: usize },
    /// The allocated-block counter disagrees with the heap contents.
    AllocatedCountMismatch { recorded: usize, measured: usize },
    /// A free-list link points outside the region or between blocks.
    BadFreeListNode { offset: usize },
    /// A free-list node's header claims the block is allocated.
    AllocatedFreeListNode { offset: usize },
    /// A free-list node's back link does not point at its predecessor.
    AsymmetricFreeListLinks { offset: usize },
    /// The free list visits more nodes than the region has free blocks.
    FreeListLoop,
    /// Free-list membership and free headers disagree.
    FreeListCountMismatch { listed: usize, walked: usize },
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BlockOutOfBounds { offset } => {
                write!(f, "block at {:#x} runs past the end of the region", offset)
            }
            Self::ReservedBits { offset } => {
                write!(f, "header at {:#x} has reserved metadata bits set", offset)
            }
            Self::UsedBytesTooLarge { used, capacity } => write!(
                f,
                "more bytes in use ({}) than the region holds ({})",
                used, capacity
            ),
            Self::UsedBytesMismatch { recorded, measured } => write!(
                f,
                "used-byte counter ({}) disagrees with the heap contents ({})",
                recorded, measured
            ),
            Self::AllocatedCountMismatch { recorded, measured } => write!(
                f,
                "allocated-block counter ({}) disagrees with the heap contents ({})",
                recorded, measured
            ),
            Self::BadFreeListNode { offset } => {
                write!(f, "free-list link points at invalid offset {:#x}", offset)
            }
            Self::AllocatedFreeListNode { offset } => {
                write!(f, "free-list node at {:#x} is marked allocated", offset)
            }
            Self::AsymmetricFreeListLinks { offset } => write!(
                f,
                "free-list node at {:#x} is not back-linked to its predecessor",
                offset
            ),
            Self::FreeListLoop => f.write_str("free list has more nodes than free blocks exist"),
            Self::FreeListCountMismatch { listed, walked } => write!(
                f,
                "free list has {} nodes but the region has {} free blocks",
                listed, walked
            ),
        }
    }
}

/// What a full consistency walk saw.
#[derive(Debug)]
pub(crate) struct WalkStats {
    /// Number of allocated blocks.
    pub allocated: usize,
    /// Number of free blocks.
    pub free: usize,
    /// Bytes accounted as used: one header per block plus every allocated
    /// payload.
    pub used_bytes: usize,
}

/// A caller-supplied byte range holding the block sequence of one heap.
///
/// The region borrows the memory exclusively for `'heap` but stores only the
/// raw base pointer: payload pointers handed to the caller and the region's
/// own accesses then share one provenance, so neither invalidates the other.
pub(crate) struct Region<'heap> {
    base: NonNull<u8>,
    len: usize,
    _memory: PhantomData<&'heap mut [MaybeUninit<u8>]>,
}

impl<'heap> Region<'heap> {
    /// Take over `memory` and format it as a single spanning free block.
    ///
    /// Returns `None` if the slice is too small to hold even one header, if
    /// its base is not word-aligned, or if its length is not a multiple of
    /// the word size: block sizes are multiples of 8, so such a region could
    /// never be covered exactly.
    pub fn new(memory: &'heap mut [MaybeUninit<u8>]) -> Option<Self> {
        let len = memory.len();
        if len < Header::SIZE || len % ALIGNMENT != 0 {
            return None;
        }
        if memory.as_ptr() as usize % ALIGNMENT != 0 {
            return None;
        }
        // SAFETY: slice pointers are never null.
        let base = unsafe { NonNull::new_unchecked(memory.as_mut_ptr().cast::<u8>()) };
        let mut region = Self {
            base,
            len,
            _memory: PhantomData,
        };
        region.reset();
        Some(region)
    }

    /// Re-format the region as a single spanning free block.
    ///
    /// Headers written by earlier splits stay behind as stale bytes; they
    /// are unreachable, since every traversal starts from the first header.
    pub fn reset(&mut self) {
        self.write_word(0, Header::free(self.len - Header::SIZE).as_raw());
    }

    /// Total region size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Read the word at `offset`.
    ///
    /// # Panics
    /// Panics if `offset` is not word-aligned or the word would extend past
    /// the region.
    pub fn read_word(&self, offset: usize) -> usize {
        assert!(offset % ALIGNMENT == 0);
        assert!(offset + Header::SIZE <= self.len);
        // SAFETY: the asserts keep the access aligned (the base itself is
        // word-aligned, checked in `new`) and inside the borrowed region.
        // The word is read as `MaybeUninit` and only assumed initialized
        // because every reachable block boundary and link word is written
        // (by `reset`, a split or a list insertion) before it becomes
        // reachable.
        unsafe {
            self.base
                .as_ptr()
                .add(offset)
                .cast::<MaybeUninit<usize>>()
                .read()
                .assume_init()
        }
    }

    /// Write the word at `offset`.
    ///
    /// # Panics
    /// Panics if `offset` is not word-aligned or the word would extend past
    /// the region.
    pub fn write_word(&mut self, offset: usize, value: usize) {
        assert!(offset % ALIGNMENT == 0);
        assert!(offset + Header::SIZE <= self.len);
        // SAFETY: aligned and in-bounds by the asserts above; the region has
        // exclusive access to the memory for `'heap`.
        unsafe { self.base.as_ptr().add(offset).cast::<usize>().write(value) }
    }

    pub fn header(&self, block: BlockOffset) -> Header {
        Header::from_raw(self.read_word(block.0))
    }

    pub fn set_header(&mut self, block: BlockOffset, header: Header) {
        self.write_word(block.0, header.as_raw());
    }

    pub fn info(&self, block: BlockOffset) -> BlockInfo {
        let header = self.header(block);
        BlockInfo {
            size: header.size(),
            state: header.state(),
        }
    }

    /// Pointer to the payload of `block`, i.e. what `allocate` hands out.
    pub fn payload(&self, block: BlockOffset) -> NonNull<u8> {
        // SAFETY: block offsets lie on a boundary inside the region, so the
        // payload starts in bounds and the pointer cannot be null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(block.0 + Header::SIZE)) }
    }

    /// Offset of the block owning `payload` (the header sits one word below
    /// the payload).
    ///
    /// # Safety
    /// `payload` must be a payload pointer previously produced by this
    /// region.
    pub unsafe fn block_of(&self, payload: *const u8) -> BlockOffset {
        let addr = payload as usize;
        let base = self.base.as_ptr() as usize;
        assert!(addr >= base + Header::SIZE && addr < base + self.len);
        assert!((addr - base) % ALIGNMENT == 0);
        BlockOffset(addr - base - Header::SIZE)
    }

    /// The block immediately after `block`, or `None` when `block` is the
    /// region's last.
    pub fn following(&self, block: BlockOffset) -> Option<BlockOffset> {
        let next = block.0 + Header::SIZE + self.header(block).size();
        if next < self.len {
            Some(BlockOffset(next))
        } else {
            None
        }
    }

    /// Iterate over all block boundaries in layout order.
    ///
    /// This trusts the block invariants; the checked counterpart used by the
    /// validators is [`walk`](Self::walk).
    pub fn blocks(&self) -> Blocks<'_, 'heap> {
        Blocks {
            region: self,
            offset: 0,
        }
    }

    /// Checked traversal of every block.
    ///
    /// Unlike [`blocks`](Self::blocks) this never steps outside the region:
    /// each header is re-checked before the walk advances over it, and the
    /// first violation is reported instead of panicking. A clean walk lands
    /// exactly on the region end.
    pub fn walk(&self) -> Result<WalkStats, Corruption> {
        let mut stats = WalkStats {
            allocated: 0,
            free: 0,
            used_bytes: 0,
        };
        let mut offset = 0;
        while offset < self.len {
            // `offset` stays a multiple of the word size and below `len`
            // (which is a multiple as well), so the header read itself is
            // always in bounds.
            let header = Header::from_raw(self.read_word(offset));
            if !header.reserved_bits_clear() {
                return Err(Corruption::ReservedBits { offset });
            }
            let next = offset + Header::SIZE + header.size();
            if next > self.len {
                return Err(Corruption::BlockOutOfBounds { offset });
            }
            stats.used_bytes += Header::SIZE;
            match header.state() {
                BlockState::Used => {
                    stats.allocated += 1;
                    stats.used_bytes += header.size();
                }
                BlockState::Free => stats.free += 1,
            }
            offset = next;
        }
        Ok(stats)
    }

    /// Write one line per block into `out`: offset, payload size and status.
    pub fn dump<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        for block in self.blocks() {
            let header = self.header(block);
            writeln!(
                out,
                "{:#08x}: {} bytes, {}",
                block.0,
                header.size(),
                header.state()
            )?;
        }
        Ok(())
    }
}

/// Iterator over the block boundaries of a region, in layout order.
pub(crate) struct Blocks<'region, 'heap> {
    region: &'region Region<'heap>,
    offset: usize,
}

impl Iterator for Blocks<'_, '_> {
    type Item = BlockOffset;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset < self.region.len() {
            let block = BlockOffset(self.offset);
            self.offset += Header::SIZE + self.region.header(block).size();
            Some(block)
        } else {
            None
        }
    }
}
