//! The physical frame allocator.
//!
//! All post-kernel RAM, as declared by the linker, is carved into 4 KiB
//! frames tracked by a bitmap stored in the pool's own first frames. A set
//! bit means "allocated"; the bits covering the bitmap itself are pinned at
//! boot and never released.

use crate::architecture::machine;
use crate::cell::InitCell;
use crate::sync::SpinLock;
use bitvec::prelude::{BitSlice, Lsb0};
use core::cell::UnsafeCell;
use core::{ptr, slice};

/// The size of a physical frame, in bytes
pub const FRAME_SIZE: usize = 4096;

extern "Rust" {
    /// First byte of the frame pool (linker-provided, upper-half address)
    static __frame_pool_start: UnsafeCell<()>;
    /// One past the last byte of the frame pool
    static __frame_pool_end: UnsafeCell<()>;
}

/// The frame pool has no free frames left
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[display(fmt = "out of physical frames")]
pub struct OutOfMemory;

/// A 4 KiB physically contiguous region, identified by its physical base
/// address.
///
/// A `Frame` is a receipt of ownership: whoever holds it may use the memory
/// and is responsible for eventually passing it to [`FrameAllocator::free`].
#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    /// Physical address of the first byte
    base: u64,
}

impl Frame {
    /// Reconstructs a frame receipt from its physical base address
    ///
    /// # Safety
    ///
    /// The address must denote a currently-allocated frame whose ownership is
    /// being transferred to the caller
    pub const unsafe fn from_base(base: u64) -> Self {
        Self { base }
    }

    /// The physical address of the frame's first byte
    pub const fn physical_base(&self) -> u64 {
        self.base
    }

    /// The frame's contents, viewed through the kernel's upper-half mapping
    pub fn as_ptr(&self) -> *mut u8 {
        machine::physical_to_kernel(self.base) as *mut u8
    }
}

/// State protected by the allocator's lock
struct Pool {
    /// One bit per frame; set means allocated
    bitmap: &'static mut BitSlice<u64, Lsb0>,
    /// Physical address of frame 0
    start: u64,
}

impl Pool {
    /// The physical base address of the frame at `index`
    fn frame_base(&self, index: usize) -> u64 {
        self.start + (index * FRAME_SIZE) as u64
    }

    /// The bitmap index of the frame with the given physical base
    fn frame_index(&self, base: u64) -> usize {
        assert_eq!(
            base % FRAME_SIZE as u64,
            0,
            "Frame addresses should be frame-aligned"
        );
        usize::try_from((base - self.start) / FRAME_SIZE as u64)
            .expect("Frame indices should fit into a usize")
    }
}

/// The allocator for the global frame pool
pub struct FrameAllocator {
    /// The protected pool state; a hot but short critical section
    pool: SpinLock<Pool>,
}

impl FrameAllocator {
    /// Claims the first free frame, zeroes it and hands it out
    pub fn allocate(&self) -> Result<Frame, OutOfMemory> {
        let base = {
            let mut pool = self.pool.lock();
            let index = pool.bitmap.first_zero().ok_or(OutOfMemory)?;
            pool.bitmap.set(index, true);
            pool.frame_base(index)
        };
        // SAFETY: The bitmap claim above makes this core the frame's only
        // owner, so zeroing it cannot race
        unsafe {
            ptr::write_bytes(
                machine::physical_to_kernel(base) as *mut u8,
                0,
                FRAME_SIZE,
            );
        }
        Ok(Frame { base })
    }

    /// Claims `count` physically contiguous frames, zeroed, returning the
    /// first. Used by the heap for allocations larger than its block pools.
    pub fn allocate_contiguous(&self, count: usize) -> Result<Frame, OutOfMemory> {
        assert!(count > 0);
        let base = {
            let mut pool = self.pool.lock();
            let mut search_from = 0;
            let start = loop {
                let first = pool.bitmap[search_from..]
                    .first_zero()
                    .map(|offset| search_from + offset)
                    .ok_or(OutOfMemory)?;
                if first + count > pool.bitmap.len() {
                    return Err(OutOfMemory);
                }
                match pool.bitmap[first..first + count].first_one() {
                    None => break first,
                    Some(occupied) => search_from = first + occupied + 1,
                }
            };
            pool.bitmap[start..start + count].fill(true);
            pool.frame_base(start)
        };
        // SAFETY: As in `allocate`, the claimed run is exclusively owned
        unsafe {
            ptr::write_bytes(
                machine::physical_to_kernel(base) as *mut u8,
                0,
                FRAME_SIZE * count,
            );
        }
        Ok(Frame { base })
    }

    /// Returns a frame to the pool
    pub fn free(&self, frame: Frame) {
        let mut pool = self.pool.lock();
        let index = pool.frame_index(frame.base);
        assert!(
            pool.bitmap.replace(index, false),
            "Freed frames should have been allocated"
        );
    }

    /// Returns a contiguous run previously obtained from
    /// [`Self::allocate_contiguous`]
    pub fn free_contiguous(&self, frame: Frame, count: usize) {
        let mut pool = self.pool.lock();
        let index = pool.frame_index(frame.base);
        for bit in index..index + count {
            assert!(
                pool.bitmap.replace(bit, false),
                "Freed frames should have been allocated"
            );
        }
    }

    /// The number of currently allocated frames, for logging and tests
    pub fn allocated_frames(&self) -> usize {
        self.pool.lock().bitmap.count_ones()
    }
}

/// The global frame allocator
static ALLOCATOR: InitCell<FrameAllocator> = InitCell::new();

/// Gets the global frame allocator
pub fn allocator() -> &'static FrameAllocator {
    &ALLOCATOR
}

/// Builds the allocator over the linker-declared pool and pins the frames
/// holding the bitmap itself.
///
/// # Safety
///
/// Must only be called once, before any allocation, and the pool must not be
/// in use by anything else
pub(super) unsafe fn init() {
    crate::call_once!();

    // SAFETY: The linker guarantees these symbols delimit the pool
    let (start, end) = unsafe {
        (
            machine::kernel_to_physical(__frame_pool_start.get() as u64),
            machine::kernel_to_physical(__frame_pool_end.get() as u64),
        )
    };
    assert_eq!(start % FRAME_SIZE as u64, 0);
    let total_frames = usize::try_from((end - start) / FRAME_SIZE as u64)
        .expect("Frame count should fit into a usize");

    let bitmap_words = total_frames.div_ceil(u64::BITS as usize);
    let bitmap_bytes = bitmap_words * core::mem::size_of::<u64>();
    let bitmap_frames = bitmap_bytes.div_ceil(FRAME_SIZE);

    // SAFETY: The bitmap occupies the pool's first frames, which nothing
    // else may touch per this function's contract
    let words = unsafe {
        slice::from_raw_parts_mut(
            machine::physical_to_kernel(start) as *mut u64,
            bitmap_words,
        )
    };
    words.fill(0);
    // Trim the trailing bits of the last word so they can never be handed out
    let bitmap = &mut BitSlice::from_slice_mut(words)[..total_frames];
    bitmap[..bitmap_frames].fill(true);

    // SAFETY: This is the single-threaded initialization sequence
    unsafe {
        ALLOCATOR.set(FrameAllocator {
            pool: SpinLock::new(Pool { bitmap, start }),
        });
    }
}
