//! The kernel heap: fixed-size block pools for small allocations, backed by
//! the frame allocator for anything larger.

use crate::architecture::machine;
use crate::memory::{frames, Frame, FRAME_SIZE};
use crate::sync::SpinLock;
use crate::{call_once, log};
use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::cmp::{max, min};
use core::ptr;

extern "Rust" {
    /// First byte of the linker-reserved heap arena
    static __heap_start: UnsafeCell<()>;
    /// One past the last byte of the heap arena
    static __heap_end: UnsafeCell<()>;
}

/// A free block in a fixed-block pool
struct FreeBlock {
    /// The next free block, or null
    next: *mut FreeBlock,
}

/// A pool of `BLOCK_SIZE`-byte blocks threaded onto a free list
struct FixedBlockHeap<const BLOCK_SIZE: usize> {
    /// Head of the free list
    first_free: *mut FreeBlock,
    /// Total bytes managed, for logging
    size: usize,
}

// SAFETY: The raw list head is only touched under the enclosing spinlock
unsafe impl<const BLOCK_SIZE: usize> Send for FixedBlockHeap<BLOCK_SIZE> {}

impl<const BLOCK_SIZE: usize> FixedBlockHeap<BLOCK_SIZE> {
    /// Creates a new, unusable heap; initialize before use
    const fn new() -> Self {
        Self {
            first_free: ptr::null_mut(),
            size: 0,
        }
    }

    /// Implements `GlobalAlloc::alloc` for this pool
    fn alloc(&mut self, layout: Layout) -> Option<*mut u8> {
        if layout.size() > BLOCK_SIZE || layout.align() > BLOCK_SIZE {
            return None;
        }
        let block = self.first_free;
        // SAFETY: Free-list nodes are only ever created over unused blocks
        self.first_free = unsafe { block.as_ref() }?.next;
        Some(block.cast())
    }

    /// Implements `GlobalAlloc::dealloc` for this pool
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this pool's `alloc`
    unsafe fn dealloc(&mut self, ptr: *mut u8) {
        let block = ptr.cast::<FreeBlock>();
        // SAFETY: The block is unused from here on, so we may repurpose its
        // first bytes as the list link
        unsafe {
            (*block).next = self.first_free;
        }
        self.first_free = block;
    }

    /// Carves the given memory range into blocks on the free list
    ///
    /// # Safety
    ///
    /// The range must be unused, properly aligned and reserved for this pool
    unsafe fn init(&mut self, start: *mut u8, size: usize) {
        assert!(BLOCK_SIZE.is_power_of_two());
        for block_offset in (0..size).step_by(BLOCK_SIZE) {
            // SAFETY: Blocks tile the caller-provided range
            unsafe {
                self.dealloc(start.add(block_offset));
            }
        }
        self.size = size;
    }

    /// Logs this pool's usage
    fn log(&self) {
        let mut free = 0_usize;
        let mut block = self.first_free;
        // SAFETY: List links always point to live free blocks
        while let Some(current) = unsafe { block.as_ref() } {
            free += 1;
            block = current.next;
        }
        log!(
            "HEAP BLOCKS {}B: {} free, {} in use",
            BLOCK_SIZE,
            free,
            self.size / BLOCK_SIZE - free
        );
    }
}

/// The general purpose heap allocator for the kernel
struct HeapAllocator {
    /// 32-byte blocks
    b32: SpinLock<FixedBlockHeap<32>>,
    /// 128-byte blocks
    b128: SpinLock<FixedBlockHeap<128>>,
    /// 512-byte blocks
    b512: SpinLock<FixedBlockHeap<512>>,
    // Anything larger resorts to whole frames
}

impl HeapAllocator {
    /// Creates a new, uninitialized heap allocator
    const fn new() -> Self {
        Self {
            b32: SpinLock::new(FixedBlockHeap::new()),
            b128: SpinLock::new(FixedBlockHeap::new()),
            b512: SpinLock::new(FixedBlockHeap::new()),
        }
    }

    /// Allocates whole frames for an oversized request
    fn large_alloc(layout: Layout) -> *mut u8 {
        if layout.align() > FRAME_SIZE {
            return ptr::null_mut();
        }
        let count = layout.size().div_ceil(FRAME_SIZE);
        frames::allocator()
            .allocate_contiguous(count)
            .map_or(ptr::null_mut(), |frame| {
                let pointer = frame.as_ptr();
                // The receipt is reconstructed in `large_dealloc`
                core::mem::forget(frame);
                pointer
            })
    }

    /// Releases frames claimed by `large_alloc`
    ///
    /// # Safety
    ///
    /// `ptr` and `layout` must describe a live `large_alloc` allocation
    unsafe fn large_dealloc(ptr: *mut u8, layout: Layout) {
        let count = layout.size().div_ceil(FRAME_SIZE);
        // SAFETY: `large_alloc` handed these frames out as one contiguous run
        let frame = unsafe { Frame::from_base(machine::kernel_to_physical(ptr as u64)) };
        frames::allocator().free_contiguous(frame, count);
    }
}

/// The global kernel heap
#[global_allocator]
static KERNEL_HEAP: HeapAllocator = HeapAllocator::new();

// SAFETY: Block pools and the frame allocator never hand out overlapping
// memory, and every path is serialized by a lock
unsafe impl GlobalAlloc for HeapAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match max(layout.align(), layout.size()) {
            0..=32 => self.b32.lock().alloc(layout).unwrap_or(ptr::null_mut()),
            33..=128 => self.b128.lock().alloc(layout).unwrap_or(ptr::null_mut()),
            129..=512 => self.b512.lock().alloc(layout).unwrap_or(ptr::null_mut()),
            _ => Self::large_alloc(layout),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        match max(layout.align(), layout.size()) {
            // SAFETY: By assumption, the pointer and layout should be valid
            0..=32 => unsafe { self.b32.lock().dealloc(ptr) },
            // SAFETY: By assumption, the pointer and layout should be valid
            33..=128 => unsafe { self.b128.lock().dealloc(ptr) },
            // SAFETY: By assumption, the pointer and layout should be valid
            129..=512 => unsafe { self.b512.lock().dealloc(ptr) },
            // SAFETY: By assumption, the pointer and layout should be valid
            _ => unsafe { Self::large_dealloc(ptr, layout) },
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: the caller must ensure that the `new_size` does not overflow.
        // `layout.align()` comes from a `Layout` and is thus guaranteed to be valid.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let old_bucket = max(layout.align(), layout.size()).next_power_of_two();
        let new_bucket = max(new_layout.align(), new_layout.size()).next_power_of_two();
        if (old_bucket <= 32 && new_bucket <= 32)
            || (32 < old_bucket && old_bucket <= 128 && 32 < new_bucket && new_bucket <= 128)
            || (128 < old_bucket && old_bucket <= 512 && 128 < new_bucket && new_bucket <= 512)
        {
            // Fits in the same block, no need to reallocate
            return ptr;
        }
        // Default reallocation behavior from rust source

        // SAFETY: the caller must ensure that `new_layout` is greater than zero.
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            // SAFETY: the previously allocated block cannot overlap the newly allocated block.
            // The safety contract for `dealloc` must be upheld by the caller.
            unsafe {
                ptr::copy_nonoverlapping(ptr, new_ptr, min(layout.size(), new_size));
                self.dealloc(ptr, layout);
            }
        }
        new_ptr
    }
}

/// Logs statistics regarding heap usage, for shutdown diagnostics
pub fn log_allocator() {
    KERNEL_HEAP.b512.lock().log();
    KERNEL_HEAP.b128.lock().log();
    KERNEL_HEAP.b32.lock().log();
}

/// Initializes the global kernel heap over the linker-reserved arena
///
/// # Safety
///
/// Must be called only once, before any allocation
pub unsafe fn init() {
    call_once!();
    // SAFETY: The linker guarantees these symbols delimit the arena
    let (start, size) = unsafe {
        let start = __heap_start.get().cast::<u8>();
        let size = (__heap_end.get() as usize) - (__heap_start.get() as usize);
        (start, size)
    };

    // SAFETY: The subranges are disjoint and reserved for exactly these pools
    unsafe {
        KERNEL_HEAP.b512.lock().init(start, size * 3 / 4);
        KERNEL_HEAP
            .b128
            .lock()
            .init(start.add(size * 3 / 4), size * 3 / 16);
        KERNEL_HEAP
            .b32
            .lock()
            .init(start.add(size * 15 / 16), size / 16);
    }
}
