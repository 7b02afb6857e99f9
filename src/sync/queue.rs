use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

/// A single-shot unit of work for the event loop
pub type Work = Box<dyn FnOnce() + Send>;

/// A node in the queue's linked list
struct Node {
    /// The next node down, owned by the queue while linked
    next: *mut Node,
    /// The enclosed work item
    work: Work,
}

/// A lock-free multi-producer multi-consumer queue of work items.
///
/// `enqueue` publishes a new head with a compare-and-swap and `dequeue` pops
/// it, so ordering is not FIFO across producers; the event loop treats items
/// as unordered. To defeat the ABA problem when a node's allocation is
/// immediately reused, the head word packs a 16-bit generation stamp above
/// the 48-bit node address, and every successful update advances the stamp.
///
/// The address truncation is lossless because queue nodes live in the kernel
/// heap, whose virtual addresses all carry the fixed upper-half prefix.
pub struct WorkQueue {
    /// Stamped pointer to the most recently pushed node
    head: AtomicU64,
}

/// Number of significant virtual-address bits in a stamped head word
const ADDRESS_BITS: u8 = 48;
/// Mask extracting the address portion of a stamped head word
const ADDRESS_MASK: u64 = (1 << ADDRESS_BITS) - 1;
/// The fixed upper bits of every kernel virtual address
const KERNEL_PREFIX: u64 = !ADDRESS_MASK;

/// Combines a node pointer and a stamp into a head word
fn compose(node: *mut Node, stamp: u64) -> u64 {
    ((node as u64) & ADDRESS_MASK) | (stamp << ADDRESS_BITS)
}

/// Splits a head word into its node pointer and stamp
fn decompose(word: u64) -> (*mut Node, u64) {
    let address = word & ADDRESS_MASK;
    let node = if address == 0 {
        ptr::null_mut()
    } else {
        (address | KERNEL_PREFIX) as *mut Node
    };
    (node, word >> ADDRESS_BITS)
}

impl WorkQueue {
    /// Creates a new, empty queue
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
        }
    }

    /// Adds a work item to the queue
    pub fn enqueue(&self, work: Work) {
        let node = Box::into_raw(Box::new(Node {
            next: ptr::null_mut(),
            work,
        }));
        self.head
            .fetch_update(Ordering::Release, Ordering::Acquire, |current| {
                let (head, stamp) = decompose(current);
                // SAFETY: `node` is not yet published, so no other core can
                // touch it
                unsafe {
                    (*node).next = head;
                }
                Some(compose(node, stamp.wrapping_add(1)))
            })
            .expect("Publishing a new queue head should never be refused");
    }

    /// Removes a work item from the queue, if one is available
    pub fn dequeue(&self) -> Option<Work> {
        self.head
            .fetch_update(Ordering::Relaxed, Ordering::Acquire, |current| {
                let (head, stamp) = decompose(current);
                // SAFETY: A non-null head always points to a live node
                // published by `enqueue`
                unsafe { head.as_ref() }.map(|node| compose(node.next, stamp.wrapping_add(1)))
            })
            .ok()
            .map(|previous| {
                let (head, _) = decompose(previous);
                // SAFETY: The successful exchange transferred ownership of
                // the popped node to us, and it originates from `Box::into_raw`
                unsafe { Box::from_raw(head) }.work
            })
    }

    /// Whether the queue currently appears empty.
    ///
    /// Purely an observation: another core may enqueue or dequeue at any time.
    pub fn is_empty(&self) -> bool {
        decompose(self.head.load(Ordering::Acquire)).0.is_null()
    }
}

// SAFETY: All shared state is managed through atomic operations
unsafe impl Sync for WorkQueue {}
// SAFETY: See above
unsafe impl Send for WorkQueue {}
