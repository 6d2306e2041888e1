//! Kernel heap backing the `alloc` crate.
//!
//! A fixed region inside the kernel image, managed by a buddy allocator.
//! Page-sized and larger allocations for user memory go through
//! [`crate::memory::page`] instead.

use buddy_system_allocator::LockedHeap;

use crate::param::KERNEL_HEAP_SIZE;

#[global_allocator]
static HEAP: LockedHeap<32> = LockedHeap::empty();

static mut HEAP_SPACE: [u8; KERNEL_HEAP_SIZE] = [0; KERNEL_HEAP_SIZE];

pub fn init() {
    unsafe {
        HEAP.lock()
            .init((&raw mut HEAP_SPACE) as usize, KERNEL_HEAP_SIZE);
    }
}
