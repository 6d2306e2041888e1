//! Physical page allocator.
//!
//! A best-fit list of free chunks covering the RAM between the end of the
//! kernel image and the end of physical memory. Pages are identity-mapped,
//! so the returned address is directly usable in kernel mode.
//!
//! Frees push a fresh chunk; chunks are not coalesced. Allocation churn is
//! low and requests are page-count-sized, so fragmentation stays bounded
//! in practice.

use core::ptr::{self, NonNull};

use alloc::vec::Vec;

use crate::{
    interrupt::IrqCell,
    memory::{
        PAGE_SHIFT, PAGE_SIZE,
        layout::{RAM_END, symbol_addr},
        page_up,
    },
};

#[derive(Debug, Clone, Copy)]
struct Chunk {
    /// First page number of the chunk.
    start_pn: usize,
    /// Pages in the chunk.
    count: usize,
}

struct Pool {
    chunks: Vec<Chunk>,
    /// Pages handed out and not yet returned.
    allocated: usize,
    /// Pool size at init, for the conservation invariant.
    initial: usize,
}

static POOL: IrqCell<Pool> = IrqCell::new(Pool {
    chunks: Vec::new(),
    allocated: 0,
    initial: 0,
});

pub fn init() {
    let start = page_up(symbol_addr!(_kimg_end));
    let count = (RAM_END - start) >> PAGE_SHIFT;
    POOL.with(|pool| {
        assert!(pool.initial == 0, "page allocator initialized twice");
        pool.chunks.push(Chunk {
            start_pn: start >> PAGE_SHIFT,
            count,
        });
        pool.initial = count;
    });
    log::info!("page: {count} pages free ({start:#x}..{RAM_END:#x})");
}

/// Allocates `count` physically contiguous zeroed pages.
pub fn alloc_pages(count: usize) -> Option<NonNull<u8>> {
    assert!(count > 0);
    let addr = POOL.with(|pool| {
        // best fit: the smallest chunk that still satisfies the request
        let (i, _) = pool
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.count >= count)
            .min_by_key(|(_, c)| c.count)?;

        let chunk = &mut pool.chunks[i];
        let start_pn = chunk.start_pn;
        if chunk.count == count {
            pool.chunks.swap_remove(i);
        } else {
            chunk.start_pn += count;
            chunk.count -= count;
        }
        pool.allocated += count;
        Some(start_pn << PAGE_SHIFT)
    })?;

    unsafe {
        ptr::write_bytes(addr as *mut u8, 0, count * PAGE_SIZE);
    }
    NonNull::new(addr as *mut u8)
}

/// Allocates one zeroed page.
pub fn alloc_page() -> Option<NonNull<u8>> {
    alloc_pages(1)
}

/// Returns `count` pages starting at `addr` to the pool.
///
/// # Safety
///
/// The range must have come from [`alloc_pages`] and must not be in use.
pub unsafe fn free_pages(addr: usize, count: usize) {
    assert_eq!(addr % PAGE_SIZE, 0);
    assert!(count > 0);
    POOL.with(|pool| {
        assert!(pool.allocated >= count, "double free of physical pages");
        pool.allocated -= count;
        pool.chunks.push(Chunk {
            start_pn: addr >> PAGE_SHIFT,
            count,
        });
    });
}

/// Returns one page.
///
/// # Safety
///
/// Same contract as [`free_pages`].
pub unsafe fn free_page(addr: usize) {
    unsafe { free_pages(addr, 1) }
}

/// Free pages currently in the pool.
pub fn free_count() -> usize {
    POOL.with(|pool| pool.chunks.iter().map(|c| c.count).sum())
}

/// Checks the conservation invariant: free + allocated == initial.
pub fn assert_conserved() {
    POOL.with(|pool| {
        let free: usize = pool.chunks.iter().map(|c| c.count).sum();
        assert_eq!(free + pool.allocated, pool.initial, "page pool leak");
    });
}
