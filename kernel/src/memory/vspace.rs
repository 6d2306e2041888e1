//! Address-space management.
//!
//! The **main** space is built once at boot: a gigapage over the MMIO
//! region plus 4 KiB identity mappings of RAM with per-section kernel
//! permissions, all global. Every process space is a clone of the active
//! space: the kernel half is shared by reference (the entries are global)
//! and the user half is deep-copied.
//!
//! A space is named by its `satp` value ("tag"); installing the tag
//! switches the hart to that space. The user half occupies a single
//! level-2 subtree, so cloning and discarding touch one entry chain.

use riscv::register::satp::{self, Satp};

use crate::{
    error::{KernelError, Result},
    interrupt::IrqCell,
    memory::{
        PAGE_SIZE,
        layout::{RAM_END, RAM_START, UMEM_VPN2, symbol_addr},
        page,
        page_table::{PageTable, Pte, PteFlags, sfence},
    },
};

static MAIN_TAG: IrqCell<usize> = IrqCell::new(0);

fn tag_of(root: usize) -> usize {
    let mut satp = Satp::from_bits(0);
    satp.set_mode(satp::Mode::Sv39);
    satp.set_ppn(root >> 12);
    satp.bits()
}

fn root_of(tag: usize) -> usize {
    (tag & ((1 << 44) - 1)) << 12
}

/// Builds the main space and turns on paging.
pub fn init() {
    let mut pt = PageTable::new().expect("out of memory building the main space");

    // all MMIO lives below 1 GiB; one global gigapage covers it
    pt.map_gigapage(0, 0, PteFlags::RW | PteFlags::G);

    // kernel image with per-section permissions, then the page pool
    let text_end = symbol_addr!(_kimg_text_end);
    let rodata_end = symbol_addr!(_kimg_rodata_end);
    let g = PteFlags::G;
    pt.map_range(RAM_START, text_end - RAM_START, RAM_START, PteFlags::RX | g)
        .unwrap();
    pt.map_range(text_end, rodata_end - text_end, text_end, PteFlags::R | g)
        .unwrap();
    pt.map_range(rodata_end, RAM_END - rodata_end, rodata_end, PteFlags::RW | g)
        .unwrap();

    let tag = tag_of(pt.root());
    MAIN_TAG.with(|t| *t = tag);
    switch(tag);
    log::info!("vspace: main space installed, satp={tag:#x}");
}

/// Tag of the boot-time kernel-only space.
pub fn main_tag() -> usize {
    MAIN_TAG.with(|t| *t)
}

/// Tag of the space the hart is running on.
pub fn active() -> usize {
    satp::read().bits()
}

/// Installs `tag` and flushes the TLB.
pub fn switch(tag: usize) {
    unsafe {
        satp::write(Satp::from_bits(tag));
    }
    sfence();
}

/// Switches back to the main space without freeing anything.
pub fn reset_active() {
    switch(main_tag());
}

/// The active space's page table, for mapping operations.
pub fn active_table() -> PageTable {
    PageTable::from_root(root_of(active()))
}

/// Clones the active space: kernel half by reference, user half deep.
///
/// Returns the new space's tag.
pub fn clone_active() -> Result<usize> {
    let mut src = active_table();
    let mut dst = PageTable::new()?;

    let src_root = src.root_entries();
    for (i, pte) in src_root.iter().enumerate() {
        if i != UMEM_VPN2 {
            dst.root_entries()[i] = *pte;
        }
    }

    let user = src_root[UMEM_VPN2];
    if user.is_valid() {
        if let Err(e) = clone_user_subtree(user, &mut dst) {
            discard_tree(&mut dst);
            return Err(e);
        }
    }

    Ok(tag_of(dst.root()))
}

/// Deep-copies the user level-2 subtree of `src_l2` into `dst`.
fn clone_user_subtree(src_l2: Pte, dst: &mut PageTable) -> Result<()> {
    let src_l1 = unsafe { &*(src_l2.addr() as *const [Pte; 512]) };
    for (i1, pte1) in src_l1.iter().enumerate() {
        if !pte1.is_valid() {
            continue;
        }
        assert!(!pte1.is_leaf(), "megapage in user space");
        let src_l0 = unsafe { &*(pte1.addr() as *const [Pte; 512]) };
        for (i0, pte0) in src_l0.iter().enumerate() {
            if !pte0.is_leaf() {
                continue;
            }
            let vma = UMEM_VPN2 << 30 | i1 << 21 | i0 << 12;
            let page = page::alloc_page().ok_or(KernelError::OutOfMemory)?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    pte0.addr() as *const u8,
                    page.as_ptr(),
                    PAGE_SIZE,
                );
            }
            if let Err(e) = dst.map_page(vma, page.addr().get(), pte0.flags() & PteFlags::URWX) {
                unsafe {
                    page::free_page(page.addr().get());
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

/// A fresh space with the main kernel half and an empty user half.
pub fn new_user_space() -> Result<usize> {
    let main_root = table_root(main_tag());
    let mut dst = PageTable::new()?;
    let src = unsafe { &*(main_root as *const [Pte; 512]) };
    for (i, pte) in src.iter().enumerate() {
        if i != UMEM_VPN2 {
            dst.root_entries()[i] = *pte;
        }
    }
    Ok(tag_of(dst.root()))
}

/// The page table behind an arbitrary space tag.
pub fn table(tag: usize) -> PageTable {
    PageTable::from_root(table_root(tag))
}

fn table_root(tag: usize) -> usize {
    root_of(tag)
}

/// Frees the user half of the active space and returns to the main space.
///
/// A no-op (beyond the reset) when the active space is the main one.
pub fn discard_active() -> usize {
    let tag = active();
    reset_active();
    discard(tag);
    main_tag()
}

/// Frees a non-active, non-main space: every user page, every user table,
/// and the root.
pub fn discard(tag: usize) {
    assert_ne!(tag, active(), "discarding the active space");
    if tag == main_tag() {
        return;
    }
    let mut pt = PageTable::from_root(root_of(tag));
    discard_tree(&mut pt);
}

/// Frees every user page, user table, and the root of `pt`.
fn discard_tree(pt: &mut PageTable) {
    let user = pt.root_entries()[UMEM_VPN2];
    if user.is_valid() {
        let l1 = unsafe { &*(user.addr() as *const [Pte; 512]) };
        for pte1 in l1.iter().filter(|p| p.is_valid()) {
            let l0 = unsafe { &*(pte1.addr() as *const [Pte; 512]) };
            for pte0 in l0.iter().filter(|p| p.is_leaf()) {
                unsafe {
                    page::free_page(pte0.addr());
                }
            }
            unsafe {
                page::free_page(pte1.addr());
            }
        }
        unsafe {
            page::free_page(user.addr());
        }
    }
    unsafe {
        page::free_page(pt.root());
    }
    sfence();
}
