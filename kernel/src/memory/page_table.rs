//! Sv39 page tables.
//!
//! Three levels of 512-entry tables. The kernel maps MMIO with gigapages at
//! boot and everything else with 4 KiB pages; after boot only 4 KiB leaves
//! are ever created, and the walker refuses to descend through a huge-page
//! leaf.

use core::ptr::NonNull;

use bitflags::bitflags;

use crate::{
    error::{KernelError, Result},
    memory::{PAGE_SHIFT, PAGE_SIZE, page, page_up, pages_for},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: usize {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;

        const RW = Self::R.bits() | Self::W.bits();
        const RX = Self::R.bits() | Self::X.bits();
        const URW = Self::U.bits() | Self::RW.bits();
        const RWX = Self::RW.bits() | Self::X.bits();
        const URWX = Self::U.bits() | Self::RWX.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(usize);

impl Pte {
    pub const EMPTY: Self = Self(0);

    fn new(pma: usize, flags: PteFlags) -> Self {
        Self((pma >> PAGE_SHIFT) << 10 | flags.bits())
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    /// A valid entry with any of R/W/X set maps a page; without them it
    /// points at the next table level.
    pub fn is_leaf(self) -> bool {
        self.is_valid() && self.flags().intersects(PteFlags::RWX)
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Physical address this entry maps or points at.
    pub fn addr(self) -> usize {
        (self.0 >> 10) << PAGE_SHIFT
    }
}

const ENTRIES: usize = 512;

type Entries = [Pte; ENTRIES];

/// A root page table. Tables are identity-mapped, so physical addresses
/// double as pointers.
pub struct PageTable {
    root: usize,
}

/// Sv39 canonical form: bits 63..38 must replicate bit 38.
fn check_canonical(vma: usize) -> Result<()> {
    let high = vma >> 38;
    if high == 0 || high == (1 << 26) - 1 {
        Ok(())
    } else {
        Err(KernelError::InvalidArgument)
    }
}

fn vpn(vma: usize, level: usize) -> usize {
    vma >> (PAGE_SHIFT + 9 * level) & (ENTRIES - 1)
}

fn table_of(addr: usize) -> &'static mut Entries {
    unsafe { &mut *(addr as *mut Entries) }
}

impl PageTable {
    /// Allocates an empty root table.
    pub fn new() -> Result<Self> {
        let root = page::alloc_page().ok_or(KernelError::OutOfMemory)?;
        Ok(Self {
            root: root.addr().get(),
        })
    }

    /// Adopts an existing root (e.g. read back from `satp`).
    pub fn from_root(root: usize) -> Self {
        Self { root }
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn root_entries(&mut self) -> &mut Entries {
        table_of(self.root)
    }

    /// Descends to the level-0 entry for `vma`.
    ///
    /// With `create`, missing intermediate tables are allocated zero-filled
    /// and installed as global table pointers. A huge-page leaf on the way
    /// down is an error: the kernel never splits megapages after boot.
    pub fn walk(&mut self, vma: usize, create: bool) -> Result<&mut Pte> {
        check_canonical(vma)?;
        let mut table = table_of(self.root);
        for level in [2, 1] {
            let pte = &mut table[vpn(vma, level)];
            if !pte.is_valid() {
                if !create {
                    return Err(KernelError::InvalidArgument);
                }
                let sub = page::alloc_page().ok_or(KernelError::OutOfMemory)?;
                *pte = Pte::new(sub.addr().get(), PteFlags::V | PteFlags::G);
            } else if pte.is_leaf() {
                return Err(KernelError::InvalidArgument);
            }
            table = table_of(pte.addr());
        }
        Ok(&mut table[vpn(vma, 0)])
    }

    /// Maps the page at `vma` to the physical page at `pma`.
    pub fn map_page(&mut self, vma: usize, pma: usize, flags: PteFlags) -> Result<()> {
        assert_eq!(vma % PAGE_SIZE, 0);
        assert_eq!(pma % PAGE_SIZE, 0);
        let pte = self.walk(vma, true)?;
        assert!(!pte.is_valid(), "remap of {vma:#x}");
        *pte = Pte::new(pma, flags | PteFlags::A | PteFlags::D | PteFlags::V);
        sfence();
        Ok(())
    }

    /// Maps `size` bytes starting at `vma` to physical memory at `pma`.
    pub fn map_range(&mut self, vma: usize, size: usize, pma: usize, flags: PteFlags) -> Result<()> {
        let size = page_up(size);
        for off in (0..size).step_by(PAGE_SIZE) {
            self.map_page(vma + off, pma + off, flags)?;
        }
        Ok(())
    }

    /// Allocates physically contiguous pages and maps them at `vma`.
    pub fn alloc_and_map_range(&mut self, vma: usize, size: usize, flags: PteFlags) -> Result<usize> {
        let count = pages_for(size);
        let pma = page::alloc_pages(count).ok_or(KernelError::OutOfMemory)?;
        if let Err(e) = self.map_range(vma, size, pma.addr().get(), flags) {
            unsafe {
                page::free_pages(pma.addr().get(), count);
            }
            return Err(e);
        }
        Ok(pma.addr().get())
    }

    /// Replaces the permission bits of the existing leaves in a range.
    pub fn set_range_flags(&mut self, vma: usize, size: usize, flags: PteFlags) -> Result<()> {
        let size = page_up(size);
        for off in (0..size).step_by(PAGE_SIZE) {
            let pte = self.walk(vma + off, false)?;
            let addr = pte.addr();
            let keep = pte.flags() - PteFlags::URWX;
            *pte = Pte::new(addr, keep | (flags & PteFlags::URWX));
        }
        sfence();
        Ok(())
    }

    /// Unmaps a range, returning each mapped physical page to the pool.
    /// Holes in the range are skipped.
    pub fn unmap_and_free_range(&mut self, vma: usize, size: usize) {
        let size = page_up(size);
        for off in (0..size).step_by(PAGE_SIZE) {
            let Ok(pte) = self.walk(vma + off, false) else {
                continue;
            };
            if pte.is_leaf() {
                unsafe {
                    page::free_page(pte.addr());
                }
            }
            *pte = Pte::EMPTY;
        }
        sfence();
    }

    /// Installs a 1 GiB leaf directly in the root table. Boot-time only.
    pub fn map_gigapage(&mut self, vma: usize, pma: usize, flags: PteFlags) {
        const GIGA: usize = 1 << 30;
        assert_eq!(vma % GIGA, 0);
        assert_eq!(pma % GIGA, 0);
        let pte = &mut self.root_entries()[vpn(vma, 2)];
        assert!(!pte.is_valid());
        *pte = Pte::new(pma, flags | PteFlags::A | PteFlags::D | PteFlags::V);
    }

    /// Physical address `vma` maps to, if any 4 KiB leaf covers it.
    pub fn translate(&mut self, vma: usize) -> Option<NonNull<u8>> {
        let pte = self.walk(crate::memory::page_down(vma), false).ok()?;
        if !pte.is_leaf() {
            return None;
        }
        NonNull::new((pte.addr() + vma % PAGE_SIZE) as *mut u8)
    }
}

/// Flushes the TLB after structural page-table changes.
pub fn sfence() {
    riscv::asm::sfence_vma_all();
}
