//! The physical memory map of qemu's virt machine, and the kernel's
//! virtual-address conventions.
//!
//! The kernel runs identity-mapped: every address space shares global
//! mappings for MMIO and RAM below the user window. User memory occupies
//! the window `UMEM_START..UMEM_END`, which is exactly one level-2 page
//! table slot, so cloning and discarding a space touch a single subtree.

// MMIO
pub const UART0_MMIO_BASE: usize = 0x1000_0000;
pub const UART_MMIO_STRIDE: usize = 0x100;
pub const UART0_IRQ: usize = 10;

pub const VIRTIO0_MMIO_BASE: usize = 0x1000_1000;
pub const VIRTIO_MMIO_STRIDE: usize = 0x1000;
pub const VIRTIO0_IRQ: usize = 1;
pub const VIRTIO_COUNT: usize = 8;

pub const PLIC_MMIO_BASE: usize = 0x0c00_0000;

pub const RTC_MMIO_BASE: usize = 0x0010_1000;

// RAM
pub const RAM_START: usize = 0x8000_0000;
pub const RAM_SIZE: usize = 8 * 1024 * 1024;
pub const RAM_END: usize = RAM_START + RAM_SIZE;

// user window: one full level-2 slot (3 GiB .. 4 GiB)
pub const UMEM_START: usize = 0xc000_0000;
pub const UMEM_END: usize = 0x1_0000_0000;

/// Level-2 page-table index of the user window.
pub const UMEM_VPN2: usize = UMEM_START >> 30;

const _: () = assert!(UMEM_START >> 30 == (UMEM_END - 1) >> 30);

// linker-provided image boundaries
unsafe extern "C" {
    pub static _kimg_start: u8;
    pub static _kimg_text_end: u8;
    pub static _kimg_rodata_end: u8;
    pub static _kimg_end: u8;
}

/// Address of a linker symbol.
macro_rules! symbol_addr {
    ($sym:ident) => {
        unsafe { core::ptr::addr_of!($crate::memory::layout::$sym) as usize }
    };
}
pub(crate) use symbol_addr;
