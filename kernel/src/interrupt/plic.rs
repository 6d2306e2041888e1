//! The platform-level interrupt controller, plus the per-source ISR table.
//!
//! Register layout is qemu's RISC-V PLIC with hart 0's S-mode context.

use core::ptr;

use crate::{interrupt::IrqCell, memory::layout::PLIC_MMIO_BASE};

/// Interrupt sources qemu's virt machine can deliver.
pub const NIRQ: usize = 96;

pub type Isr = fn(usize);

#[derive(Clone, Copy)]
struct Handler {
    isr: Isr,
    arg: usize,
}

struct IsrTable([Option<Handler>; NIRQ]);

static HANDLERS: IrqCell<IsrTable> = IrqCell::new(IsrTable([None; NIRQ]));

// hart 0, S-mode context
fn priority_reg(src: usize) -> *mut u32 {
    ptr::with_exposed_provenance_mut(PLIC_MMIO_BASE + 4 * src)
}

fn enable_reg(src: usize) -> *mut u32 {
    ptr::with_exposed_provenance_mut(PLIC_MMIO_BASE + 0x2080 + 4 * (src / 32))
}

fn threshold_reg() -> *mut u32 {
    ptr::with_exposed_provenance_mut(PLIC_MMIO_BASE + 0x20_1000)
}

fn claim_reg() -> *mut u32 {
    ptr::with_exposed_provenance_mut(PLIC_MMIO_BASE + 0x20_1004)
}

pub fn init() {
    // accept every priority level
    unsafe {
        threshold_reg().write_volatile(0);
    }
}

/// Registers `isr` for `src` and unmasks the source at `prio`.
pub fn enable(src: usize, prio: u32, isr: Isr, arg: usize) {
    assert!(src > 0 && src < NIRQ);
    assert!(prio > 0);
    HANDLERS.with(|t| {
        assert!(t.0[src].is_none(), "interrupt source {src} claimed twice");
        t.0[src] = Some(Handler { isr, arg });
    });
    unsafe {
        priority_reg(src).write_volatile(prio);
        let reg = enable_reg(src);
        reg.write_volatile(reg.read_volatile() | 1 << (src % 32));
    }
}

/// Masks `src` and forgets its handler.
pub fn disable(src: usize) {
    assert!(src > 0 && src < NIRQ);
    unsafe {
        priority_reg(src).write_volatile(0);
        let reg = enable_reg(src);
        reg.write_volatile(reg.read_volatile() & !(1 << (src % 32)));
    }
    HANDLERS.with(|t| t.0[src] = None);
}

/// Claims, dispatches, and completes one external interrupt.
///
/// Runs from the trap handler with interrupts disabled.
pub fn dispatch() {
    let src = unsafe { claim_reg().read_volatile() } as usize;
    if src == 0 {
        return;
    }
    let handler = HANDLERS.with(|t| t.0.get(src).copied().flatten());
    match handler {
        Some(h) => (h.isr)(h.arg),
        None => log::warn!("plic: unexpected interrupt source {src}"),
    }
    unsafe {
        claim_reg().write_volatile(src as u32);
    }
}
