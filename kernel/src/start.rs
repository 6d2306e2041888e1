//! Machine-mode hand-off: entry point, boot stack, and the drop to
//! supervisor mode.

use core::arch::{asm, global_asm};

use riscv::register::{
    medeleg::{self, Medeleg},
    mepc,
    mideleg::{self, Mideleg},
    mstatus, pmpaddr0, pmpcfg0,
    satp::{self, Satp},
    sie,
};

use crate::main;

pub const BOOT_STACK_SIZE: usize = 16 * 1024;

#[repr(align(4096))]
pub struct BootStack(pub [u8; BOOT_STACK_SIZE]);

/// The main thread runs on this stack until the first context switch.
pub static mut BOOT_STACK: BootStack = BootStack([0; BOOT_STACK_SIZE]);

global_asm!(
    r#"
    .section .text.entry
    .globl _entry
_entry:
    # set up a stack for Rust: sp = BOOT_STACK + BOOT_STACK_SIZE, minus
    # room for the main thread's stack anchor
    la sp, {boot_stack}
    li t0, {stack_size}
    add sp, sp, t0
    addi sp, sp, -16
    call {start}
    "#,
    boot_stack = sym BOOT_STACK,
    stack_size = const BOOT_STACK_SIZE,
    start = sym start,
);

/// _entry jumps here in machine mode.
extern "C" fn start() -> ! {
    // set M Previous Privilege mode to Supervisor, for mret.
    unsafe {
        mstatus::set_mpp(mstatus::MPP::Supervisor);
    }

    // set M Exception Program Counter to main, for mret.
    unsafe {
        mepc::write(main as usize);
    }

    // paging off until vspace::init().
    unsafe {
        satp::write(Satp::from_bits(0));
    }

    // delegate all interrupts and exceptions to supervisor mode.
    unsafe {
        medeleg::write(Medeleg::from_bits(0xffff));
        mideleg::write(Mideleg::from_bits(0xffff));
        let mut sie = sie::read();
        sie.set_sext(true);
        sie.set_stimer(true);
        sie.set_ssoft(true);
        sie::write(sie);
    }

    // give supervisor mode access to all of physical memory.
    unsafe {
        pmpaddr0::write(0x3f_ffff_ffff_ffff);
        pmpcfg0::write(0xf);
    }

    // let supervisor mode program its own timer via stimecmp (sstc), and
    // read the time CSR.
    unsafe {
        asm!("csrs menvcfg, {}", in(reg) 1_u64 << 63);
        asm!("csrs mcounteren, {}", in(reg) 0x2_u64);
        // no timer interrupt until the sleep list asks for one
        asm!("csrw stimecmp, {}", in(reg) u64::MAX);
    }

    unsafe {
        asm!("mret", options(noreturn));
    }
}
