//! Minimal user-space runtime: program entry, panic handler, and typed
//! syscall wrappers.
//!
//! Programs define `#[no_mangle] extern "C" fn main(argc: usize, argv:
//! *const *const u8) -> isize`; the runtime calls it and exits with its
//! return value discarded (the kernel has no exit status).

#![no_std]

use core::panic::PanicInfo;

pub mod syscall;

pub use ktos_abi::{AbiError, IoctlCmd};

/// Result of a syscall, decoded from the return register.
pub type Result<T> = ktos_abi::Result<T>;

core::arch::global_asm!(
    r#"
    .section .text.entry
    .globl _start
_start:
    # a0 = argc, a1 = argv, both set up by exec
    call {rust_start}
    "#,
    rust_start = sym rust_start,
);

unsafe extern "C" {
    fn main(argc: usize, argv: *const *const u8) -> isize;
}

extern "C" fn rust_start(argc: usize, argv: *const *const u8) -> ! {
    unsafe {
        main(argc, argv);
    }
    syscall::exit()
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    // best effort: panics in user space surface on the console
    let _ = syscall::print("panic in user program");
    let _ = info;
    syscall::exit()
}

/// The `i`-th argument as a byte slice.
///
/// # Safety
///
/// `argv` must be the vector passed to `main` and `i < argc`.
pub unsafe fn arg<'a>(argv: *const *const u8, i: usize) -> &'a [u8] {
    unsafe {
        let ptr = *argv.add(i);
        let mut len = 0;
        while *ptr.add(len) != 0 {
            len += 1;
        }
        core::slice::from_raw_parts(ptr, len)
    }
}
