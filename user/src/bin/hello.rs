#![no_std]
#![no_main]

use ktos_user::syscall;

extern crate ktos_user;

#[unsafe(no_mangle)]
extern "C" fn main(argc: usize, argv: *const *const u8) -> isize {
    let _ = syscall::print("hello from user space");
    if argc > 0 {
        let name = unsafe { ktos_user::arg(argv, 0) };
        if name == b"hello" {
            let _ = syscall::print("argv intact");
        }
    }
    0
}
