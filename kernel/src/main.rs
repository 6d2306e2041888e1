#![no_std]
#![no_main]

extern crate alloc;

use core::panic::PanicInfo;

mod console;
mod device;
mod error;
mod fs;
mod interrupt;
mod io;
mod logging;
mod memory;
mod param;
mod proc;
mod start;
mod syscall;
mod thread;

/// start() jumps here in supervisor mode.
extern "C" fn main() -> ! {
    console::init();
    println!();
    println!("ktos kernel is booting");
    println!();
    logging::init();

    device::init(); // named-device table
    interrupt::plic::init(); // external interrupt controller
    interrupt::trap::init(); // install trap vector
    memory::heap::init(); // kernel heap backing `alloc`
    memory::page::init(); // physical page allocator
    memory::vspace::init(); // main address space, turn on paging
    interrupt::timer::init(); // sleep list, timer comparator
    thread::init(); // thread table, idle thread
    proc::init(); // process table, main process
    interrupt::enable();

    console::attach();
    device::rtc::attach(memory::layout::RTC_MMIO_BASE);
    console::uart::attach_secondary();
    device::vioblk::attach_all();

    fs::init(); // mount KTFS over the block device
    thread::spawn_interrupter(); // drives preemption

    proc::run_init(); // exec the first user program; does not return
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    interrupt::disable();
    println!("PANIC: {info}");
    loop {
        riscv::asm::wfi();
    }
}
