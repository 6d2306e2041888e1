//! Compile-time configuration.

/// Maximum number of threads.
pub const NTHR: usize = 32;

/// Maximum number of processes.
pub const NPROC: usize = 16;

/// Maximum number of registered devices.
pub const NDEV: usize = 16;

/// Per-process I/O descriptor table size.
pub const PROCESS_IOMAX: usize = ktos_abi::PROCESS_IOMAX;

/// Block-cache capacity, in blocks.
pub const CACHE_CAPACITY: usize = 64;

/// Timer ticks per second on qemu's virt machine.
pub const TIMER_FREQ: u64 = 10_000_000;

/// Preemption time slice, in milliseconds.
pub const TIME_SLICE_MS: u64 = 10;

/// Kernel heap size in bytes.
pub const KERNEL_HEAP_SIZE: usize = 1 << 20;

// external interrupt priorities
pub const UART_INTR_PRIO: u32 = 3;
pub const VIOBLK_INTR_PRIO: u32 = 1;
