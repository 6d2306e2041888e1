//! NS16550a UART driver.
//!
//! Transmit is polled; receive is interrupt-driven into a small ring that
//! readers block on. qemu's virt machine puts UART0 at 0x1000_0000 and
//! UART1 0x100 above it.

use core::ptr;

use crate::{
    device,
    interrupt::{IrqCell, plic},
    io::{Io, IoOps},
    memory::layout::{UART0_IRQ, UART0_MMIO_BASE, UART_MMIO_STRIDE},
    param,
    thread::Condition,
};

// register offsets (byte-wide registers)
const RBR: usize = 0; // receive buffer (read)
const THR: usize = 0; // transmit holding (write)
const IER: usize = 1; // interrupt enable
const FCR: usize = 2; // FIFO control (write)
const LCR: usize = 3; // line control
const LSR: usize = 5; // line status

const IER_RX_ENABLE: u8 = 1 << 0;
const FCR_FIFO_ENABLE: u8 = 1 << 0;
const FCR_FIFO_CLEAR: u8 = 3 << 1;
const LCR_EIGHT_BITS: u8 = 3;
const LSR_RX_READY: u8 = 1 << 0;
const LSR_TX_IDLE: u8 = 1 << 5;

const RX_RING_SIZE: usize = 64;

pub struct Uart {
    base: usize,
    rx: IrqCell<RxRing>,
    rx_ready: Condition,
}

struct RxRing {
    buf: [u8; RX_RING_SIZE],
    head: usize,
    tail: usize,
}

/// The console UART, initialized before anything can print.
static UART0: Uart = Uart::new(UART0_MMIO_BASE);
static UART1: Uart = Uart::new(UART0_MMIO_BASE + UART_MMIO_STRIDE);

impl Uart {
    const fn new(base: usize) -> Self {
        Self {
            base,
            rx: IrqCell::new(RxRing {
                buf: [0; RX_RING_SIZE],
                head: 0,
                tail: 0,
            }),
            rx_ready: Condition::new("uart.rx_ready"),
        }
    }

    fn read_reg(&self, reg: usize) -> u8 {
        unsafe { ptr::with_exposed_provenance::<u8>(self.base + reg).read_volatile() }
    }

    fn write_reg(&self, reg: usize, value: u8) {
        unsafe { ptr::with_exposed_provenance_mut::<u8>(self.base + reg).write_volatile(value) }
    }

    fn init(&self) {
        // interrupts off while configuring
        self.write_reg(IER, 0);
        self.write_reg(LCR, LCR_EIGHT_BITS);
        self.write_reg(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);
        self.write_reg(IER, IER_RX_ENABLE);
    }

    /// Transmits one byte, spinning on the holding register.
    pub fn putc(&self, byte: u8) {
        while self.read_reg(LSR) & LSR_TX_IDLE == 0 {}
        self.write_reg(THR, byte);
    }

    /// Takes one byte from the receive ring, blocking until one arrives.
    pub fn getc(&self) -> u8 {
        // check-and-wait in one disabled section, so an ISR broadcast
        // between the two cannot be lost
        crate::interrupt::free(|| loop {
            let ring = unsafe { self.rx.get_mut_unchecked() };
            if ring.head != ring.tail {
                let b = ring.buf[ring.head % RX_RING_SIZE];
                ring.head += 1;
                break b;
            }
            unsafe {
                self.rx_ready.wait_disabled();
            }
        })
    }

    /// Drains the receive FIFO. Runs in ISR context.
    fn handle_interrupt(&self) {
        while self.read_reg(LSR) & LSR_RX_READY != 0 {
            let byte = self.read_reg(RBR);
            self.rx.with(|ring| {
                if ring.tail - ring.head < RX_RING_SIZE {
                    ring.buf[ring.tail % RX_RING_SIZE] = byte;
                    ring.tail += 1;
                }
                // overflow drops the byte
            });
        }
        self.rx_ready.broadcast();
    }
}

fn uart_isr(arg: usize) {
    instance(arg).handle_interrupt();
}

fn instance(i: usize) -> &'static Uart {
    match i {
        0 => &UART0,
        _ => &UART1,
    }
}

/// Configures UART0 early so the console works before interrupts do.
pub fn init() {
    UART0.init();
}

/// Brings up UART interrupts and registers both ports as named devices.
pub fn attach_secondary() {
    UART1.init();
    for i in 0..2 {
        plic::enable(UART0_IRQ + i, param::UART_INTR_PRIO, uart_isr, i);
        device::register("uart", uart_open, i);
    }
}

pub fn console() -> &'static Uart {
    &UART0
}

fn uart_open(instance_no: usize) -> crate::error::Result<Io> {
    Ok(Io::new(UartIo(instance(instance_no))))
}

/// Byte-stream endpoint over one UART.
struct UartIo(&'static Uart);

impl IoOps for UartIo {
    fn read(&self, buf: &mut [u8]) -> crate::error::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // block for the first byte, then take whatever is pending
        buf[0] = self.0.getc();
        let mut n = 1;
        while n < buf.len() {
            let more = self.0.rx.with(|ring| {
                if ring.head == ring.tail {
                    None
                } else {
                    let b = ring.buf[ring.head % RX_RING_SIZE];
                    ring.head += 1;
                    Some(b)
                }
            });
            match more {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> crate::error::Result<usize> {
        for &b in buf {
            self.0.putc(b);
        }
        Ok(buf.len())
    }
}
