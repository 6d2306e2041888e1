//! Kernel console over UART0.
//!
//! Output translates `\n` to `\r\n`; input folds `\r` and `\r\n` down to
//! `\n`, so line-oriented readers only ever see `\n`.

use core::fmt::{self, Write as _};

use crate::interrupt::{self, IrqCell};

pub mod uart;

pub fn init() {
    uart::init();
}

/// Writes one byte, translating the newline convention.
pub fn kputc(byte: u8) {
    let out = uart::console();
    if byte == b'\n' {
        out.putc(b'\r');
    }
    out.putc(byte);
}

/// Writes a string through [`kputc`].
pub fn kputs(s: &str) {
    for b in s.bytes() {
        kputc(b);
    }
}

/// Reads one byte, normalizing `\r` and `\r\n` to `\n`.
pub fn kgetc() -> u8 {
    static LAST_WAS_CR: IrqCell<bool> = IrqCell::new(false);
    loop {
        let byte = uart::console().getc();
        let folded = LAST_WAS_CR.with(|last| {
            let prev = *last;
            *last = byte == b'\r';
            match byte {
                b'\r' => Some(b'\n'),
                b'\n' if prev => None, // second half of \r\n
                b => Some(b),
            }
        });
        if let Some(b) = folded {
            return b;
        }
    }
}

/// Registers the line-disciplined console as a named device.
///
/// Unlike the raw `uart` endpoints, `cons` applies the newline
/// translation in both directions.
pub fn attach() {
    crate::device::register("cons", cons_open, 0);
}

fn cons_open(_instance: usize) -> crate::error::Result<crate::io::Io> {
    Ok(crate::io::Io::new(ConsIo))
}

struct ConsIo;

impl crate::io::IoOps for ConsIo {
    fn read(&self, buf: &mut [u8]) -> crate::error::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        buf[0] = kgetc();
        Ok(1)
    }

    fn write(&self, buf: &[u8]) -> crate::error::Result<usize> {
        for &b in buf {
            kputc(b);
        }
        Ok(buf.len())
    }
}

struct ConsoleWriter;

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        kputs(s);
        Ok(())
    }
}

/// Formatted console output; the backbone of `print!` and the logger.
pub fn print_args(args: fmt::Arguments) {
    // keep concurrent writers' lines intact
    interrupt::free(|| {
        let _ = ConsoleWriter.write_fmt(args);
    });
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print_args(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::console::print_args(format_args!("{}\n", format_args!($($arg)*)))
    };
}
