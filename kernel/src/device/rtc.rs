//! The Goldfish real-time clock.
//!
//! Two registers: reading `TIME_LOW` latches the full nanosecond counter,
//! `TIME_HIGH` returns the latched upper half. Exposed as a read-only
//! endpoint yielding the current time as 8 little-endian bytes.

use core::ptr;

use crate::{
    device,
    error::Result,
    interrupt,
    io::{Io, IoCtl, IoOps},
};

const TIME_LOW: usize = 0x00;
const TIME_HIGH: usize = 0x04;

struct Rtc {
    base: usize,
}

impl Rtc {
    /// Nanoseconds since the epoch.
    fn now_ns(&self) -> u64 {
        // latch + read must not interleave with another reader
        interrupt::free(|| unsafe {
            let low =
                ptr::with_exposed_provenance::<u32>(self.base + TIME_LOW).read_volatile() as u64;
            let high =
                ptr::with_exposed_provenance::<u32>(self.base + TIME_HIGH).read_volatile() as u64;
            high << 32 | low
        })
    }
}

static RTC: Rtc = Rtc {
    base: crate::memory::layout::RTC_MMIO_BASE,
};

pub fn attach(base: usize) {
    debug_assert_eq!(base, RTC.base);
    device::register("rtc", rtc_open, 0);
}

fn rtc_open(_instance: usize) -> Result<Io> {
    Ok(Io::new(RtcIo))
}

struct RtcIo;

impl IoOps for RtcIo {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.readat(0, buf)
    }

    fn readat(&self, _pos: u64, buf: &mut [u8]) -> Result<usize> {
        let now = RTC.now_ns().to_le_bytes();
        let n = buf.len().min(now.len());
        buf[..n].copy_from_slice(&now[..n]);
        Ok(n)
    }

    fn cntl(&self, op: IoCtl) -> Result<usize> {
        match op {
            IoCtl::GetBlkSz => Ok(size_of::<u64>()),
            _ => Err(crate::error::KernelError::NotSupported),
        }
    }
}
