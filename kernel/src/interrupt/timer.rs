//! Timer interrupts, alarms, and the sleep list.
//!
//! Alarms link into a single global list ordered by absolute wake time (in
//! `time` CSR ticks). The head's wake time is programmed into `stimecmp`;
//! the timer ISR broadcasts every elapsed alarm's condition and re-arms
//! for the new head, or disarms when the list drains.

use core::{arch::asm, ptr};

use crate::{
    interrupt::{self, IrqCell},
    param::TIMER_FREQ,
    thread::Condition,
};

/// An entry in the sleep list.
pub struct Alarm {
    cond: Condition,
    /// Absolute wake time, in timer ticks.
    twake: u64,
    next: *mut Alarm,
}

struct SleepList(*mut Alarm);

unsafe impl Send for SleepList {}

static SLEEP_LIST: IrqCell<SleepList> = IrqCell::new(SleepList(ptr::null_mut()));

/// Current value of the `time` CSR.
pub fn now() -> u64 {
    let time: u64;
    unsafe {
        asm!("csrr {}, time", out(reg) time);
    }
    time
}

fn set_stimecmp(ticks: u64) {
    unsafe {
        asm!("csrw stimecmp, {}", in(reg) ticks);
    }
}

pub fn init() {
    set_stimecmp(u64::MAX);
    unsafe {
        riscv::register::sie::set_stimer();
    }
}

impl Alarm {
    pub const fn new(name: &'static str) -> Self {
        Self {
            cond: Condition::new(name),
            twake: 0,
            next: ptr::null_mut(),
        }
    }

    /// Starts the relative-sleep clock at the current instant.
    pub fn reset(&mut self) {
        self.twake = now();
    }

    /// Sleeps until `ticks` past the previous wake time.
    ///
    /// Keeping wake times absolute makes back-to-back sleeps drift-free.
    pub fn sleep(&mut self, ticks: u64) {
        if ticks == 0 {
            return;
        }
        self.twake = self.twake.saturating_add(ticks);
        if self.twake <= now() {
            return;
        }

        interrupt::free(|| {
            // insert in wake-time order
            let this = self as *mut Alarm;
            SLEEP_LIST.with(|list| unsafe {
                let mut cursor: *mut *mut Alarm = &mut list.0;
                while !(*cursor).is_null() && (**cursor).twake <= self.twake {
                    cursor = &mut (**cursor).next;
                }
                self.next = *cursor;
                *cursor = this;
                if list.0 == this {
                    set_stimecmp(self.twake);
                }
            });
            unsafe {
                self.cond.wait_disabled();
            }
        });
    }
}

/// Wakes every alarm whose time has come. Runs in ISR context.
pub fn handle_interrupt() {
    let t = now();
    SLEEP_LIST.with(|list| {
        while !list.0.is_null() {
            let head = list.0;
            unsafe {
                if (*head).twake > t {
                    break;
                }
                list.0 = (*head).next;
                (*head).next = ptr::null_mut();
                (*head).cond.broadcast();
            }
        }
        if list.0.is_null() {
            set_stimecmp(u64::MAX);
        } else {
            set_stimecmp(unsafe { (*list.0).twake });
        }
    });
}

/// Sleeps the calling thread for `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    sleep_us(ms * 1000);
}

/// Sleeps the calling thread for `us` microseconds.
pub fn sleep_us(us: u64) {
    let mut alarm = Alarm::new("sleep");
    alarm.reset();
    alarm.sleep(us * (TIMER_FREQ / 1_000_000));
}
