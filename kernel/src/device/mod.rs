//! The named-device table.
//!
//! Drivers register `(name, instance)` pairs with an open function; the
//! `devopen` syscall resolves through here.

use arrayvec::ArrayString;

use crate::{
    error::{KernelError, Result},
    interrupt::IrqCell,
    io::Io,
    param::NDEV,
};

pub mod rtc;
pub mod vioblk;
pub mod virtio;

pub type OpenFn = fn(usize) -> Result<Io>;

#[derive(Clone, Copy)]
struct Device {
    name: ArrayString<8>,
    instance: usize,
    open: OpenFn,
}

struct DeviceTable([Option<Device>; NDEV]);

static DEVICES: IrqCell<DeviceTable> = IrqCell::new(DeviceTable([None; NDEV]));

pub fn init() {
    // nothing to do beyond the static table; drivers attach later
    log::info!("device: table ready, {NDEV} slots");
}

/// Registers an openable device instance. Panics when the table is full:
/// attaching happens at boot, where running out is a configuration bug.
pub fn register(name: &str, open: OpenFn, instance: usize) {
    DEVICES.with(|t| {
        let slot = t
            .0
            .iter_mut()
            .find(|d| d.is_none())
            .expect("device table full");
        let mut dev_name = ArrayString::new();
        let _ = dev_name.try_push_str(name);
        *slot = Some(Device {
            name: dev_name,
            instance,
            open,
        });
    });
    log::info!("device: registered {name}{instance}");
}

/// Opens device `name` number `instance`.
pub fn open(name: &str, instance: usize) -> Result<Io> {
    let dev = DEVICES.with(|t| {
        t.0.iter()
            .flatten()
            .find(|d| d.name.as_str() == name && d.instance == instance)
            .copied()
    });
    match dev {
        Some(d) => (d.open)(d.instance),
        None => Err(KernelError::NoDevice),
    }
}

/// Powers the machine off through qemu's test device.
pub fn shutdown() -> ! {
    const TEST_FINISHER: usize = 0x10_0000;
    const FINISHER_PASS: u32 = 0x5555;
    unsafe {
        core::ptr::with_exposed_provenance_mut::<u32>(TEST_FINISHER).write_volatile(FINISHER_PASS);
    }
    unreachable!("shutdown failed");
}
