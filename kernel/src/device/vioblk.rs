//! The virtio block driver.
//!
//! One queue, three-descriptor chains (header, data, status), requests
//! serialized by the device lock. The driving thread publishes a chain,
//! notifies, and sleeps on the completion condition; the ISR walks the
//! used ring, frees chains, and broadcasts.

use core::ptr;

use crate::{
    device::{
        self,
        virtio::{
            BLK_S_OK, BLK_T_IN, BLK_T_OUT, CONFIG_BLK_SIZE, CONFIG_CAPACITY, DEVICE_ID_BLOCK,
            DescFlags, DeviceStatus, FeaturesHigh, FeaturesLow, MAGIC, MmioRegister, QUEUE_SIZE,
            VERSION, VirtioBlkReq, VirtqAvail, VirtqDesc, VirtqUsed,
        },
    },
    error::{KernelError, Result},
    interrupt::{self, IrqCell, plic},
    io::{Io, IoCtl, IoOps},
    memory::{
        layout::{VIRTIO0_IRQ, VIRTIO0_MMIO_BASE, VIRTIO_COUNT, VIRTIO_MMIO_STRIDE},
        page,
    },
    param,
    thread::{Condition, Lock},
};

/// Ring layout within the queue page.
const DESC_OFFSET: usize = 0;
const AVAIL_OFFSET: usize = 0x80;
const USED_OFFSET: usize = 0x100;

struct Rings {
    desc: *mut [VirtqDesc; QUEUE_SIZE],
    avail: *mut VirtqAvail,
    used: *mut VirtqUsed,
}

struct DiskState {
    rings: Rings,
    free: [bool; QUEUE_SIZE],
    /// Request headers, one per potential chain head.
    reqs: [VirtioBlkReq; QUEUE_SIZE],
    /// Status bytes the device writes, one per chain head.
    status: [u8; QUEUE_SIZE],
    /// Whether the chain headed by each descriptor is still in flight.
    in_flight: [bool; QUEUE_SIZE],
    used_idx: u16,
}

unsafe impl Send for DiskState {}

pub struct VioBlk {
    regs: usize,
    /// Negotiated block size; position and length granularity.
    blksz: usize,
    /// Device capacity in bytes.
    capacity: u64,
    /// Serializes request submission.
    lock: Lock,
    io_done: Condition,
    state: IrqCell<DiskState>,
}

fn read_reg(base: usize, reg: MmioRegister) -> u32 {
    unsafe { ptr::with_exposed_provenance::<u32>(base + reg as usize).read_volatile() }
}

fn write_reg(base: usize, reg: MmioRegister, value: u32) {
    unsafe { ptr::with_exposed_provenance_mut::<u32>(base + reg as usize).write_volatile(value) }
}

fn read_config<T: Copy>(base: usize, offset: usize) -> T {
    unsafe {
        ptr::with_exposed_provenance::<T>(base + MmioRegister::Config as usize + offset)
            .read_volatile()
    }
}

/// Attached disks, indexed by virtio slot.
struct Disks([Option<&'static VioBlk>; VIRTIO_COUNT]);

unsafe impl Send for Disks {}

static DISKS: IrqCell<Disks> = IrqCell::new(Disks([None; VIRTIO_COUNT]));

/// Probes every virtio MMIO slot and attaches each block device found.
pub fn attach_all() {
    for slot in 0..VIRTIO_COUNT {
        let base = VIRTIO0_MMIO_BASE + slot * VIRTIO_MMIO_STRIDE;
        if read_reg(base, MmioRegister::MagicValue) != MAGIC
            || read_reg(base, MmioRegister::Version) != VERSION
            || read_reg(base, MmioRegister::DeviceId) != DEVICE_ID_BLOCK
        {
            continue;
        }
        match VioBlk::attach(base) {
            Ok(disk) => {
                let disk: &'static VioBlk = alloc::boxed::Box::leak(alloc::boxed::Box::new(disk));
                DISKS.with(|d| d.0[slot] = Some(disk));
                plic::enable(VIRTIO0_IRQ + slot, param::VIOBLK_INTR_PRIO, vioblk_isr, slot);
                device::register("blk", vioblk_open, slot);
                log::info!(
                    "vioblk{slot}: {} blocks of {} bytes",
                    disk.capacity / disk.blksz as u64,
                    disk.blksz
                );
            }
            Err(e) => log::warn!("vioblk{slot}: attach failed: {e}"),
        }
    }
}

fn vioblk_isr(slot: usize) {
    if let Some(disk) = DISKS.with(|d| d.0[slot]) {
        disk.handle_interrupt();
    }
}

fn vioblk_open(slot: usize) -> Result<Io> {
    let disk = DISKS.with(|d| d.0[slot]).ok_or(KernelError::NoDevice)?;
    Ok(Io::new(VioBlkIo(disk)))
}

impl VioBlk {
    /// Runs the boot handshake and brings the queue up.
    fn attach(base: usize) -> Result<Self> {
        let mut status = DeviceStatus::empty();
        write_reg(base, MmioRegister::Status, status.bits()); // reset
        status |= DeviceStatus::ACKNOWLEDGE;
        write_reg(base, MmioRegister::Status, status.bits());
        status |= DeviceStatus::DRIVER;
        write_reg(base, MmioRegister::Status, status.bits());

        // feature bits 0..31: indirect descriptors are required, the block
        // size and topology hints are nice to have
        write_reg(base, MmioRegister::DeviceFeaturesSel, 0);
        let low = FeaturesLow::from_bits_retain(read_reg(base, MmioRegister::DeviceFeatures));
        if !low.contains(FeaturesLow::RING_INDIRECT_DESC) {
            return Err(KernelError::BadFormat);
        }
        let mut accept = FeaturesLow::RING_INDIRECT_DESC;
        accept |= low & (FeaturesLow::BLK_BLK_SIZE | FeaturesLow::BLK_TOPOLOGY);
        write_reg(base, MmioRegister::DriverFeaturesSel, 0);
        write_reg(base, MmioRegister::DriverFeatures, accept.bits());

        // feature bits 32..63: VERSION_1 and RING_RESET are required
        write_reg(base, MmioRegister::DeviceFeaturesSel, 1);
        let high = FeaturesHigh::from_bits_retain(read_reg(base, MmioRegister::DeviceFeatures));
        if !high.contains(FeaturesHigh::VERSION_1 | FeaturesHigh::RING_RESET) {
            return Err(KernelError::BadFormat);
        }
        write_reg(base, MmioRegister::DriverFeaturesSel, 1);
        write_reg(
            base,
            MmioRegister::DriverFeatures,
            (FeaturesHigh::VERSION_1 | FeaturesHigh::RING_RESET).bits(),
        );

        status |= DeviceStatus::FEATURES_OK;
        write_reg(base, MmioRegister::Status, status.bits());
        let readback = DeviceStatus::from_bits_retain(read_reg(base, MmioRegister::Status));
        if !readback.contains(DeviceStatus::FEATURES_OK) {
            return Err(KernelError::BadFormat);
        }

        let blksz = if accept.contains(FeaturesLow::BLK_BLK_SIZE) {
            read_config::<u32>(base, CONFIG_BLK_SIZE) as usize
        } else {
            512
        };
        // capacity is always reported in 512-byte sectors
        let capacity = read_config::<u64>(base, CONFIG_CAPACITY) * 512;

        // queue 0
        write_reg(base, MmioRegister::QueueSel, 0);
        if read_reg(base, MmioRegister::QueueReady) != 0 {
            return Err(KernelError::Busy);
        }
        let max = read_reg(base, MmioRegister::QueueNumMax) as usize;
        if max < QUEUE_SIZE {
            return Err(KernelError::BadFormat);
        }
        write_reg(base, MmioRegister::QueueNum, QUEUE_SIZE as u32);

        let ring_page = page::alloc_page().ok_or(KernelError::OutOfMemory)?;
        let ring_base = ring_page.addr().get();
        let rings = Rings {
            desc: (ring_base + DESC_OFFSET) as *mut _,
            avail: (ring_base + AVAIL_OFFSET) as *mut _,
            used: (ring_base + USED_OFFSET) as *mut _,
        };
        write_reg(base, MmioRegister::QueueDescLow, ring_base as u32);
        write_reg(base, MmioRegister::QueueDescHigh, (ring_base >> 32) as u32);
        let avail_addr = ring_base + AVAIL_OFFSET;
        write_reg(base, MmioRegister::DriverDescLow, avail_addr as u32);
        write_reg(base, MmioRegister::DriverDescHigh, (avail_addr >> 32) as u32);
        let used_addr = ring_base + USED_OFFSET;
        write_reg(base, MmioRegister::DeviceDescLow, used_addr as u32);
        write_reg(base, MmioRegister::DeviceDescHigh, (used_addr >> 32) as u32);
        write_reg(base, MmioRegister::QueueReady, 1);

        status |= DeviceStatus::DRIVER_OK;
        write_reg(base, MmioRegister::Status, status.bits());

        Ok(Self {
            regs: base,
            blksz,
            capacity,
            lock: Lock::new(),
            io_done: Condition::new("vioblk.io_done"),
            state: IrqCell::new(DiskState {
                rings,
                free: [true; QUEUE_SIZE],
                reqs: [VirtioBlkReq {
                    ty: BLK_T_IN,
                    reserved: 0,
                    sector: 0,
                }; QUEUE_SIZE],
                status: [0; QUEUE_SIZE],
                in_flight: [false; QUEUE_SIZE],
                used_idx: 0,
            }),
        })
    }

    pub fn blksz(&self) -> usize {
        self.blksz
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Checks request granularity against the negotiated block size and
    /// the device capacity.
    fn check_range(&self, pos: u64, len: usize) -> Result<()> {
        if pos % self.blksz as u64 != 0 || len % self.blksz != 0 {
            return Err(KernelError::InvalidArgument);
        }
        if pos + len as u64 > self.capacity {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }

    /// One full request cycle. `write` chooses the transfer direction.
    fn transfer(&self, pos: u64, buf: *mut u8, len: usize, write: bool) -> Result<usize> {
        if len == 0 {
            return Ok(0);
        }

        self.lock.acquire();
        debug_assert!(self.lock.holding());
        let res = interrupt::free(|| {
            let head = unsafe {
                let state = self.state.get_mut_unchecked();
                let Some([d0, d1, d2]) = alloc_chain(state) else {
                    // the device lock serializes requests; three of eight
                    // descriptors are always free here
                    unreachable!("descriptor pool exhausted");
                };

                state.reqs[d0] = VirtioBlkReq {
                    ty: if write { BLK_T_OUT } else { BLK_T_IN },
                    reserved: 0,
                    sector: pos / 512,
                };
                state.status[d0] = 0xff; // device writes 0 on success
                state.in_flight[d0] = true;

                let desc = &mut *state.rings.desc;
                desc[d0] = VirtqDesc {
                    addr: ptr::from_ref(&state.reqs[d0]).addr() as u64,
                    len: size_of::<VirtioBlkReq>() as u32,
                    flags: DescFlags::NEXT.bits(),
                    next: d1 as u16,
                };
                let data_flags = if write {
                    DescFlags::NEXT
                } else {
                    DescFlags::NEXT | DescFlags::WRITE
                };
                desc[d1] = VirtqDesc {
                    addr: buf.addr() as u64,
                    len: len as u32,
                    flags: data_flags.bits(),
                    next: d2 as u16,
                };
                desc[d2] = VirtqDesc {
                    addr: ptr::from_ref(&state.status[d0]).addr() as u64,
                    len: 1,
                    flags: DescFlags::WRITE.bits(),
                    next: 0,
                };

                // publish the chain head; the fetch_add is the release
                // fence ahead of the notify
                let avail = &mut *state.rings.avail;
                let idx = avail.idx.load(core::sync::atomic::Ordering::Relaxed);
                avail.ring[idx as usize % QUEUE_SIZE] = d0 as u16;
                avail
                    .idx
                    .fetch_add(1, core::sync::atomic::Ordering::Release);
                d0
            };

            write_reg(self.regs, MmioRegister::QueueNotify, 0);

            // sleep until the ISR retires our chain
            unsafe {
                while self.state.get_mut_unchecked().in_flight[head] {
                    self.io_done.wait_disabled();
                }
            }

            match unsafe { self.state.get_mut_unchecked().status[head] } {
                BLK_S_OK => Ok(len),
                BLK_S_UNSUPP => Err(KernelError::NotSupported),
                BLK_S_IOERR => Err(KernelError::Io),
                status => {
                    log::warn!("vioblk: unknown request status {status}");
                    Err(KernelError::Io)
                }
            }
        });
        self.lock.release();
        res
    }

    pub fn readat(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_range(pos, buf.len())?;
        self.transfer(pos, buf.as_mut_ptr(), buf.len(), false)
    }

    pub fn writeat(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        self.check_range(pos, buf.len())?;
        self.transfer(pos, buf.as_ptr().cast_mut(), buf.len(), true)
    }

    /// Retires completed chains. Runs in ISR context.
    fn handle_interrupt(&self) {
        let ack = read_reg(self.regs, MmioRegister::InterruptStatus) & 0x3;
        write_reg(self.regs, MmioRegister::InterruptAck, ack);

        self.state.with(|state| {
            let used = unsafe { &*state.rings.used };
            loop {
                let device_idx = used.idx.load(core::sync::atomic::Ordering::Acquire);
                if state.used_idx == device_idx {
                    break;
                }
                let elem = used.ring[state.used_idx as usize % QUEUE_SIZE];
                let head = elem.id as usize;
                state.in_flight[head] = false;
                free_chain(state, head);
                state.used_idx = state.used_idx.wrapping_add(1);
            }
        });
        self.io_done.broadcast();
    }
}

/// Takes three free descriptors, or puts everything back.
fn alloc_chain(state: &mut DiskState) -> Option<[usize; 3]> {
    let mut picked = [0; 3];
    let mut found = 0;
    for (i, free) in state.free.iter_mut().enumerate() {
        if *free {
            *free = false;
            picked[found] = i;
            found += 1;
            if found == 3 {
                return Some(picked);
            }
        }
    }
    for &i in &picked[..found] {
        state.free[i] = true;
    }
    None
}

/// Returns every descriptor of the chain headed by `head` to the pool.
fn free_chain(state: &mut DiskState, head: usize) {
    let mut i = head;
    loop {
        let desc = unsafe { (*state.rings.desc)[i] };
        assert!(!state.free[i], "descriptor freed twice");
        unsafe {
            (*state.rings.desc)[i] = VirtqDesc::EMPTY;
        }
        state.free[i] = true;
        if DescFlags::from_bits_retain(desc.flags).contains(DescFlags::NEXT) {
            i = desc.next as usize;
        } else {
            break;
        }
    }
}

/// Raw block-granular endpoint over a disk, for `devopen("blk", n)`.
struct VioBlkIo(&'static VioBlk);

impl IoOps for VioBlkIo {
    fn readat(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.0.readat(pos, buf)
    }

    fn writeat(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        self.0.writeat(pos, buf)
    }

    fn cntl(&self, op: IoCtl) -> Result<usize> {
        match op {
            IoCtl::GetBlkSz => Ok(self.0.blksz()),
            IoCtl::GetEnd(out) => {
                *out = self.0.capacity();
                Ok(0)
            }
            _ => Err(KernelError::NotSupported),
        }
    }
}
