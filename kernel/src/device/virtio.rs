//! Virtio-over-MMIO definitions: the version-2 register window, feature
//! and status bits, and the split virtqueue structures.
//!
//! Reference: Virtio 1.1, sections 4.2 (MMIO) and 2.6 (virtqueues).

use core::sync::atomic::AtomicU16;

use bitflags::bitflags;

/// MMIO register offsets.
#[derive(Debug, Clone, Copy)]
#[repr(usize)]
pub enum MmioRegister {
    MagicValue = 0x000, // 0x74726976 ("virt")
    Version = 0x004,    // must be 2
    DeviceId = 0x008,   // 2 is a block device
    VendorId = 0x00c,
    DeviceFeatures = 0x010,
    DeviceFeaturesSel = 0x014,
    DriverFeatures = 0x020,
    DriverFeaturesSel = 0x024,
    QueueSel = 0x030,
    QueueNumMax = 0x034,
    QueueNum = 0x038,
    QueueReady = 0x044,
    QueueNotify = 0x050,
    InterruptStatus = 0x060,
    InterruptAck = 0x064,
    Status = 0x070,
    QueueDescLow = 0x080,
    QueueDescHigh = 0x084,
    DriverDescLow = 0x090,
    DriverDescHigh = 0x094,
    DeviceDescLow = 0x0a0,
    DeviceDescHigh = 0x0a4,
    Config = 0x100,
}

pub const MAGIC: u32 = 0x7472_6976;
pub const VERSION: u32 = 2;
pub const DEVICE_ID_BLOCK: u32 = 2;

bitflags! {
    /// Device status, written during the boot handshake.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const DEVICE_NEEDS_RESET = 64;
        const FAILED = 128;
    }
}

bitflags! {
    /// Feature bits 0..31 (device-specific plus low transport bits).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeaturesLow: u32 {
        const BLK_SIZE_MAX = 1 << 1;
        const BLK_SEG_MAX = 1 << 2;
        const BLK_GEOMETRY = 1 << 4;
        const BLK_RO = 1 << 5;
        const BLK_BLK_SIZE = 1 << 6;
        const BLK_FLUSH = 1 << 9;
        const BLK_TOPOLOGY = 1 << 10;
        const BLK_CONFIG_WCE = 1 << 11;
        const BLK_MQ = 1 << 12;
        const ANY_LAYOUT = 1 << 27;
        const RING_INDIRECT_DESC = 1 << 28;
        const RING_EVENT_IDX = 1 << 29;
    }
}

bitflags! {
    /// Feature bits 32..63, accessed through the select registers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeaturesHigh: u32 {
        const VERSION_1 = 1 << (32 - 32);
        const ACCESS_PLATFORM = 1 << (33 - 32);
        const RING_PACKED = 1 << (34 - 32);
        const RING_RESET = 1 << (40 - 32);
    }
}

/// Queue depth: every request is a three-descriptor chain, so eight covers
/// a couple of requests in flight.
pub const QUEUE_SIZE: usize = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// Chained to `next`.
        const NEXT = 1;
        /// Device writes this buffer (driver reads it back).
        const WRITE = 2;
    }
}

/// One descriptor of the split virtqueue.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl VirtqDesc {
    pub const EMPTY: Self = Self {
        addr: 0,
        len: 0,
        flags: 0,
        next: 0,
    };
}

/// The available ring: chain heads the driver wants serviced.
#[repr(C)]
pub struct VirtqAvail {
    pub flags: u16,
    pub idx: AtomicU16,
    pub ring: [u16; QUEUE_SIZE],
    pub used_event: u16,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct VirtqUsedElem {
    /// Head descriptor of the completed chain.
    pub id: u32,
    pub len: u32,
}

/// The used ring: chains the device has finished.
#[repr(C)]
pub struct VirtqUsed {
    pub flags: u16,
    pub idx: AtomicU16,
    pub ring: [VirtqUsedElem; QUEUE_SIZE],
    pub avail_event: u16,
}

// block requests (Virtio 1.1 §5.2.6)

pub const BLK_T_IN: u32 = 0;
pub const BLK_T_OUT: u32 = 1;

pub const BLK_S_OK: u8 = 0;
pub const BLK_S_IOERR: u8 = 1;
pub const BLK_S_UNSUPP: u8 = 2;

/// Header descriptor of every block request.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct VirtioBlkReq {
    pub ty: u32,
    pub reserved: u32,
    pub sector: u64,
}

// virtio-blk config space offsets (from `MmioRegister::Config`)
pub const CONFIG_CAPACITY: usize = 0; // le64, in 512-byte sectors
pub const CONFIG_BLK_SIZE: usize = 20; // le32, with BLK_BLK_SIZE
