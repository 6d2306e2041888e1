//! Mounts the KTFS engine over the primary virtio disk and exposes files
//! as I/O endpoints.
//!
//! The engine itself lives in the `ktfs` crate; here it runs behind kernel
//! sleep-locks, with the disk driver as its block device.

use ktfs::{BLOCK_SIZE, Block, BlockDevice, FileId, Ktfs, KtfsError};

use crate::{
    device,
    error::{KernelError, Result},
    interrupt::IrqCell,
    io::{Io, IoCtl, IoOps, seekio},
    param::CACHE_CAPACITY,
    thread::KMutexFamily,
};

/// Any block-granular endpoint as the engine's block device. The mount
/// normally sits on the virtio disk, but anything with 512-byte
/// `readat`/`writeat` works (a memory endpoint, for one).
struct IoDisk(Io);

impl BlockDevice for IoDisk {
    fn read_block(&self, index: u64, data: &mut Block) -> core::result::Result<(), KtfsError> {
        match self.0.readat(index * BLOCK_SIZE as u64, data) {
            Ok(n) if n == BLOCK_SIZE => Ok(()),
            _ => Err(KtfsError::Disk),
        }
    }

    fn write_block(&self, index: u64, data: &Block) -> core::result::Result<(), KtfsError> {
        match self.0.writeat(index * BLOCK_SIZE as u64, data) {
            Ok(n) if n == BLOCK_SIZE => Ok(()),
            _ => Err(KtfsError::Disk),
        }
    }
}

type KernelFs = Ktfs<IoDisk, KMutexFamily>;

struct MountSlot(Option<&'static KernelFs>);

unsafe impl Send for MountSlot {}

static MOUNT: IrqCell<MountSlot> = IrqCell::new(MountSlot(None));

/// Mounts the filesystem from the first attached disk, if there is one.
pub fn init() {
    let io = match device::open("blk", 0) {
        Ok(io) => io,
        Err(e) => {
            log::warn!("fs: no block device, skipping mount: {e}");
            return;
        }
    };
    if let Err(e) = mount(io) {
        log::warn!("fs: mount failed: {e}");
    }
}

/// Mounts KTFS over `io`, whose granularity must divide the 512-byte
/// block size.
pub fn mount(io: Io) -> Result<()> {
    if BLOCK_SIZE % io.blksz() != 0 {
        return Err(KernelError::BadFormat);
    }
    let fs = Ktfs::mount(IoDisk(io), CACHE_CAPACITY).map_err(KernelError::from)?;
    let fs = alloc::boxed::Box::leak(alloc::boxed::Box::new(fs));
    MOUNT.with(|m| m.0 = Some(fs));
    let sb = fs.superblock();
    log::info!(
        "fs: mounted, {} blocks, {} inodes",
        sb.block_count,
        sb.inode_count()
    );
    Ok(())
}

fn mounted() -> Result<&'static KernelFs> {
    MOUNT.with(|m| m.0).ok_or(KernelError::NoDevice)
}

/// Opens `name` as a seekable endpoint.
pub fn open(name: &[u8]) -> Result<Io> {
    let fs = mounted()?;
    let (id, _size) = fs.open(name)?;
    seekio::create_seekable_io(Io::new(KtfsFile { fs, id }))
}

/// Creates an empty file.
pub fn create(name: &[u8]) -> Result<()> {
    Ok(mounted()?.create(name)?)
}

/// Deletes a file, closing it first if open.
pub fn delete(name: &[u8]) -> Result<()> {
    Ok(mounted()?.delete(name)?)
}

/// An open KTFS file. Positionless; the seekable wrapper adds the cursor.
struct KtfsFile {
    fs: &'static KernelFs,
    id: FileId,
}

impl IoOps for KtfsFile {
    fn readat(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(self.fs.readat(self.id, pos, buf)?)
    }

    fn writeat(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        Ok(self.fs.writeat(self.id, pos, buf)?)
    }

    fn cntl(&self, op: IoCtl) -> Result<usize> {
        match op {
            IoCtl::GetBlkSz => Ok(1),
            IoCtl::GetEnd(out) => {
                *out = self.fs.end(self.id)?;
                Ok(0)
            }
            IoCtl::SetEnd(end) => {
                self.fs.set_end(self.id, end)?;
                Ok(0)
            }
            _ => Err(KernelError::NotSupported),
        }
    }

    fn close(&self) {
        self.fs.close(self.id);
    }
}
