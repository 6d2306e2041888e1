//! The filesystem engine: mount, directory operations, file I/O, and the
//! allocation bitmap.
//!
//! The superblock and the root-directory inode are held in memory for the
//! life of the mount. Every other piece of metadata goes through the block
//! cache, so a dirty release is the only write path to the device.

use alloc::vec::Vec;
use core::fmt;

use dataview::PodMethods as _;
use mutex_api::{Mutex, MutexFamily};

use crate::{
    BLOCK_SIZE, Block, BlockDevice, KtfsError,
    cache::BlockCache,
    layout::{
        BITS_PER_BLOCK, BitmapBlock, BlockPath, DENTRIES_PER_BLOCK, DirEntry, FILE_IN_USE, Inode,
        MAX_FILE_BLOCKS, NUM_DINDIRECT, NUM_DIRECT, REFS_PER_BLOCK, SuperBlock, blocks_for,
    },
};

/// Handle for an open file, unique for the life of the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// In-memory record of an open file.
struct OpenFile {
    id: FileId,
    dentry: DirEntry,
    size: u32,
    flags: u32,
}

struct FsState {
    /// The root-directory inode, mirrored to disk on every change.
    root: Inode,
    open: Vec<OpenFile>,
    next_id: u64,
}

/// A mounted KTFS volume.
pub struct Ktfs<D, F>
where
    F: MutexFamily,
{
    cache: BlockCache<D, F>,
    sb: SuperBlock,
    state: F::Mutex<FsState>,
}

impl<D, F> Ktfs<D, F>
where
    D: BlockDevice,
    F: MutexFamily,
{
    /// Mounts the volume: reads the superblock and the root-directory inode.
    pub fn mount(device: D, cache_capacity: usize) -> Result<Self, KtfsError> {
        let cache = BlockCache::new(device, cache_capacity);

        let sb: SuperBlock = cache.get(0)?.copy_at(0);
        sb.validate()?;

        let root_ino = sb.root_directory_inode;
        let root: Inode = cache
            .get(sb.inode_block(root_ino))?
            .copy_at(sb.inode_offset(root_ino));
        if root.size % size_of::<DirEntry>() as u32 != 0 {
            return Err(KtfsError::BadFormat);
        }

        Ok(Self {
            cache,
            sb,
            state: F::Mutex::new(FsState {
                root,
                open: Vec::new(),
                next_id: 1,
            }),
        })
    }

    /// Writes an empty filesystem onto `device`.
    ///
    /// The image gets `total_blocks` blocks in all, `inode_blocks` of them
    /// inode-table blocks, and a root directory with no entries.
    pub fn format(device: &D, total_blocks: u32, inode_blocks: u32) -> Result<(), KtfsError> {
        let bitmap_blocks = total_blocks.div_ceil(BITS_PER_BLOCK as u32);
        let sb = SuperBlock {
            block_count: total_blocks,
            bitmap_block_count: bitmap_blocks,
            inode_block_count: inode_blocks,
            root_directory_inode: 0,
            _pad: 0,
        };
        sb.validate()?;

        let mut block: Block = [0; BLOCK_SIZE];
        block.as_data_view_mut().write(0, &sb);
        device.write_block(0, &block)?;

        // bitmap: metadata blocks (superblock, bitmap, inode table) are taken
        let meta = sb.data_start();
        for bi in 0..u64::from(bitmap_blocks) {
            block = [0; BLOCK_SIZE];
            let first_bit = bi * BITS_PER_BLOCK as u64;
            for n in 0..BITS_PER_BLOCK as u64 {
                if first_bit + n >= meta {
                    break;
                }
                block[n as usize / 8] |= 1 << (n % 8);
            }
            device.write_block(sb.bitmap_start() + bi, &block)?;
        }

        // inode table, including the zero-length root directory (inode 0)
        block = [0; BLOCK_SIZE];
        for bi in 0..u64::from(inode_blocks) {
            device.write_block(sb.inode_start() + bi, &block)?;
        }

        Ok(())
    }

    /// The mounted superblock.
    #[must_use]
    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    /// Number of set bits in the allocation bitmap.
    ///
    /// Useful for conservation checks: this plus the free data blocks always
    /// equals the image size.
    pub fn allocated_blocks(&self) -> Result<u64, KtfsError> {
        let mut count = 0;
        for bi in 0..u64::from(self.sb.bitmap_block_count) {
            let block = self.cache.get(self.sb.bitmap_start() + bi)?;
            let bitmap: BitmapBlock = block.copy_at(0);
            let limit = bits_in_block(&self.sb, bi);
            count += (0..limit).filter(|&n| bitmap.is_set(n)).count() as u64;
        }
        Ok(count)
    }

    // DIRECTORY OPERATIONS

    /// Opens `name`, returning a handle and the current file size.
    ///
    /// A file can be open at most once; a second open of the same name fails
    /// until the first handle is closed.
    pub fn open(&self, name: &[u8]) -> Result<(FileId, u64), KtfsError> {
        if name.is_empty() {
            return Err(KtfsError::NotFound);
        }

        let mut state = self.state.lock();
        if state.open.iter().any(|f| f.dentry.is_named(name)) {
            return Err(KtfsError::AlreadyOpen);
        }

        let (_, dentry) = self
            .find_dentry(&state.root, name)?
            .ok_or(KtfsError::NotFound)?;
        let inode = self.read_inode(dentry.inode)?;

        let id = FileId(state.next_id);
        state.next_id += 1;
        state.open.push(OpenFile {
            id,
            dentry,
            size: inode.size,
            flags: FILE_IN_USE,
        });
        Ok((id, u64::from(inode.size)))
    }

    /// Drops the open record for `id`. Unknown handles are ignored.
    pub fn close(&self, id: FileId) {
        let mut state = self.state.lock();
        if let Some(i) = state.open.iter().position(|f| f.id == id) {
            state.open.swap_remove(i);
        }
    }

    /// Creates an empty file named `name`.
    ///
    /// Names longer than 14 bytes are truncated, as the directory entry
    /// cannot hold more.
    pub fn create(&self, name: &[u8]) -> Result<(), KtfsError> {
        if name.is_empty() {
            return Err(KtfsError::InvalidArgument);
        }

        let mut state = self.state.lock();
        if state.open.iter().any(|f| f.dentry.is_named(name)) {
            return Err(KtfsError::AlreadyOpen);
        }
        if self.find_dentry(&state.root, name)?.is_some() {
            return Err(KtfsError::AlreadyExists);
        }

        let ino = self.find_free_inode(&state.root)?;

        // grow the directory by one entry, allocating a fresh block when the
        // previous one just filled up
        let entries = dir_len(&state.root);
        let slot_block = entries / DENTRIES_PER_BLOCK;
        if entries % DENTRIES_PER_BLOCK == 0 {
            if slot_block >= NUM_DIRECT {
                return Err(KtfsError::DirectoryFull);
            }
            let abs = self.alloc_block()?;
            state.root.direct[slot_block] = self.rel_of(abs);
        }

        let mut dir = self
            .cache
            .get(self.sb.data_block(state.root.direct[slot_block]))?;
        dir.write_at(
            entries % DENTRIES_PER_BLOCK * size_of::<DirEntry>(),
            &DirEntry::new(ino, name),
        );
        dir.release_dirty()?;

        self.write_inode(ino, &Inode::zeroed())?;

        state.root.size += size_of::<DirEntry>() as u32;
        self.write_root(&state.root)?;
        Ok(())
    }

    /// Deletes the file named `name`, returning its blocks to the bitmap.
    ///
    /// An open file is closed first.
    pub fn delete(&self, name: &[u8]) -> Result<(), KtfsError> {
        let mut state = self.state.lock();
        if let Some(i) = state.open.iter().position(|f| f.dentry.is_named(name)) {
            state.open.swap_remove(i);
        }

        let (slot, dentry) = self
            .find_dentry(&state.root, name)?
            .ok_or(KtfsError::NotFound)?;
        let inode = self.read_inode(dentry.inode)?;
        self.free_file_blocks(&inode)?;

        // swap-remove: the last entry replaces the deleted one
        let entries = dir_len(&state.root);
        let last = entries - 1;
        if slot != last {
            let moved = self.dentry_at(&state.root, last)?;
            let mut dir = self
                .cache
                .get(self.sb.data_block(state.root.direct[slot / DENTRIES_PER_BLOCK]))?;
            dir.write_at(slot % DENTRIES_PER_BLOCK * size_of::<DirEntry>(), &moved);
            dir.release_dirty()?;
        }

        // the vacated tail slot may have been the only entry in its block
        if last % DENTRIES_PER_BLOCK == 0 {
            let rel = state.root.direct[last / DENTRIES_PER_BLOCK];
            self.free_block(self.sb.data_block(rel))?;
        }

        state.root.size -= size_of::<DirEntry>() as u32;
        self.write_root(&state.root)?;
        Ok(())
    }

    // FILE I/O

    /// Reads up to `buf.len()` bytes at `pos`, clipped to the file size.
    ///
    /// A read at or past the end transfers nothing.
    pub fn readat(&self, id: FileId, pos: u64, buf: &mut [u8]) -> Result<usize, KtfsError> {
        let (ino, size) = self.lookup(id)?;
        if pos >= size {
            return Ok(0);
        }
        let len = buf.len().min((size - pos) as usize);
        if len == 0 {
            return Ok(0);
        }

        let inode = self.read_inode(ino)?;
        let mut done = 0;
        while done < len {
            let at = pos + done as u64;
            let (fbi, off) = (at / BLOCK_SIZE as u64, at as usize % BLOCK_SIZE);
            let n = (BLOCK_SIZE - off).min(len - done);
            let rel = self.data_block_of(&inode, fbi)?;
            let block = self.cache.get(self.sb.data_block(rel))?;
            buf[done..done + n].copy_from_slice(&block[off..off + n]);
            done += n;
        }
        Ok(len)
    }

    /// Writes `buf` at `pos`, growing the file first if the write runs past
    /// the current end.
    pub fn writeat(&self, id: FileId, pos: u64, buf: &[u8]) -> Result<usize, KtfsError> {
        let (ino, size) = self.lookup(id)?;
        if pos > size {
            return Err(KtfsError::InvalidArgument);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let new_end = pos + buf.len() as u64;
        if new_end > size {
            self.set_end(id, new_end)?;
        }

        let inode = self.read_inode(ino)?;
        let len = buf.len();
        let mut done = 0;
        while done < len {
            let at = pos + done as u64;
            let (fbi, off) = (at / BLOCK_SIZE as u64, at as usize % BLOCK_SIZE);
            let n = (BLOCK_SIZE - off).min(len - done);
            let rel = self.data_block_of(&inode, fbi)?;
            let mut block = self.cache.get(self.sb.data_block(rel))?;
            block[off..off + n].copy_from_slice(&buf[done..done + n]);
            block.release_dirty()?;
            done += n;
        }
        Ok(len)
    }

    /// Current size of the open file `id`.
    pub fn end(&self, id: FileId) -> Result<u64, KtfsError> {
        Ok(self.lookup(id)?.1)
    }

    /// Resizes the open file `id` to `new_size` bytes.
    ///
    /// Growing allocates data blocks and any index blocks needed on the way;
    /// shrinking only trims the size (blocks come back at delete).
    pub fn set_end(&self, id: FileId, new_size: u64) -> Result<(), KtfsError> {
        if blocks_for(new_size) > MAX_FILE_BLOCKS as u64 {
            return Err(KtfsError::FileTooLarge);
        }

        let mut state = self.state.lock();
        let file = state
            .open
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or(KtfsError::BadHandle)?;
        let ino = file.dentry.inode;
        let mut inode = self.read_inode(ino)?;

        let old_blocks = blocks_for(u64::from(inode.size));
        let new_blocks = blocks_for(new_size);
        for fbi in old_blocks..new_blocks {
            self.grow_one_block(&mut inode, fbi)?;
        }

        inode.size = u32::try_from(new_size).map_err(|_| KtfsError::FileTooLarge)?;
        file.size = inode.size;
        self.write_inode(ino, &inode)?;
        Ok(())
    }

    // INTERNAL: directory and inode plumbing

    fn lookup(&self, id: FileId) -> Result<(u16, u64), KtfsError> {
        let state = self.state.lock();
        let file = state
            .open
            .iter()
            .find(|f| f.id == id)
            .ok_or(KtfsError::BadHandle)?;
        debug_assert!(file.flags & FILE_IN_USE != 0);
        Ok((file.dentry.inode, u64::from(file.size)))
    }

    fn dentry_at(&self, root: &Inode, slot: usize) -> Result<DirEntry, KtfsError> {
        let rel = root.direct[slot / DENTRIES_PER_BLOCK];
        let block = self.cache.get(self.sb.data_block(rel))?;
        Ok(block.copy_at(slot % DENTRIES_PER_BLOCK * size_of::<DirEntry>()))
    }

    fn find_dentry(
        &self,
        root: &Inode,
        name: &[u8],
    ) -> Result<Option<(usize, DirEntry)>, KtfsError> {
        for slot in 0..dir_len(root) {
            let dentry = self.dentry_at(root, slot)?;
            if dentry.is_named(name) {
                return Ok(Some((slot, dentry)));
            }
        }
        Ok(None)
    }

    /// Lowest inode number that no directory entry references.
    fn find_free_inode(&self, root: &Inode) -> Result<u16, KtfsError> {
        let count = self.sb.inode_count() as usize;
        let mut used = alloc::vec![false; count];
        used[usize::from(self.sb.root_directory_inode)] = true;
        for slot in 0..dir_len(root) {
            let dentry = self.dentry_at(root, slot)?;
            if let Some(u) = used.get_mut(usize::from(dentry.inode)) {
                *u = true;
            }
        }
        used.iter()
            .position(|&u| !u)
            .map(|ino| ino as u16)
            .ok_or(KtfsError::NoInodeBlocks)
    }

    fn read_inode(&self, ino: u16) -> Result<Inode, KtfsError> {
        let block = self.cache.get(self.sb.inode_block(ino))?;
        Ok(block.copy_at(self.sb.inode_offset(ino)))
    }

    fn write_inode(&self, ino: u16, inode: &Inode) -> Result<(), KtfsError> {
        let mut block = self.cache.get(self.sb.inode_block(ino))?;
        block.write_at(self.sb.inode_offset(ino), inode);
        block.release_dirty()
    }

    fn write_root(&self, root: &Inode) -> Result<(), KtfsError> {
        self.write_inode(self.sb.root_directory_inode, root)
    }

    // INTERNAL: block translation

    /// Data-region-relative block number of file block `fbi`.
    fn data_block_of(&self, inode: &Inode, fbi: u64) -> Result<u32, KtfsError> {
        match BlockPath::of(fbi)? {
            BlockPath::Direct { slot } => Ok(inode.direct[slot]),
            BlockPath::Indirect { idx } => self.read_ref(inode.indirect, idx),
            BlockPath::DoubleIndirect { slot, outer, inner } => {
                let mid = self.read_ref(inode.dindirect[slot], outer)?;
                self.read_ref(mid, inner)
            }
        }
    }

    /// One entry of the index block at relative block `rel`.
    fn read_ref(&self, rel: u32, idx: usize) -> Result<u32, KtfsError> {
        debug_assert!(idx < REFS_PER_BLOCK);
        let block = self.cache.get(self.sb.data_block(rel))?;
        Ok(block.copy_at(idx * size_of::<u32>()))
    }

    fn write_ref(&self, rel: u32, idx: usize, value: u32) -> Result<(), KtfsError> {
        let mut block = self.cache.get(self.sb.data_block(rel))?;
        block.write_at(idx * size_of::<u32>(), &value);
        block.release_dirty()
    }

    /// Allocates file block `fbi`, installing index blocks on the way.
    ///
    /// Callers grow a file one block at a time, in order, so an index block
    /// is fresh exactly when `fbi` is the first file block routed through it.
    fn grow_one_block(&self, inode: &mut Inode, fbi: u64) -> Result<(), KtfsError> {
        let data = self.rel_of(self.alloc_block()?);
        match BlockPath::of(fbi)? {
            BlockPath::Direct { slot } => inode.direct[slot] = data,
            BlockPath::Indirect { idx } => {
                if idx == 0 {
                    inode.indirect = self.rel_of(self.alloc_block()?);
                }
                self.write_ref(inode.indirect, idx, data)?;
            }
            BlockPath::DoubleIndirect { slot, outer, inner } => {
                if outer == 0 && inner == 0 {
                    inode.dindirect[slot] = self.rel_of(self.alloc_block()?);
                }
                let mid = if inner == 0 {
                    let mid = self.rel_of(self.alloc_block()?);
                    self.write_ref(inode.dindirect[slot], outer, mid)?;
                    mid
                } else {
                    self.read_ref(inode.dindirect[slot], outer)?
                };
                self.write_ref(mid, inner, data)?;
            }
        }
        Ok(())
    }

    /// Clears the bitmap bits of every block `inode` references, index
    /// blocks included.
    fn free_file_blocks(&self, inode: &Inode) -> Result<(), KtfsError> {
        let blocks = blocks_for(u64::from(inode.size));
        for fbi in 0..blocks {
            let rel = self.data_block_of(inode, fbi)?;
            self.free_block(self.sb.data_block(rel))?;
        }
        if blocks > NUM_DIRECT as u64 {
            self.free_block(self.sb.data_block(inode.indirect))?;
        }
        let per_dind = (REFS_PER_BLOCK * REFS_PER_BLOCK) as u64;
        let dind_region = blocks.saturating_sub((NUM_DIRECT + REFS_PER_BLOCK) as u64);
        for slot in 0..NUM_DINDIRECT {
            let in_slot = dind_region
                .saturating_sub(slot as u64 * per_dind)
                .min(per_dind);
            if in_slot == 0 {
                break;
            }
            for outer in 0..in_slot.div_ceil(REFS_PER_BLOCK as u64) {
                let mid = self.read_ref(inode.dindirect[slot], outer as usize)?;
                self.free_block(self.sb.data_block(mid))?;
            }
            self.free_block(self.sb.data_block(inode.dindirect[slot]))?;
        }
        Ok(())
    }

    // INTERNAL: allocation bitmap

    fn rel_of(&self, abs: u64) -> u32 {
        (abs - self.sb.data_start()) as u32
    }

    /// Sets the first clear bitmap bit and returns its absolute block number.
    fn alloc_block(&self) -> Result<u64, KtfsError> {
        for bi in 0..u64::from(self.sb.bitmap_block_count) {
            let mut block = self.cache.get(self.sb.bitmap_start() + bi)?;
            let mut bitmap: BitmapBlock = block.copy_at(0);
            let limit = bits_in_block(&self.sb, bi);
            if let Some(n) = bitmap.first_clear(limit) {
                bitmap.set(n);
                block.write_at(0, &bitmap);
                block.release_dirty()?;
                return Ok(bi * BITS_PER_BLOCK as u64 + n as u64);
            }
        }
        Err(KtfsError::NoDataBlocks)
    }

    /// Clears the bitmap bit of the absolute block `abs`.
    ///
    /// Only data-region blocks may be freed; anything else means the inode
    /// tree is corrupt.
    fn free_block(&self, abs: u64) -> Result<(), KtfsError> {
        if abs < self.sb.data_start() || abs >= u64::from(self.sb.block_count) {
            return Err(KtfsError::OutOfRange);
        }
        let mut block = self.cache.get(self.sb.bitmap_start() + abs / BITS_PER_BLOCK as u64)?;
        let mut bitmap: BitmapBlock = block.copy_at(0);
        bitmap.clear(abs as usize % BITS_PER_BLOCK);
        block.write_at(0, &bitmap);
        block.release_dirty()
    }
}

fn dir_len(root: &Inode) -> usize {
    root.size as usize / size_of::<DirEntry>()
}

/// Number of meaningful bits in bitmap block `bi`.
fn bits_in_block(sb: &SuperBlock, bi: u64) -> usize {
    let first = bi * BITS_PER_BLOCK as u64;
    (u64::from(sb.block_count).saturating_sub(first)).min(BITS_PER_BLOCK as u64) as usize
}
