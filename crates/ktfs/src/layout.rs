//! On-disk data types and image geometry.
//!
//! All structures are little-endian and packed exactly as they appear on
//! disk; `dataview::Pod` gives us checked byte-level views into cached
//! blocks.

use dataview::Pod;

use crate::{BLOCK_SIZE, KtfsError};

/// Number of direct data-block slots in an inode.
pub const NUM_DIRECT: usize = 3;
/// Number of indirect index-block slots in an inode.
pub const NUM_INDIRECT: usize = 1;
/// Number of double-indirect index-block slots in an inode.
pub const NUM_DINDIRECT: usize = 2;

/// Block references held by one index block.
pub const REFS_PER_BLOCK: usize = BLOCK_SIZE / size_of::<u32>();

/// Inodes per inode-table block.
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / size_of::<Inode>();

/// Directory entries per directory data block.
pub const DENTRIES_PER_BLOCK: usize = BLOCK_SIZE / size_of::<DirEntry>();

/// Allocation bits per bitmap block.
pub const BITS_PER_BLOCK: usize = BLOCK_SIZE * 8;

/// Longest representable file name, in bytes.
pub const MAX_NAME_LEN: usize = 14;

/// Largest file size an inode can address, in blocks.
pub const MAX_FILE_BLOCKS: usize =
    NUM_DIRECT + NUM_INDIRECT * REFS_PER_BLOCK + NUM_DINDIRECT * REFS_PER_BLOCK * REFS_PER_BLOCK;

/// Flag bit: the inode backs an open file record.
pub const FILE_IN_USE: u32 = 1 << 0;

/// Block 0 of every image.
///
/// The block-count fields describe the image front to back; the data region
/// is whatever remains after the superblock, bitmap, and inode table.
#[derive(Debug, Clone, Copy, Pod)]
#[repr(C)]
pub struct SuperBlock {
    pub block_count: u32,
    pub bitmap_block_count: u32,
    pub inode_block_count: u32,
    pub root_directory_inode: u16,
    pub _pad: u16,
}

impl SuperBlock {
    /// First bitmap block.
    #[must_use]
    pub fn bitmap_start(&self) -> u64 {
        1
    }

    /// First inode-table block.
    #[must_use]
    pub fn inode_start(&self) -> u64 {
        1 + u64::from(self.bitmap_block_count)
    }

    /// First data block.
    #[must_use]
    pub fn data_start(&self) -> u64 {
        self.inode_start() + u64::from(self.inode_block_count)
    }

    /// Number of inodes the table can hold.
    #[must_use]
    pub fn inode_count(&self) -> u32 {
        self.inode_block_count * INODES_PER_BLOCK as u32
    }

    /// Absolute block holding inode `ino`.
    #[must_use]
    pub fn inode_block(&self, ino: u16) -> u64 {
        self.inode_start() + u64::from(ino) / INODES_PER_BLOCK as u64
    }

    /// Byte offset of inode `ino` within its block.
    #[must_use]
    pub fn inode_offset(&self, ino: u16) -> usize {
        usize::from(ino) % INODES_PER_BLOCK * size_of::<Inode>()
    }

    /// Absolute block number of data-region-relative block `rel`.
    #[must_use]
    pub fn data_block(&self, rel: u32) -> u64 {
        self.data_start() + u64::from(rel)
    }

    /// Sanity-checks the geometry against the device.
    pub fn validate(&self) -> Result<(), KtfsError> {
        let meta = 1 + u64::from(self.bitmap_block_count) + u64::from(self.inode_block_count);
        if self.block_count == 0
            || meta >= u64::from(self.block_count)
            || u64::from(self.bitmap_block_count) * (BITS_PER_BLOCK as u64)
                < u64::from(self.block_count)
            || u32::from(self.root_directory_inode) >= self.inode_count()
        {
            return Err(KtfsError::BadFormat);
        }
        Ok(())
    }
}

/// A 32-byte on-disk inode.
///
/// Direct, indirect, and double-indirect slots hold data-region-relative
/// block numbers. A slot is meaningful only while the corresponding part of
/// the file (by `size`) exists; there is no "null" marker.
#[derive(Debug, Clone, Copy, Pod)]
#[repr(C)]
pub struct Inode {
    pub size: u32,
    pub flags: u32,
    pub direct: [u32; NUM_DIRECT],
    pub indirect: u32,
    pub dindirect: [u32; NUM_DINDIRECT],
}

const _: () = assert!(size_of::<Inode>() == 32);
const _: () = assert!(size_of::<SuperBlock>() == 16);
const _: () = assert!(size_of::<DirEntry>() == 16);

/// Number of blocks a file of `size` bytes occupies.
#[must_use]
pub fn blocks_for(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE as u64)
}

/// Where file-relative block `fbi` lives in an inode's reference tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPath {
    /// `direct[i]`
    Direct { slot: usize },
    /// `indirect[idx]`
    Indirect { idx: usize },
    /// `dindirect[slot][outer][inner]`
    DoubleIndirect { slot: usize, outer: usize, inner: usize },
}

impl BlockPath {
    /// Resolves a file-relative block index into the inode tree.
    pub fn of(fbi: u64) -> Result<Self, KtfsError> {
        let fbi = usize::try_from(fbi).map_err(|_| KtfsError::FileTooLarge)?;
        if fbi < NUM_DIRECT {
            return Ok(Self::Direct { slot: fbi });
        }
        let fbi = fbi - NUM_DIRECT;
        if fbi < REFS_PER_BLOCK {
            return Ok(Self::Indirect { idx: fbi });
        }
        let fbi = fbi - REFS_PER_BLOCK;
        let per_dind = REFS_PER_BLOCK * REFS_PER_BLOCK;
        let slot = fbi / per_dind;
        if slot >= NUM_DINDIRECT {
            return Err(KtfsError::FileTooLarge);
        }
        Ok(Self::DoubleIndirect {
            slot,
            outer: fbi % per_dind / REFS_PER_BLOCK,
            inner: fbi % REFS_PER_BLOCK,
        })
    }
}

/// A 16-byte directory entry: inode number plus a NUL-padded name.
///
/// A name that uses all 14 bytes carries no terminator.
#[derive(Debug, Clone, Copy, Pod)]
#[repr(C)]
pub struct DirEntry {
    pub inode: u16,
    pub name: [u8; MAX_NAME_LEN],
}

impl DirEntry {
    /// Builds an entry, truncating `name` to 14 bytes.
    #[must_use]
    pub fn new(inode: u16, name: &[u8]) -> Self {
        let mut entry = Self {
            inode,
            name: [0; MAX_NAME_LEN],
        };
        let len = name.len().min(MAX_NAME_LEN);
        entry.name[..len].copy_from_slice(&name[..len]);
        entry
    }

    /// The stored name, without padding.
    #[must_use]
    pub fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_NAME_LEN);
        &self.name[..len]
    }

    /// Length-capped name comparison, as the directory scan uses it.
    #[must_use]
    pub fn is_named(&self, name: &[u8]) -> bool {
        !name.is_empty() && self.name() == &name[..name.len().min(MAX_NAME_LEN)]
    }
}

/// One block of the allocation bitmap, LSB-first within each byte.
#[derive(Pod)]
#[repr(transparent)]
pub struct BitmapBlock(pub [u8; BLOCK_SIZE]);

impl BitmapBlock {
    /// Whether bit `n` of this block is set.
    #[must_use]
    pub fn is_set(&self, n: usize) -> bool {
        self.0[n / 8] & (1 << (n % 8)) != 0
    }

    /// Sets bit `n`.
    pub fn set(&mut self, n: usize) {
        self.0[n / 8] |= 1 << (n % 8);
    }

    /// Clears bit `n`.
    pub fn clear(&mut self, n: usize) {
        self.0[n / 8] &= !(1 << (n % 8));
    }

    /// Index of the first zero bit among the first `limit` bits.
    #[must_use]
    pub fn first_clear(&self, limit: usize) -> Option<usize> {
        (0..limit.min(BITS_PER_BLOCK)).find(|&n| !self.is_set(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry() {
        let sb = SuperBlock {
            block_count: 2048,
            bitmap_block_count: 1,
            inode_block_count: 2,
            root_directory_inode: 0,
            _pad: 0,
        };
        sb.validate().unwrap();
        assert_eq!(sb.inode_start(), 2);
        assert_eq!(sb.data_start(), 4);
        assert_eq!(sb.inode_count(), 32);
        assert_eq!(sb.inode_block(17), 3);
        assert_eq!(sb.inode_offset(17), 32);
        assert_eq!(sb.data_block(5), 9);
    }

    #[test]
    fn bad_geometry_is_rejected() {
        let mut sb = SuperBlock {
            block_count: 2048,
            bitmap_block_count: 0,
            inode_block_count: 2,
            root_directory_inode: 0,
            _pad: 0,
        };
        // bitmap too small to cover the image
        assert_eq!(sb.validate(), Err(KtfsError::BadFormat));
        sb.bitmap_block_count = 1;
        sb.root_directory_inode = 40;
        assert_eq!(sb.validate(), Err(KtfsError::BadFormat));
    }

    #[test]
    fn block_paths() {
        assert_eq!(BlockPath::of(0).unwrap(), BlockPath::Direct { slot: 0 });
        assert_eq!(BlockPath::of(2).unwrap(), BlockPath::Direct { slot: 2 });
        assert_eq!(BlockPath::of(3).unwrap(), BlockPath::Indirect { idx: 0 });
        assert_eq!(
            BlockPath::of(3 + 127).unwrap(),
            BlockPath::Indirect { idx: 127 }
        );
        assert_eq!(
            BlockPath::of(3 + 128).unwrap(),
            BlockPath::DoubleIndirect {
                slot: 0,
                outer: 0,
                inner: 0
            }
        );
        assert_eq!(
            BlockPath::of(3 + 128 + 128 * 128).unwrap(),
            BlockPath::DoubleIndirect {
                slot: 1,
                outer: 0,
                inner: 0
            }
        );
        let last = (MAX_FILE_BLOCKS - 1) as u64;
        assert_eq!(
            BlockPath::of(last).unwrap(),
            BlockPath::DoubleIndirect {
                slot: 1,
                outer: 127,
                inner: 127
            }
        );
        assert_eq!(
            BlockPath::of(MAX_FILE_BLOCKS as u64),
            Err(KtfsError::FileTooLarge)
        );
    }

    #[test]
    fn dentry_names() {
        let e = DirEntry::new(3, b"hello.txt");
        assert_eq!(e.name(), b"hello.txt");
        assert!(e.is_named(b"hello.txt"));
        assert!(!e.is_named(b"hello.tx"));
        assert!(!e.is_named(b""));

        // 14-byte name fills the field with no terminator
        let e = DirEntry::new(4, b"fourteen-bytes");
        assert_eq!(e.name(), b"fourteen-bytes");
        assert!(e.is_named(b"fourteen-bytes"));
        // a longer lookup name matches on its 14-byte prefix
        assert!(e.is_named(b"fourteen-bytes-and-more"));
    }

    #[test]
    fn bitmap_bits() {
        let mut b = BitmapBlock([0; BLOCK_SIZE]);
        assert_eq!(b.first_clear(4096), Some(0));
        b.set(0);
        b.set(1);
        b.set(9);
        assert!(b.is_set(9));
        assert_eq!(b.first_clear(4096), Some(2));
        b.clear(1);
        assert_eq!(b.first_clear(4096), Some(1));
        assert_eq!(b.first_clear(1), None);
    }
}
