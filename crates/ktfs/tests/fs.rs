//! Filesystem tests over an in-memory disk.

use std::sync::Mutex;

use ktfs::{BLOCK_SIZE, Block, BlockDevice, FileId, Ktfs, KtfsError, layout};
use mutex_api::StdMutexFamily;

struct MemDisk(Mutex<Vec<Block>>);

impl MemDisk {
    fn new(blocks: usize) -> Self {
        Self(Mutex::new(vec![[0; BLOCK_SIZE]; blocks]))
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, index: u64, data: &mut Block) -> Result<(), KtfsError> {
        *data = *self
            .0
            .lock()
            .unwrap()
            .get(index as usize)
            .ok_or(KtfsError::Disk)?;
        Ok(())
    }

    fn write_block(&self, index: u64, data: &Block) -> Result<(), KtfsError> {
        *self
            .0
            .lock()
            .unwrap()
            .get_mut(index as usize)
            .ok_or(KtfsError::Disk)? = *data;
        Ok(())
    }
}

type Fs = Ktfs<MemDisk, StdMutexFamily>;

const TOTAL_BLOCKS: u32 = 2048;
const INODE_BLOCKS: u32 = 2;

fn fresh_fs() -> Fs {
    let disk = MemDisk::new(TOTAL_BLOCKS as usize);
    Fs::format(&disk, TOTAL_BLOCKS, INODE_BLOCKS).unwrap();
    Fs::mount(disk, 16).unwrap()
}

fn open(fs: &Fs, name: &str) -> (FileId, u64) {
    fs.open(name.as_bytes()).unwrap()
}

#[test]
fn mount_reads_geometry() {
    let fs = fresh_fs();
    let sb = fs.superblock();
    assert_eq!(sb.block_count, TOTAL_BLOCKS);
    assert_eq!(sb.inode_block_count, INODE_BLOCKS);
    assert_eq!(sb.root_directory_inode, 0);
    // only the metadata blocks are taken on a fresh image
    assert_eq!(fs.allocated_blocks().unwrap(), sb.data_start());
}

#[test]
fn create_then_open_yields_empty_file() {
    let fs = fresh_fs();
    for name in ["a", "b", "c"] {
        fs.create(name.as_bytes()).unwrap();
    }
    for name in ["a", "b", "c"] {
        let (id, size) = open(&fs, name);
        assert_eq!(size, 0);
        fs.close(id);
    }
}

#[test]
fn open_missing_file_fails() {
    let fs = fresh_fs();
    assert_eq!(fs.open(b"nope"), Err(KtfsError::NotFound));
    assert_eq!(fs.open(b""), Err(KtfsError::NotFound));
}

#[test]
fn double_open_is_rejected_until_close() {
    let fs = fresh_fs();
    fs.create(b"f").unwrap();
    let (id, _) = open(&fs, "f");
    assert_eq!(fs.open(b"f"), Err(KtfsError::AlreadyOpen));
    fs.close(id);
    let (id, _) = open(&fs, "f");
    fs.close(id);
}

#[test]
fn write_then_read_round_trip() {
    let fs = fresh_fs();
    fs.create(b"f").unwrap();
    let (id, _) = open(&fs, "f");

    let data = b"Hello, KTFS!";
    assert_eq!(fs.writeat(id, 0, data).unwrap(), data.len());
    let mut buf = [0; 32];
    assert_eq!(fs.readat(id, 0, &mut buf).unwrap(), data.len());
    assert_eq!(&buf[..data.len()], data);

    // overwrite in the middle, as in the seed scenario
    fs.writeat(id, 2, b"bye").unwrap();
    let mut buf = [0; 5];
    assert_eq!(fs.readat(id, 0, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"Hebye");
}

#[test]
fn read_boundaries() {
    let fs = fresh_fs();
    fs.create(b"f").unwrap();
    let (id, _) = open(&fs, "f");
    fs.writeat(id, 0, b"12345").unwrap();

    // zero-length read
    assert_eq!(fs.readat(id, 0, &mut []).unwrap(), 0);
    // at end, and past end
    assert_eq!(fs.readat(id, 5, &mut [0; 4]).unwrap(), 0);
    assert_eq!(fs.readat(id, 99, &mut [0; 4]).unwrap(), 0);
    // clipped read
    let mut buf = [0; 16];
    assert_eq!(fs.readat(id, 3, &mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"45");
}

#[test]
fn write_crossing_end_extends() {
    let fs = fresh_fs();
    fs.create(b"f").unwrap();
    let (id, _) = open(&fs, "f");

    fs.writeat(id, 0, &[7; 100]).unwrap();
    assert_eq!(fs.end(id).unwrap(), 100);
    // crosses the old end: file must grow to 80 + 200
    fs.writeat(id, 80, &[9; 200]).unwrap();
    assert_eq!(fs.end(id).unwrap(), 280);

    let mut buf = vec![0; 280];
    assert_eq!(fs.readat(id, 0, &mut buf).unwrap(), 280);
    assert!(buf[..80].iter().all(|&b| b == 7));
    assert!(buf[80..].iter().all(|&b| b == 9));

    // a write starting past the end is not a hole-punch
    assert_eq!(fs.writeat(id, 300, b"x"), Err(KtfsError::InvalidArgument));
}

#[test]
fn set_end_then_write_then_read() {
    let fs = fresh_fs();
    fs.create(b"wow").unwrap();
    let (id, _) = open(&fs, "wow");

    fs.set_end(id, 3).unwrap();
    assert_eq!(fs.end(id).unwrap(), 3);
    fs.writeat(id, 0, b"wow").unwrap();
    let mut buf = [0; 3];
    fs.readat(id, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"wow");

    fs.close(id);
    fs.delete(b"wow").unwrap();
    assert_eq!(fs.open(b"wow"), Err(KtfsError::NotFound));
}

#[test]
fn large_file_through_indirect_and_double_indirect() {
    let fs = fresh_fs();
    fs.create(b"big").unwrap();
    let (id, _) = open(&fs, "big");

    // spans direct (3), all of the indirect (128), and into double-indirect
    let blocks = layout::NUM_DIRECT + layout::REFS_PER_BLOCK + 5;
    let len = blocks * BLOCK_SIZE;
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    assert_eq!(fs.writeat(id, 0, &data).unwrap(), len);

    let mut buf = vec![0; len];
    assert_eq!(fs.readat(id, 0, &mut buf).unwrap(), len);
    assert_eq!(buf, data);

    // spot-check an unaligned read deep in the double-indirect region
    let pos = (layout::NUM_DIRECT + layout::REFS_PER_BLOCK) * BLOCK_SIZE + 77;
    let mut small = [0; 13];
    assert_eq!(fs.readat(id, pos as u64, &mut small).unwrap(), 13);
    assert_eq!(&small, &data[pos..pos + 13]);
}

#[test]
fn bitmap_conservation_across_delete() {
    let fs = fresh_fs();
    let baseline = fs.allocated_blocks().unwrap();

    fs.create(b"big").unwrap();
    let (id, _) = open(&fs, "big");
    let blocks = layout::NUM_DIRECT + layout::REFS_PER_BLOCK + 5;
    fs.set_end(id, (blocks * BLOCK_SIZE) as u64).unwrap();

    // data blocks + 1 indirect + 1 dindirect + 1 outer-indirect + 1 dir block
    let expected = baseline + blocks as u64 + 3 + 1;
    assert_eq!(fs.allocated_blocks().unwrap(), expected);

    fs.close(id);
    fs.delete(b"big").unwrap();
    // the directory is empty again, so its block came back too
    assert_eq!(fs.allocated_blocks().unwrap(), baseline);
}

#[test]
fn delete_swaps_last_entry_into_place() {
    let fs = fresh_fs();
    for name in ["a", "b", "c", "d"] {
        fs.create(name.as_bytes()).unwrap();
    }
    fs.delete(b"b").unwrap();

    assert_eq!(fs.open(b"b"), Err(KtfsError::NotFound));
    for name in ["a", "c", "d"] {
        let (id, _) = open(&fs, name);
        fs.close(id);
    }
}

#[test]
fn delete_open_file_closes_it_first() {
    let fs = fresh_fs();
    fs.create(b"f").unwrap();
    let (id, _) = open(&fs, "f");
    fs.writeat(id, 0, b"data").unwrap();

    fs.delete(b"f").unwrap();
    // the handle is dead and the name is gone
    assert_eq!(fs.readat(id, 0, &mut [0; 4]), Err(KtfsError::BadHandle));
    assert_eq!(fs.open(b"f"), Err(KtfsError::NotFound));
}

#[test]
fn delete_then_create_same_name() {
    let fs = fresh_fs();
    fs.create(b"f").unwrap();
    let (id, _) = open(&fs, "f");
    fs.writeat(id, 0, b"old contents").unwrap();
    fs.close(id);

    fs.delete(b"f").unwrap();
    fs.create(b"f").unwrap();
    let (id, size) = open(&fs, "f");
    assert_eq!(size, 0);
    fs.close(id);
}

#[test]
fn create_duplicate_name_fails() {
    let fs = fresh_fs();
    fs.create(b"f").unwrap();
    assert_eq!(fs.create(b"f"), Err(KtfsError::AlreadyExists));
}

#[test]
fn directory_fills_at_capacity() {
    let disk = MemDisk::new(TOTAL_BLOCKS as usize);
    // enough inodes (8 * 16 = 128) that the directory limit hits first
    Fs::format(&disk, TOTAL_BLOCKS, 8).unwrap();
    let fs = Fs::mount(disk, 16).unwrap();
    let max = layout::NUM_DIRECT * layout::DENTRIES_PER_BLOCK;
    for i in 0..max {
        fs.create(format!("f{i}").as_bytes()).unwrap();
    }
    assert_eq!(fs.create(b"straw"), Err(KtfsError::DirectoryFull));
}

#[test]
fn inode_exhaustion() {
    let disk = MemDisk::new(TOTAL_BLOCKS as usize);
    // a single inode block: 16 inodes, one of which is the root directory
    Fs::format(&disk, TOTAL_BLOCKS, 1).unwrap();
    let fs = Fs::mount(disk, 16).unwrap();

    for i in 0..15 {
        fs.create(format!("f{i}").as_bytes()).unwrap();
    }
    assert_eq!(fs.create(b"onemore"), Err(KtfsError::NoInodeBlocks));
}

#[test]
fn data_block_exhaustion() {
    let disk = MemDisk::new(16);
    Fs::format(&disk, 16, 1).unwrap();
    let fs = Fs::mount(disk, 4).unwrap();
    // data region: 16 - (1 super + 1 bitmap + 1 inode) = 13 blocks, one of
    // which goes to the directory
    fs.create(b"f").unwrap();
    let (id, _) = open(&fs, "f");
    assert_eq!(
        fs.set_end(id, 13 * BLOCK_SIZE as u64),
        Err(KtfsError::NoDataBlocks)
    );
}

#[test]
fn shrink_keeps_contents_prefix() {
    let fs = fresh_fs();
    fs.create(b"f").unwrap();
    let (id, _) = open(&fs, "f");
    fs.writeat(id, 0, b"0123456789").unwrap();
    fs.set_end(id, 4).unwrap();
    assert_eq!(fs.end(id).unwrap(), 4);
    let mut buf = [0; 10];
    assert_eq!(fs.readat(id, 0, &mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"0123");
}
