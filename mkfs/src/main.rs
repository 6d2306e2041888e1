//! Builds a KTFS image: `mkfs fs.img [files...]`.
//!
//! The image gets a fixed geometry (4096 blocks, 64 inodes) and one root
//! directory entry per input file, named by the file's basename.

use std::{
    env,
    fs::{File, OpenOptions},
    io::{self, Read},
    os::unix::fs::FileExt,
    path::Path,
    process,
};

use ktfs::{BLOCK_SIZE, Block, BlockDevice, Ktfs, KtfsError};
use mutex_api::StdMutexFamily;

/// Image size in blocks (2 MiB).
const TOTAL_BLOCKS: u32 = 4096;
/// Inode-table blocks (16 inodes each).
const INODE_BLOCKS: u32 = 4;
/// Cache is pointless against a host file; keep it minimal.
const CACHE_BLOCKS: usize = 8;

/// A host file addressed in KTFS blocks.
pub struct FileDisk(File);

impl BlockDevice for FileDisk {
    fn read_block(&self, index: u64, data: &mut Block) -> Result<(), KtfsError> {
        self.0
            .read_exact_at(data, index * BLOCK_SIZE as u64)
            .map_err(|_| KtfsError::Disk)
    }

    fn write_block(&self, index: u64, data: &Block) -> Result<(), KtfsError> {
        self.0
            .write_all_at(data, index * BLOCK_SIZE as u64)
            .map_err(|_| KtfsError::Disk)
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let Some(image) = args.get(1) else {
        eprintln!("Usage: {} fs.img [files...]", args[0]);
        process::exit(1);
    };

    if let Err(e) = build_image(Path::new(image), &args[2..]) {
        eprintln!("mkfs: {e}");
        process::exit(1);
    }
}

fn build_image(image: &Path, contents: &[String]) -> io::Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(image)?;
    file.set_len(u64::from(TOTAL_BLOCKS) * BLOCK_SIZE as u64)?;

    let disk = FileDisk(file);
    Ktfs::<_, StdMutexFamily>::format(&disk, TOTAL_BLOCKS, INODE_BLOCKS).map_err(to_io)?;
    let fs = Ktfs::<_, StdMutexFamily>::mount(disk, CACHE_BLOCKS).map_err(to_io)?;

    for path in contents {
        let path = Path::new(path);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::other(format!("bad file name: {}", path.display())))?;

        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        add_file(&fs, name.as_bytes(), &data).map_err(to_io)?;
        eprintln!("mkfs: added {} ({} bytes)", name, data.len());
    }

    let sb = fs.superblock();
    eprintln!(
        "mkfs: {} blocks total, {} allocated ({} metadata)",
        sb.block_count,
        fs.allocated_blocks().map_err(to_io)?,
        sb.data_start(),
    );
    Ok(())
}

fn add_file(
    fs: &Ktfs<FileDisk, StdMutexFamily>,
    name: &[u8],
    data: &[u8],
) -> Result<(), KtfsError> {
    fs.create(name)?;
    let (id, _) = fs.open(name)?;
    let res = fs.writeat(id, 0, data).map(|_| ());
    fs.close(id);
    res
}

fn to_io(e: KtfsError) -> io::Error {
    io::Error::other(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    struct TempImage(std::path::PathBuf);

    impl TempImage {
        fn new(tag: &str) -> Self {
            let mut path = env::temp_dir();
            path.push(format!("mkfs-test-{tag}-{}", process::id()));
            Self(path)
        }
    }

    impl Drop for TempImage {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.0);
        }
    }

    fn reopen(path: &Path) -> Ktfs<FileDisk, StdMutexFamily> {
        let file = OpenOptions::new().read(true).write(true).open(path).unwrap();
        Ktfs::mount(FileDisk(file), CACHE_BLOCKS).unwrap()
    }

    #[test]
    fn empty_image_mounts() {
        let img = TempImage::new("empty");
        build_image(&img.0, &[]).unwrap();

        let fs = reopen(&img.0);
        assert_eq!(fs.superblock().block_count, TOTAL_BLOCKS);
        assert_eq!(fs.open(b"anything"), Err(KtfsError::NotFound));
    }

    #[test]
    fn image_contents_round_trip() {
        let img = TempImage::new("contents");
        let hello = TempImage::new("hello-input");
        fs::write(&hello.0, b"Hello").unwrap();

        build_image(&img.0, &[hello.0.to_str().unwrap().to_string()]).unwrap();

        let fs = reopen(&img.0);
        let name = hello.0.file_name().unwrap().to_str().unwrap();
        let (id, size) = fs.open(name.as_bytes()).unwrap();
        assert_eq!(size, 5);
        let mut buf = [0; 5];
        assert_eq!(fs.readat(id, 0, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"Hello");
    }

    #[test]
    fn image_survives_remount_edits() {
        let img = TempImage::new("edits");
        build_image(&img.0, &[]).unwrap();

        {
            let fs = reopen(&img.0);
            add_file(&fs, b"note", b"first").unwrap();
        }
        let fs = reopen(&img.0);
        let (id, size) = fs.open(b"note").unwrap();
        assert_eq!(size, 5);
        let mut buf = [0; 5];
        fs.readat(id, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"first");
    }
}
