//! The block cache.
//!
//! A fixed-capacity pool of [`BLOCK_SIZE`] buffers in front of a
//! [`BlockDevice`]. Each buffer carries its own lock, so operations on
//! different blocks proceed in parallel; the table itself is locked only
//! long enough to find or recycle an entry.
//!
//! Eviction is LRU by *release tick*: a monotonic counter stamped on an
//! entry each time its last holder lets go. A held entry carries the
//! sentinel [`IN_USE`] and is never recycled. Dirty releases write through
//! to the device synchronously, so a flush has nothing to do.

use alloc::{boxed::Box, vec::Vec};
use core::{
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use dataview::{Pod, PodMethods as _};
use mutex_api::{Mutex, MutexFamily};

use crate::{BLOCK_SIZE, Block, BlockDevice, KtfsError};

/// Release-tick value of an entry that is currently held.
const IN_USE: u64 = u64::MAX;

pub struct BlockCache<D, F>
where
    F: MutexFamily,
{
    device: D,
    capacity: usize,
    table: F::Mutex<Table<F>>,
}

struct Table<F>
where
    F: MutexFamily,
{
    entries: Vec<Entry<F>>,
    /// Next release tick to hand out.
    tick: u64,
}

struct Entry<F>
where
    F: MutexFamily,
{
    /// Backing-device block this entry holds.
    index: u64,
    /// Current holders. Entries with holders are never recycled.
    refcnt: u32,
    /// LRU key; [`IN_USE`] while `refcnt > 0`.
    release_tick: u64,
    /// Boxed so the slot address survives table growth.
    slot: Box<Slot<F>>,
}

struct Slot<F>
where
    F: MutexFamily,
{
    /// Whether `data` holds the block's bytes.
    valid: AtomicBool,
    data: F::Mutex<Block>,
}

impl<D, F> BlockCache<D, F>
where
    D: BlockDevice,
    F: MutexFamily,
{
    pub fn new(device: D, capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            device,
            capacity,
            table: F::Mutex::new(Table {
                entries: Vec::new(),
                tick: 0,
            }),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Returns the block at `index`, locked and filled from the device.
    ///
    /// Blocks if another holder has the same block. A concurrent holder of a
    /// *different* block is not waited on.
    ///
    /// # Panics
    ///
    /// Panics if every cached block is currently held.
    pub fn get(&self, index: u64) -> Result<BlockGuard<'_, D, F>, KtfsError> {
        let slot: *const Slot<F> = {
            let mut table = self.table.lock();
            let found = table.entries.iter().position(|e| e.index == index);
            match found {
                Some(i) => {
                    let entry = &mut table.entries[i];
                    entry.refcnt += 1;
                    entry.release_tick = IN_USE;
                    &*entry.slot
                }
                None if table.entries.len() < self.capacity => {
                    table.entries.push(Entry {
                        index,
                        refcnt: 1,
                        release_tick: IN_USE,
                        slot: Box::new(Slot {
                            valid: AtomicBool::new(false),
                            data: F::Mutex::new([0; BLOCK_SIZE]),
                        }),
                    });
                    &*table.entries.last().unwrap().slot
                }
                None => {
                    let victim = table
                        .entries
                        .iter_mut()
                        .filter(|e| e.refcnt == 0)
                        .min_by_key(|e| e.release_tick)
                        .expect("block cache exhausted");
                    victim.index = index;
                    victim.refcnt = 1;
                    victim.release_tick = IN_USE;
                    victim.slot.valid.store(false, Ordering::Relaxed);
                    &*victim.slot
                }
            }
        };

        // The entry's refcnt pins the slot: entries are recycled in place and
        // only while refcnt == 0, so the box outlives this guard.
        let slot = unsafe { &*slot };
        let mut data = slot.data.lock();
        if !slot.valid.load(Ordering::Acquire) {
            if let Err(e) = self.device.read_block(index, &mut data) {
                drop(data);
                self.put(index);
                return Err(e);
            }
            slot.valid.store(true, Ordering::Release);
        }

        Ok(BlockGuard {
            cache: self,
            index,
            data: Some(data),
        })
    }

    /// Drops one reference to `index`, stamping the LRU tick on the last.
    fn put(&self, index: u64) {
        let mut table = self.table.lock();
        let tick = table.tick;
        let entry = table
            .entries
            .iter_mut()
            .find(|e| e.index == index)
            .expect("released block not in cache");
        assert!(entry.refcnt > 0);
        entry.refcnt -= 1;
        if entry.refcnt == 0 {
            entry.release_tick = tick;
            table.tick += 1;
        }
    }

    /// Write-back is synchronous on release; nothing is pending.
    pub fn flush(&self) -> Result<(), KtfsError> {
        Ok(())
    }
}

/// A locked cached block.
///
/// Dropping the guard releases the block clean; [`BlockGuard::release_dirty`]
/// writes it through to the device first.
pub struct BlockGuard<'a, D, F>
where
    D: BlockDevice,
    F: MutexFamily,
{
    cache: &'a BlockCache<D, F>,
    index: u64,
    data: Option<<F::Mutex<Block> as Mutex>::Guard<'a>>,
}

impl<D, F> BlockGuard<'_, D, F>
where
    D: BlockDevice,
    F: MutexFamily,
{
    /// Absolute block number this guard holds.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Copies a value of type `T` out of the block at `offset`.
    ///
    /// Copying instead of referencing sidesteps the buffer's byte alignment.
    pub fn copy_at<T: Pod>(&self, offset: usize) -> T {
        self.as_bytes().as_data_view().read(offset)
    }

    /// Writes a value of type `T` into the block at `offset`.
    pub fn write_at<T: Pod>(&mut self, offset: usize, value: &T) {
        self.as_bytes_mut().as_data_view_mut().write(offset, value);
    }

    fn as_bytes(&self) -> &Block {
        self.data.as_ref().unwrap()
    }

    fn as_bytes_mut(&mut self) -> &mut Block {
        self.data.as_mut().unwrap()
    }

    /// Writes the buffer through to the device, then releases the block.
    pub fn release_dirty(self) -> Result<(), KtfsError> {
        let res = self
            .cache
            .device
            .write_block(self.index, self.data.as_ref().unwrap());
        drop(self);
        res
    }
}

impl<D, F> Deref for BlockGuard<'_, D, F>
where
    D: BlockDevice,
    F: MutexFamily,
{
    type Target = Block;

    fn deref(&self) -> &Block {
        self.as_bytes()
    }
}

impl<D, F> DerefMut for BlockGuard<'_, D, F>
where
    D: BlockDevice,
    F: MutexFamily,
{
    fn deref_mut(&mut self) -> &mut Block {
        self.as_bytes_mut()
    }
}

impl<D, F> Drop for BlockGuard<'_, D, F>
where
    D: BlockDevice,
    F: MutexFamily,
{
    fn drop(&mut self) {
        drop(self.data.take());
        self.cache.put(self.index);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex as HostMutex,
        atomic::{AtomicUsize, Ordering},
    };

    use mutex_api::StdMutexFamily;

    use super::*;

    struct MockDevice {
        blocks: HostMutex<Vec<Block>>,
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    impl MockDevice {
        fn new(n: usize) -> Self {
            Self {
                blocks: HostMutex::new(vec![[0; BLOCK_SIZE]; n]),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            }
        }

        fn fill(&self, index: usize, byte: u8) {
            self.blocks.lock().unwrap()[index] = [byte; BLOCK_SIZE];
        }
    }

    impl BlockDevice for MockDevice {
        fn read_block(&self, index: u64, data: &mut Block) -> Result<(), KtfsError> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            *data = self.blocks.lock().unwrap()[index as usize];
            Ok(())
        }

        fn write_block(&self, index: u64, data: &Block) -> Result<(), KtfsError> {
            self.writes.fetch_add(1, Ordering::Relaxed);
            self.blocks.lock().unwrap()[index as usize] = *data;
            Ok(())
        }
    }

    type Cache = BlockCache<MockDevice, StdMutexFamily>;

    #[test]
    fn read_is_cached() {
        let dev = MockDevice::new(8);
        dev.fill(3, 0xab);
        let cache = Cache::new(dev, 4);

        let b = cache.get(3).unwrap();
        assert_eq!(b[0], 0xab);
        drop(b);
        let b = cache.get(3).unwrap();
        assert_eq!(b[100], 0xab);
        drop(b);

        assert_eq!(cache.device().reads.load(Ordering::Relaxed), 1);
        assert_eq!(cache.device().writes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn dirty_release_writes_through() {
        let dev = MockDevice::new(8);
        let cache = Cache::new(dev, 4);

        let mut b = cache.get(2).unwrap();
        b[0] = 0x5a;
        b.release_dirty().unwrap();

        assert_eq!(cache.device().writes.load(Ordering::Relaxed), 1);
        assert_eq!(cache.device().blocks.lock().unwrap()[2][0], 0x5a);

        // the cached copy stays current: no re-read
        let b = cache.get(2).unwrap();
        assert_eq!(b[0], 0x5a);
        drop(b);
        assert_eq!(cache.device().reads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn evicts_least_recently_released() {
        let dev = MockDevice::new(16);
        let cache = Cache::new(dev, 3);

        // release order 0, 1, 2 => LRU order 0, 1, 2
        for i in 0..3 {
            drop(cache.get(i).unwrap());
        }
        // touch 0 so 1 becomes the eviction candidate
        drop(cache.get(0).unwrap());
        assert_eq!(cache.device().reads.load(Ordering::Relaxed), 3);

        drop(cache.get(9).unwrap()); // evicts 1
        drop(cache.get(0).unwrap()); // still cached
        drop(cache.get(2).unwrap()); // still cached
        assert_eq!(cache.device().reads.load(Ordering::Relaxed), 4);

        drop(cache.get(1).unwrap()); // was evicted, re-read
        assert_eq!(cache.device().reads.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn held_blocks_are_not_recycled() {
        let dev = MockDevice::new(16);
        let cache = Cache::new(dev, 2);

        let held = cache.get(0).unwrap();
        drop(cache.get(1).unwrap());
        // only block 1 may be recycled
        drop(cache.get(2).unwrap());
        drop(held);

        let b = cache.get(0).unwrap();
        drop(b);
        // block 0 stayed resident the whole time
        assert_eq!(cache.device().reads.load(Ordering::Relaxed), 3);
    }

    #[test]
    #[should_panic(expected = "block cache exhausted")]
    fn exhaustion_panics() {
        let dev = MockDevice::new(16);
        let cache = Cache::new(dev, 2);
        let _a = cache.get(0).unwrap();
        let _b = cache.get(1).unwrap();
        let _c = cache.get(2);
    }
}
