//! A write-back LRU cache translating filesystem blocks into sector runs.

use super::device::{DeviceStatus, SectorDevice, SECTOR_SIZE};
use alloc::vec;
use alloc::vec::Vec;

/// Number of cached blocks
pub const CACHE_SIZE: usize = 32;

/// Marker for a slot holding no block
const NO_BLOCK: u32 = u32::MAX;

/// One cached block
struct CacheEntry {
    /// Which block the slot holds, or `NO_BLOCK`
    block_number: u32,
    /// Whether the slot is newer than the device copy
    dirty: bool,
    /// Recency stamp for the LRU policy
    last_access: u64,
    /// The block's bytes
    data: Vec<u8>,
}

/// A block-sized view of a sector device, with caching.
///
/// At most one entry exists per block number. A write smaller than a block
/// is a read-modify-write: the block is loaded if absent, patched in place
/// and marked dirty. Dirty entries go back to the device on eviction or
/// through [`Self::flush_cache`].
pub struct BlockCache<D: SectorDevice> {
    /// The underlying device
    device: D,
    /// Bytes per filesystem block
    block_size: usize,
    /// The fixed array of cache slots
    entries: Vec<CacheEntry>,
    /// Monotonic counter stamping each access
    access_counter: u64,
}

impl<D: SectorDevice> BlockCache<D> {
    /// Wraps a device, caching blocks of `block_size` bytes (a multiple of
    /// the sector size)
    pub fn new(device: D, block_size: usize) -> Self {
        assert_eq!(block_size % SECTOR_SIZE, 0);
        Self {
            device,
            block_size,
            entries: (0..CACHE_SIZE)
                .map(|_| CacheEntry {
                    block_number: NO_BLOCK,
                    dirty: false,
                    last_access: 0,
                    data: vec![0; block_size],
                })
                .collect(),
            access_counter: 0,
        }
    }

    /// The configured block size
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Flushes everything and returns the device, for remounting at a
    /// different block size
    pub fn into_device(mut self) -> Result<D, DeviceStatus> {
        self.flush_cache()?;
        Ok(self.device)
    }

    /// The first sector of the given block
    fn first_sector(&self, block_number: u32) -> u32 {
        block_number * (self.block_size / SECTOR_SIZE) as u32
    }

    /// Stamps and returns the slot index holding `block_number`, if cached
    fn find_cached(&mut self, block_number: u32) -> Option<usize> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.block_number == block_number)?;
        self.access_counter += 1;
        self.entries[index].last_access = self.access_counter;
        Some(index)
    }

    /// The least recently used slot
    fn lru_index(&self) -> usize {
        self.entries
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(index, _)| index)
            .expect("The cache always has entries")
    }

    /// Writes the slot back to the device if it is dirty
    fn flush_entry(&mut self, index: usize) -> Result<(), DeviceStatus> {
        let entry = &mut self.entries[index];
        if entry.dirty && entry.block_number != NO_BLOCK {
            let sector = entry.block_number * (self.block_size / SECTOR_SIZE) as u32;
            self.device
                .write(sector, (self.block_size / SECTOR_SIZE) as u32, &entry.data)?;
            self.entries[index].dirty = false;
        }
        Ok(())
    }

    /// Ensures `block_number` is resident, evicting the LRU slot if needed,
    /// and returns its index
    fn load(&mut self, block_number: u32) -> Result<usize, DeviceStatus> {
        if let Some(index) = self.find_cached(block_number) {
            return Ok(index);
        }
        let index = self.lru_index();
        self.flush_entry(index)?;

        let sector = self.first_sector(block_number);
        let count = (self.block_size / SECTOR_SIZE) as u32;
        self.device.read(sector, count, &mut self.entries[index].data)?;

        self.access_counter += 1;
        let entry = &mut self.entries[index];
        entry.block_number = block_number;
        entry.dirty = false;
        entry.last_access = self.access_counter;
        Ok(index)
    }

    /// Copies one whole block into `buffer`
    pub fn read_block(&mut self, block_number: u32, buffer: &mut [u8]) -> Result<(), DeviceStatus> {
        let index = self.load(block_number)?;
        buffer[..self.block_size].copy_from_slice(&self.entries[index].data);
        Ok(())
    }

    /// Overwrites `n` bytes of the block starting at `offset` within it
    pub fn write_block(
        &mut self,
        block_number: u32,
        buffer: &[u8],
        offset: usize,
        n: usize,
    ) -> Result<(), DeviceStatus> {
        assert!(offset + n <= self.block_size);
        let index = self.load(block_number)?;
        let entry = &mut self.entries[index];
        entry.data[offset..offset + n].copy_from_slice(&buffer[..n]);
        entry.dirty = true;
        Ok(())
    }

    /// Reads `buffer.len()` bytes starting at the absolute byte `offset`
    pub fn read_all(&mut self, offset: u64, buffer: &mut [u8]) -> Result<(), DeviceStatus> {
        let mut position = offset;
        let mut transferred = 0_usize;
        while transferred < buffer.len() {
            let block = u32::try_from(position / self.block_size as u64)
                .map_err(|_| DeviceStatus::Error)?;
            let within = (position % self.block_size as u64) as usize;
            let chunk = usize::min(self.block_size - within, buffer.len() - transferred);

            let index = self.load(block)?;
            buffer[transferred..transferred + chunk]
                .copy_from_slice(&self.entries[index].data[within..within + chunk]);

            position += chunk as u64;
            transferred += chunk;
        }
        Ok(())
    }

    /// Writes `buffer` starting at the absolute byte `offset`
    pub fn write_all(&mut self, offset: u64, buffer: &[u8]) -> Result<(), DeviceStatus> {
        let mut position = offset;
        let mut transferred = 0_usize;
        while transferred < buffer.len() {
            let block = u32::try_from(position / self.block_size as u64)
                .map_err(|_| DeviceStatus::Error)?;
            let within = (position % self.block_size as u64) as usize;
            let chunk = usize::min(self.block_size - within, buffer.len() - transferred);

            self.write_block(block, &buffer[transferred..transferred + chunk], within, chunk)?;

            position += chunk as u64;
            transferred += chunk;
        }
        Ok(())
    }

    /// Writes every dirty entry out
    pub fn flush_cache(&mut self) -> Result<(), DeviceStatus> {
        for index in 0..self.entries.len() {
            self.flush_entry(index)?;
        }
        Ok(())
    }
}
