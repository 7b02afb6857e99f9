//! The sector-device contract the storage stack is built over.

use alloc::vec;
use alloc::vec::Vec;

/// The fixed sector size of every supported device
pub const SECTOR_SIZE: usize = 512;

/// Outcome of a device operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum DeviceStatus {
    /// The device is ready
    #[display(fmt = "success")]
    Success,
    /// A bounded wait expired; the caller decides whether to retry
    #[display(fmt = "timed out")]
    Timeout,
    /// The device rejected the bring-up handshake
    #[display(fmt = "handshake failed")]
    Fail,
    /// The device reported a hard error
    #[display(fmt = "hard error")]
    Error,
}

/// A device moving fixed 512-byte sectors
pub trait SectorDevice {
    /// Brings the device up; everything else requires `Success` first
    fn init(&mut self) -> DeviceStatus;

    /// Reads `count` sectors starting at `start_sector` into `buffer`,
    /// returning the bytes transferred
    fn read(
        &mut self,
        start_sector: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<usize, DeviceStatus>;

    /// Writes `count` sectors starting at `start_sector` from `buffer`,
    /// returning the bytes transferred
    fn write(&mut self, start_sector: u32, count: u32, buffer: &[u8])
        -> Result<usize, DeviceStatus>;
}

/// A memory-backed sector device, for tests and volume experiments
pub struct RamDisk {
    /// The backing bytes, a whole number of sectors
    storage: Vec<u8>,
}

impl RamDisk {
    /// Creates a zeroed disk of `sector_count` sectors
    pub fn new(sector_count: usize) -> Self {
        Self {
            storage: vec![0; sector_count * SECTOR_SIZE],
        }
    }

    /// Wraps existing contents, padding to a sector boundary
    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        let padded = bytes.len().div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        bytes.resize(padded, 0);
        Self { storage: bytes }
    }

    /// A view of the raw contents, for inspection
    pub fn bytes(&self) -> &[u8] {
        &self.storage
    }

    /// The byte range backing the given sector run
    fn range(&self, start_sector: u32, count: u32) -> Result<core::ops::Range<usize>, DeviceStatus> {
        let start = start_sector as usize * SECTOR_SIZE;
        let end = start + count as usize * SECTOR_SIZE;
        if end > self.storage.len() {
            return Err(DeviceStatus::Error);
        }
        Ok(start..end)
    }
}

impl SectorDevice for RamDisk {
    fn init(&mut self) -> DeviceStatus {
        DeviceStatus::Success
    }

    fn read(
        &mut self,
        start_sector: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<usize, DeviceStatus> {
        let range = self.range(start_sector, count)?;
        buffer[..range.len()].copy_from_slice(&self.storage[range.clone()]);
        Ok(range.len())
    }

    fn write(
        &mut self,
        start_sector: u32,
        count: u32,
        buffer: &[u8],
    ) -> Result<usize, DeviceStatus> {
        let range = self.range(start_sector, count)?;
        let len = range.len();
        self.storage[range].copy_from_slice(&buffer[..len]);
        Ok(len)
    }
}
